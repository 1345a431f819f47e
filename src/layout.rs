//! Layout planning.
//!
//! Scans the program-header table for loadable segments and computes the
//! virtual address span the image occupies. The lowest loadable address is
//! the link-time base; everything in the image is placed relative to it.

use object::elf::{PF_R, PF_W, PF_X, PT_LOAD};
use object::LittleEndian as LE;

use crate::error::{LoadError, Result};
use crate::reader::ProgramHeader;
use crate::utils::page_align;

/// A loadable segment from the program-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the segment's bytes in the file.
    pub file_offset: u64,
    /// Link-time virtual address of the first byte.
    pub virtual_address: u64,
    /// Number of bytes stored in the file.
    pub file_size: u64,
    /// Number of bytes occupied in memory. Never less than `file_size`.
    pub mem_size: u64,
    /// `PF_*` permission bits.
    pub flags: u32,
}

impl Segment {
    fn from_header(ph: &ProgramHeader) -> Result<Self> {
        let segment = Self {
            file_offset: ph.p_offset.get(LE),
            virtual_address: ph.p_vaddr.get(LE),
            file_size: ph.p_filesz.get(LE),
            mem_size: ph.p_memsz.get(LE),
            flags: ph.p_flags.get(LE),
        };
        if segment.mem_size < segment.file_size {
            return Err(LoadError::Format(format!(
                "segment at 0x{:x} has memsz 0x{:x} smaller than filesz 0x{:x}",
                segment.virtual_address, segment.mem_size, segment.file_size
            )));
        }
        Ok(segment)
    }

    /// One past the last virtual address of the in-memory footprint.
    pub fn end(&self) -> Option<u64> {
        self.virtual_address.checked_add(self.mem_size)
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    /// `PROT_*` bits matching the segment's flags.
    pub fn protection(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.flags & PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// The planned memory footprint of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Lowest virtual address of any loadable segment.
    pub min_vaddr: u64,
    /// Highest `p_vaddr + p_memsz` of any loadable segment.
    pub max_vaddr: u64,
    /// Bytes to reserve: the span rounded up to whole pages.
    pub size: u64,
    /// Loadable segments in table order.
    pub segments: Vec<Segment>,
}

impl Layout {
    pub fn plan(headers: &[ProgramHeader]) -> Result<Self> {
        let mut segments = Vec::new();
        let mut min_vaddr = u64::MAX;
        let mut max_vaddr = 0;

        for ph in headers.iter().filter(|ph| ph.p_type.get(LE) == PT_LOAD) {
            let segment = Segment::from_header(ph)?;
            let end = segment.end().ok_or_else(|| {
                LoadError::Format(format!(
                    "segment at 0x{:x} wraps the address space",
                    segment.virtual_address
                ))
            })?;
            min_vaddr = min_vaddr.min(segment.virtual_address);
            max_vaddr = max_vaddr.max(end);
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(LoadError::NoLoadableSegments);
        }

        let size = page_align(max_vaddr - min_vaddr)
            .ok_or_else(|| LoadError::Format("image span overflows".into()))?;
        if size == 0 {
            return Err(LoadError::Format("loadable segments occupy no memory".into()));
        }

        tracing::debug!(
            "planned {} loadable segments: 0x{:x}..0x{:x} ({:#x} bytes)",
            segments.len(),
            min_vaddr,
            max_vaddr,
            size
        );
        Ok(Self {
            min_vaddr,
            max_vaddr,
            size,
            segments,
        })
    }

    /// Offset within the image of a link-time virtual address.
    pub fn offset_of(&self, vaddr: u64) -> Option<u64> {
        vaddr.checked_sub(self.min_vaddr)
    }
}
