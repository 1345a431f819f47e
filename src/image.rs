//! Process image construction.
//!
//! The image moves through three types, one per stage of the load:
//! - [`MappedImage`]: reserved and populated from the file, writable.
//! - [`RelocatedImage`]: relocations applied. Only the relocation pass creates it.
//! - [`ExecutableImage`]: protections sealed. Symbols resolve against this type only.
//!
//! All accesses go through bounds-checked slices over the reservation, so a
//! bad offset in the file surfaces as a format error instead of a stray write.

use std::io::{self, Read, Seek};

use memmap2::MmapMut;

use crate::error::{LoadError, Result};
use crate::layout::Layout;
use crate::reader::read_exact_at;
use crate::utils::{align_down, align_up, PAGE_SIZE};

/// How the image is protected once relocation is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protection {
    /// Each page gets the union of the flags of the segments covering it.
    #[default]
    Segments,
    /// The whole image is readable, writable and executable.
    Rwx,
}

/// An anonymous reservation holding the loadable segments.
pub struct MappedImage {
    map: MmapMut,
    min_vaddr: u64,
}

impl MappedImage {
    /// Reserves `layout.size` bytes at an address chosen by the kernel.
    pub fn reserve(layout: &Layout) -> Result<Self> {
        let size = usize::try_from(layout.size).map_err(|_| LoadError::Resource {
            context: format!("image size {:#x} exceeds the address space", layout.size),
            source: io::ErrorKind::OutOfMemory.into(),
        })?;
        let map = MmapMut::map_anon(size).map_err(|source| LoadError::Resource {
            context: format!("failed to reserve {size:#x} bytes for the image"),
            source,
        })?;
        tracing::debug!("reserved {:#x} bytes at {:p}", size, map.as_ptr());
        Ok(Self {
            map,
            min_vaddr: layout.min_vaddr,
        })
    }

    /// Runtime address of the first byte of the image.
    pub fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Link-time base address of the image.
    pub fn min_vaddr(&self) -> u64 {
        self.min_vaddr
    }

    /// Value added to a link-time address to obtain its runtime address.
    pub fn delta(&self) -> u64 {
        self.base().wrapping_sub(self.min_vaddr)
    }

    fn range(&self, vaddr: u64, len: u64) -> Result<std::ops::Range<usize>> {
        let out_of_bounds = || LoadError::OutOfBounds { vaddr, len };
        let start = vaddr.checked_sub(self.min_vaddr).ok_or_else(out_of_bounds)?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.map.len() as u64 {
            return Err(out_of_bounds());
        }
        Ok(start as usize..end as usize)
    }

    /// Bytes backing `len` bytes at link-time address `vaddr`.
    pub fn slice(&self, vaddr: u64, len: u64) -> Result<&[u8]> {
        let range = self.range(vaddr, len)?;
        Ok(&self.map[range])
    }

    pub fn slice_mut(&mut self, vaddr: u64, len: u64) -> Result<&mut [u8]> {
        let range = self.range(vaddr, len)?;
        Ok(&mut self.map[range])
    }

    /// Reads the little-endian pointer-sized value at `vaddr`.
    pub fn read_u64(&self, vaddr: u64) -> Result<u64> {
        let bytes = self.slice(vaddr, 8)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(value))
    }

    pub fn write_u64(&mut self, vaddr: u64, value: u64) -> Result<()> {
        self.slice_mut(vaddr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Marks relocation as complete. Reserved for the relocation pass.
    pub(crate) fn into_relocated(self) -> RelocatedImage {
        RelocatedImage { image: self }
    }

    fn protect(&mut self, offset: usize, len: usize, prot: libc::c_int) -> Result<()> {
        // SAFETY: offset and len are page multiples inside the reservation, which
        // stays mapped for as long as `self.map` lives.
        let ret = unsafe { libc::mprotect(self.map.as_mut_ptr().add(offset).cast(), len, prot) };
        if ret != 0 {
            return Err(LoadError::Resource {
                context: format!("failed to protect {len:#x} bytes at image offset {offset:#x}"),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Populates a fresh reservation with every loadable segment of `layout`.
///
/// `p_filesz` bytes are copied from the file and the remaining
/// `p_memsz - p_filesz` bytes are zeroed.
pub fn build<R: Read + Seek>(reader: &mut R, layout: &Layout) -> Result<MappedImage> {
    let mut image = MappedImage::reserve(layout)?;

    for segment in &layout.segments {
        let memory = image.slice_mut(segment.virtual_address, segment.mem_size)?;
        let (file_part, zero_part) = memory.split_at_mut(segment.file_size as usize);
        read_exact_at(reader, segment.file_offset, file_part, "segment")?;
        zero_part.fill(0);
        tracing::debug!(
            "copied segment 0x{:x}: {:#x} bytes from file offset 0x{:x}, {:#x} zeroed",
            segment.virtual_address,
            segment.file_size,
            segment.file_offset,
            zero_part.len()
        );
    }

    Ok(image)
}

/// An image whose relocations have all been applied.
pub struct RelocatedImage {
    image: MappedImage,
}

impl RelocatedImage {
    pub fn image(&self) -> &MappedImage {
        &self.image
    }

    /// Applies final protections and hands out the executable image.
    pub fn seal(mut self, layout: &Layout, protection: Protection) -> Result<ExecutableImage> {
        let pages = self.image.len() / PAGE_SIZE as usize;
        let mut page_prot = vec![libc::PROT_NONE; pages];

        match protection {
            Protection::Rwx => page_prot.fill(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC),
            Protection::Segments => {
                for segment in &layout.segments {
                    if segment.mem_size == 0 {
                        continue;
                    }
                    let start = segment.virtual_address - layout.min_vaddr;
                    let end = align_up(start + segment.mem_size, PAGE_SIZE).unwrap_or(u64::MAX);
                    let first = (align_down(start, PAGE_SIZE) / PAGE_SIZE) as usize;
                    let last = ((end / PAGE_SIZE) as usize).min(pages);
                    for prot in &mut page_prot[first..last] {
                        *prot |= segment.protection();
                    }
                }
            }
        }

        let mut first = 0;
        while first < pages {
            let prot = page_prot[first];
            let mut last = first + 1;
            while last < pages && page_prot[last] == prot {
                last += 1;
            }
            let page = PAGE_SIZE as usize;
            self.image.protect(first * page, (last - first) * page, prot)?;
            first = last;
        }

        tracing::debug!("sealed image with {:?} protection", protection);
        Ok(ExecutableImage {
            image: self.image,
            page_prot,
        })
    }
}

/// A relocated, protected image. It exposes no mutable access.
pub struct ExecutableImage {
    image: MappedImage,
    page_prot: Vec<libc::c_int>,
}

impl std::fmt::Debug for ExecutableImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableImage")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

impl ExecutableImage {
    pub fn base(&self) -> u64 {
        self.image.base()
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn min_vaddr(&self) -> u64 {
        self.image.min_vaddr()
    }

    /// Translates a link-time address into the image, if it lies inside it.
    pub fn runtime_address(&self, vaddr: u64) -> Option<u64> {
        let offset = vaddr.checked_sub(self.image.min_vaddr)?;
        if offset >= self.image.len() as u64 {
            return None;
        }
        Some(self.image.base() + offset)
    }

    /// Whether the page holding runtime address `address` is executable.
    pub fn is_executable(&self, address: u64) -> bool {
        let Some(offset) = address.checked_sub(self.base()) else {
            return false;
        };
        self.page_prot
            .get((offset / PAGE_SIZE) as usize)
            .is_some_and(|prot| prot & libc::PROT_EXEC != 0)
    }

    /// Reads `len` bytes at link-time address `vaddr`.
    ///
    /// Fails for pages sealed without read permission.
    pub fn slice(&self, vaddr: u64, len: u64) -> Result<&[u8]> {
        let bytes = self.image.slice(vaddr, len)?;
        let offset = vaddr - self.image.min_vaddr;
        let first = (offset / PAGE_SIZE) as usize;
        let last = (align_up(offset + len, PAGE_SIZE).unwrap_or(u64::MAX) / PAGE_SIZE) as usize;
        if self.page_prot[first..last.max(first)]
            .iter()
            .any(|prot| prot & libc::PROT_READ == 0)
        {
            return Err(LoadError::Format(format!(
                "{len:#x} bytes at 0x{vaddr:x} are not readable"
            )));
        }
        Ok(bytes)
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64> {
        let mut value = [0u8; 8];
        value.copy_from_slice(self.slice(vaddr, 8)?);
        Ok(u64::from_le_bytes(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::layout::Segment;
    use crate::reader::{read_header, read_table, ProgramHeader};
    use crate::writer::ElfWriter;
    use object::LittleEndian as LE;
    use std::io::Cursor;

    fn plan(bytes: &[u8]) -> Layout {
        let mut cursor = Cursor::new(bytes);
        let header = read_header(&mut cursor).unwrap();
        let phs = read_table::<ProgramHeader, _>(
            &mut cursor,
            header.e_phoff.get(LE),
            header.e_phnum.get(LE) as u64 * 56,
            header.e_phentsize.get(LE) as u64,
            "program header",
        )
        .unwrap();
        Layout::plan(&phs).unwrap()
    }

    fn fixture() -> (Vec<u8>, u64, u64) {
        let mut writer = ElfWriter::new();
        let code = writer.add_function("add", &[0x8d, 0x04, 0x37, 0xc3]);
        let data = writer.add_data(&[1, 2, 3, 4, 5, 6, 7, 8]);
        writer.reserve_bss(0x30);
        (writer.finish().unwrap(), code, data)
    }

    #[test]
    fn test_segments_copied_and_tail_zeroed() {
        let (bytes, code, data) = fixture();
        let layout = plan(&bytes);
        let image = build(&mut Cursor::new(&bytes), &layout).unwrap();

        assert_eq!(image.len() as u64, layout.size);
        assert_eq!(image.base() % PAGE_SIZE, 0);
        assert_eq!(image.slice(code, 4).unwrap(), &[0x8d, 0x04, 0x37, 0xc3]);
        assert_eq!(image.slice(data, 8).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let data_segment = layout.segments[1];
        let tail = image
            .slice(
                data_segment.virtual_address + data_segment.file_size,
                data_segment.mem_size - data_segment.file_size,
            )
            .unwrap();
        assert_eq!(tail.len(), 0x30);
        assert!(tail.iter().all(|&b| b == 0));

        // The first segment covers the file header as well.
        let first = layout.segments[0];
        let file = &bytes[first.file_offset as usize..(first.file_offset + first.file_size) as usize];
        assert_eq!(image.slice(first.virtual_address, first.file_size).unwrap(), file);
    }

    #[test]
    fn test_truncated_segment() {
        let (bytes, _, data) = fixture();
        let layout = plan(&bytes);
        let truncated = &bytes[..(data + 4) as usize];
        let err = build(&mut Cursor::new(truncated), &layout).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_bounds_checked_access() {
        let (bytes, _, _) = fixture();
        let layout = plan(&bytes);
        let mut image = build(&mut Cursor::new(&bytes), &layout).unwrap();

        let end = layout.min_vaddr + image.len() as u64;
        assert!(image.write_u64(end - 8, 7).is_ok());
        assert_eq!(image.read_u64(end - 8).unwrap(), 7);
        assert!(matches!(
            image.write_u64(end - 4, 7),
            Err(LoadError::OutOfBounds { .. })
        ));
        assert!(image.read_u64(u64::MAX - 2).is_err());
    }

    #[test]
    fn test_seal_per_segment() {
        let (bytes, code, data) = fixture();
        let layout = plan(&bytes);
        let image = build(&mut Cursor::new(&bytes), &layout)
            .unwrap()
            .into_relocated()
            .seal(&layout, Protection::Segments)
            .unwrap();

        let code_addr = image.runtime_address(code).unwrap();
        let data_addr = image.runtime_address(data).unwrap();
        assert!(image.is_executable(code_addr));
        assert!(!image.is_executable(data_addr));
        assert_eq!(image.slice(data, 8).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.runtime_address(layout.min_vaddr + layout.size), None);
    }

    #[test]
    fn test_reservation_failure() {
        let layout = Layout {
            min_vaddr: 0,
            max_vaddr: 1 << 47,
            size: 1 << 47,
            segments: Vec::new(),
        };
        let err = MappedImage::reserve(&layout).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_unreadable_page() {
        let segment = Segment {
            file_offset: 0,
            virtual_address: 0,
            file_size: 0,
            mem_size: PAGE_SIZE,
            flags: object::elf::PF_R,
        };
        let layout = Layout {
            min_vaddr: 0,
            max_vaddr: 2 * PAGE_SIZE,
            size: 2 * PAGE_SIZE,
            segments: vec![segment],
        };
        let image = MappedImage::reserve(&layout)
            .unwrap()
            .into_relocated()
            .seal(&layout, Protection::Segments)
            .unwrap();

        assert_eq!(image.slice(0, 8).unwrap(), &[0; 8]);
        let err = image.read_u64(PAGE_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("not readable"));
        assert!(matches!(
            image.slice(2 * PAGE_SIZE, 8),
            Err(LoadError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_seal_rwx() {
        let (bytes, _, data) = fixture();
        let layout = plan(&bytes);
        let image = build(&mut Cursor::new(&bytes), &layout)
            .unwrap()
            .into_relocated()
            .seal(&layout, Protection::Rwx)
            .unwrap();
        assert!(image.is_executable(image.runtime_address(data).unwrap()));
        assert!(!image.is_executable(image.base() + image.len() as u64));
    }
}
