//! Relocation pass.
//!
//! Walks every relocation table of the image and lets the architecture
//! backend patch each entry. The pass consumes the [`MappedImage`] and only
//! returns a [`RelocatedImage`] once every entry has been handled, so nothing
//! downstream can observe a partially relocated image.

use object::LittleEndian as LE;

use crate::arch::Architecture;
use crate::error::{LoadError, Result};
use crate::image::{MappedImage, RelocatedImage};
use crate::reader::{Rel, Rela};

/// Where the addend of a relocation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addend {
    /// Carried by the entry (`SHT_RELA`).
    Explicit(i64),
    /// Stored at the location being patched (`SHT_REL`).
    Implicit,
}

/// A decoded relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Link-time virtual address of the location to patch.
    pub offset: u64,
    pub r_type: u32,
    pub symbol: u32,
    pub addend: Addend,
}

impl Relocation {
    pub fn from_rela(rela: &Rela) -> Self {
        let info = rela.r_info.get(LE);
        Self {
            offset: rela.r_offset.get(LE),
            r_type: (info & 0xffff_ffff) as u32,
            symbol: (info >> 32) as u32,
            addend: Addend::Explicit(rela.r_addend.get(LE)),
        }
    }

    pub fn from_rel(rel: &Rel) -> Self {
        let info = rel.r_info.get(LE);
        Self {
            offset: rel.r_offset.get(LE),
            r_type: (info & 0xffff_ffff) as u32,
            symbol: (info >> 32) as u32,
            addend: Addend::Implicit,
        }
    }
}

/// Relocations read from one `SHT_REL` or `SHT_RELA` section.
#[derive(Debug, Clone, Default)]
pub struct RelocationTable {
    pub name: String,
    pub entries: Vec<Relocation>,
}

/// What to do with relocation types the backend does not implement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelocationPolicy {
    /// Abort the load.
    #[default]
    Strict,
    /// Log a warning and leave the location untouched.
    Skip,
}

/// Applies every table in order.
pub fn apply<A: Architecture>(
    arch: &A,
    mut image: MappedImage,
    tables: &[RelocationTable],
    policy: RelocationPolicy,
) -> Result<RelocatedImage> {
    let delta = image.delta();
    for table in tables {
        let mut patched = 0;
        let mut skipped = 0;
        for reloc in &table.entries {
            tracing::trace!(
                "{}: type {} at 0x{:x} ({:?})",
                table.name,
                reloc.r_type,
                reloc.offset,
                reloc.addend
            );
            match arch.apply_relocation(reloc, delta, &mut image) {
                Ok(true) => patched += 1,
                Ok(false) => {}
                Err(LoadError::UnsupportedRelocation { r_type, offset })
                    if policy == RelocationPolicy::Skip =>
                {
                    tracing::warn!(
                        "skipping unsupported relocation type {} at 0x{:x} (symbol {})",
                        r_type,
                        offset,
                        reloc.symbol
                    );
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(
            "applied {}: {} patched, {} skipped of {}",
            table.name,
            patched,
            skipped,
            table.entries.len()
        );
    }
    Ok(image.into_relocated())
}
