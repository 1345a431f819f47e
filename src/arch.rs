//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the machine-specific
//! parts of loading: which ELF machine the backend accepts and how each relocation
//! type is computed and written into the image.

use crate::error::Result;
use crate::image::MappedImage;
use crate::relocation::Relocation;

pub mod x86_64;

/// A trait representing a target architecture.
pub trait Architecture {
    /// The `e_machine` value of images this backend can load.
    fn machine(&self) -> u16;

    /// Applies a relocation to the image.
    ///
    /// # Arguments
    /// * `reloc` - The decoded relocation entry.
    /// * `delta` - Load base minus link-time base (B).
    /// * `image` - The populated image to patch.
    ///
    /// Returns `Ok(false)` for entries that require no patching and
    /// `LoadError::UnsupportedRelocation` for types the backend does not implement.
    fn apply_relocation(&self, reloc: &Relocation, delta: u64, image: &mut MappedImage)
        -> Result<bool>;
}
