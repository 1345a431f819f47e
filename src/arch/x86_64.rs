//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 systems (ELF64). Only the
//! base-relative relocation is computed; everything that needs symbol lookup or
//! a PLT is reported back to the caller.

use super::Architecture;
use crate::error::{LoadError, Result};
use crate::image::MappedImage;
use crate::relocation::{Addend, Relocation};
use object::elf::{EM_X86_64, R_X86_64_NONE, R_X86_64_RELATIVE};

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn machine(&self) -> u16 {
        EM_X86_64
    }

    fn apply_relocation(
        &self,
        reloc: &Relocation,
        delta: u64, // Base (B)
        image: &mut MappedImage,
    ) -> Result<bool> {
        match reloc.r_type {
            R_X86_64_NONE => Ok(false),

            // R_X86_64_RELATIVE: B + A
            R_X86_64_RELATIVE => {
                let addend = match reloc.addend {
                    Addend::Explicit(a) => a as u64,
                    Addend::Implicit => image.read_u64(reloc.offset)?,
                };
                image.write_u64(reloc.offset, delta.wrapping_add(addend))?;
                Ok(true)
            }

            r_type => Err(LoadError::UnsupportedRelocation {
                r_type,
                offset: reloc.offset,
            }),
        }
    }
}
