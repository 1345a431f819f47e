//! Calling into loaded code.
//!
//! This is the one place where the loader turns an address into a function
//! pointer. Everything before it is checked; what happens here depends on the
//! caller declaring the right signature and on the relocation pass having
//! been correct.

use std::ffi::c_int;
use std::mem;

use crate::error::{LoadError, Result};
use crate::image::ExecutableImage;

/// Maximum number of integer arguments passed in registers (System V x86_64).
pub const MAX_ARGS: usize = 6;

/// A symbol resolved against a sealed image.
///
/// Borrowing the image keeps the mapping alive for as long as the symbol can
/// be called.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol<'a> {
    image: &'a ExecutableImage,
    name: String,
    address: u64,
    size: u64,
}

impl<'a> ResolvedSymbol<'a> {
    pub(crate) fn new(image: &'a ExecutableImage, name: &str, address: u64, size: u64) -> Self {
        Self {
            image,
            name: name.to_string(),
            address,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime address of the symbol.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// `st_size` of the symbol.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Calls the symbol as `extern "C" fn(c_int, ...) -> c_int` with `args`.
    ///
    /// # Safety
    ///
    /// The symbol must be a function taking exactly `args.len()` integer
    /// arguments and returning an integer. The image must contain only
    /// relocations the loader applied; any other reference in the loaded code
    /// (GOT slots, PLT stubs, TLS) is not set up.
    pub unsafe fn call(&self, args: &[c_int]) -> Result<c_int> {
        if !self.image.is_executable(self.address) {
            return Err(LoadError::NotExecutable {
                name: self.name.clone(),
            });
        }
        let addr = self.address as usize;
        tracing::debug!("calling {} at 0x{:x} with {:?}", self.name, addr, args);

        let ret = match *args {
            [] => {
                let f: extern "C" fn() -> c_int = mem::transmute(addr);
                f()
            }
            [a] => {
                let f: extern "C" fn(c_int) -> c_int = mem::transmute(addr);
                f(a)
            }
            [a, b] => {
                let f: extern "C" fn(c_int, c_int) -> c_int = mem::transmute(addr);
                f(a, b)
            }
            [a, b, c] => {
                let f: extern "C" fn(c_int, c_int, c_int) -> c_int = mem::transmute(addr);
                f(a, b, c)
            }
            [a, b, c, d] => {
                let f: extern "C" fn(c_int, c_int, c_int, c_int) -> c_int = mem::transmute(addr);
                f(a, b, c, d)
            }
            [a, b, c, d, e] => {
                let f: extern "C" fn(c_int, c_int, c_int, c_int, c_int) -> c_int =
                    mem::transmute(addr);
                f(a, b, c, d, e)
            }
            [a, b, c, d, e, g] => {
                let f: extern "C" fn(c_int, c_int, c_int, c_int, c_int, c_int) -> c_int =
                    mem::transmute(addr);
                f(a, b, c, d, e, g)
            }
            _ => return Err(LoadError::Arity(args.len())),
        };
        Ok(ret)
    }
}
