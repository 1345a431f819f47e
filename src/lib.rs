//! Minimal ELF Loader Library.
//!
//! This library provides the core components for the `elfload` loader.
//! It is organized into several modules:
//! - `reader`: Fixed-size record reads from the input file.
//! - `layout`: Loadable segment span planning.
//! - `image`: Image reservation, population and sealing.
//! - `section`: Symbol, string and relocation table discovery.
//! - `relocation` / `arch`: Relocation pass and architecture-specific backends.
//! - `symbol`: Symbol table lookup.
//! - `invoke`: Calling resolved functions.
//! - `loader`: The load orchestration.
//! - `config`: CLI configuration.
//! - `writer`: Minimal ELF image writer.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("elfload only supports x86_64 Linux");

pub mod arch;
pub mod config;
pub mod error;
pub mod image;
pub mod invoke;
pub mod layout;
pub mod loader;
pub mod reader;
pub mod relocation;
pub mod section;
pub mod symbol;
pub mod utils;
pub mod writer;

pub use error::{ErrorKind, LoadError, Result};
pub use loader::{load_and_call, LoadOptions, LoadedElf, Loader};
