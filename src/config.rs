//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the loader using `clap`,
//! and the table of default entry points for well-known image names.

use clap::Parser;
use std::ffi::c_int;
use std::path::{Path, PathBuf};

use crate::image::Protection;
use crate::loader::LoadOptions;
use crate::relocation::RelocationPolicy;

/// A minimal loader for x86_64 ELF shared objects.
///
/// Maps the image into this process, applies its base-relative relocations and
/// calls one of its functions with integer arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// ELF image to load
    pub path: PathBuf,

    /// Function to call (defaults depend on the file name)
    pub function: Option<String>,

    /// Integer argument passed to the function (repeatable)
    #[arg(short, long = "arg", allow_hyphen_values = true)]
    pub args: Vec<c_int>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Map the whole image read/write/execute instead of per segment
    #[arg(long)]
    pub rwx: bool,

    /// Warn about unsupported relocation types instead of failing
    #[arg(long)]
    pub skip_unsupported_relocs: bool,
}

impl Config {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            protection: if self.rwx {
                Protection::Rwx
            } else {
                Protection::Segments
            },
            relocations: if self.skip_unsupported_relocs {
                RelocationPolicy::Skip
            } else {
                RelocationPolicy::Strict
            },
        }
    }
}

/// Function called for a well-known file when none is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub function: &'static str,
    pub args: &'static [c_int],
}

const DEFAULT_ENTRY_POINTS: &[(&str, EntryPoint)] = &[
    ("elf", EntryPoint { function: "add", args: &[1, 2] }),
    ("elf1", EntryPoint { function: "linear_transform", args: &[4] }),
    ("elf_extra_credit", EntryPoint { function: "linear_transform", args: &[4] }),
    ("ml_main", EntryPoint { function: "ml_func", args: &[] }),
];

/// Default entry point for `path`, keyed on its file name.
pub fn default_entry_point(path: &Path) -> Option<EntryPoint> {
    let name = path.file_name()?.to_str()?;
    DEFAULT_ENTRY_POINTS
        .iter()
        .find(|(file, _)| *file == name)
        .map(|(_, entry)| *entry)
}
