//! Core loader logic.
//!
//! This module contains the `Loader` struct which drives a load through its stages:
//! 1. Header: read and validate the file header.
//! 2. Plan: compute the span of the loadable segments.
//! 3. Build: reserve memory and copy the segments in.
//! 4. Relocate: apply base-relative relocations.
//! 5. Seal: apply final protections.
//!
//! Each stage consumes the output of the previous one, so no stage can be
//! skipped or reordered. Symbol resolution and invocation operate on the
//! resulting [`LoadedElf`].

use std::ffi::c_int;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::mem;
use std::path::Path;

use object::elf::{ELFCLASS64, ELFDATA2LSB, ELFMAG, ET_DYN, ET_EXEC};
use object::LittleEndian as LE;

use crate::arch::x86_64::X86_64;
use crate::arch::Architecture;
use crate::error::{LoadError, Result};
use crate::image::{self, ExecutableImage, Protection};
use crate::invoke::ResolvedSymbol;
use crate::layout::Layout;
use crate::reader::{read_header, read_table, Header, ProgramHeader};
use crate::relocation::{self, RelocationPolicy};
use crate::section::SectionTables;
use crate::symbol::SymbolTable;

/// Knobs for a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub protection: Protection,
    pub relocations: RelocationPolicy,
}

pub struct Loader<A: Architecture> {
    arch: A,
    options: LoadOptions,
}

impl<A: Architecture> Loader<A> {
    pub fn new(arch: A) -> Self {
        Self::with_options(arch, LoadOptions::default())
    }

    pub fn with_options(arch: A, options: LoadOptions) -> Self {
        Self { arch, options }
    }

    pub fn load(&self, path: &Path) -> Result<LoadedElf> {
        let file = File::open(path)
            .map_err(|e| LoadError::io(format!("failed to open {}", path.display()), e))?;
        let _span = tracing::debug_span!("load", path = %path.display()).entered();
        self.load_from(&mut BufReader::new(file))
    }

    pub fn load_from<R: Read + Seek>(&self, reader: &mut R) -> Result<LoadedElf> {
        let header = read_header(reader)?;
        self.validate(&header)?;

        let layout = self.plan(reader, &header)?;
        let image = image::build(reader, &layout)?;
        let tables = SectionTables::read(reader, &header)?;
        let relocated =
            relocation::apply(&self.arch, image, &tables.relocations, self.options.relocations)?;
        let image = relocated.seal(&layout, self.options.protection)?;

        tracing::info!(
            "loaded image at 0x{:x} ({:#x} bytes, link base 0x{:x})",
            image.base(),
            image.len(),
            layout.min_vaddr
        );
        Ok(LoadedElf {
            image,
            symbols: tables.symbols,
            layout,
        })
    }

    fn validate(&self, header: &Header) -> Result<()> {
        let ident = &header.e_ident;
        if ident.magic != ELFMAG {
            return Err(LoadError::Format("not an ELF file".into()));
        }
        if ident.class != ELFCLASS64 {
            return Err(LoadError::Format(format!("unsupported ELF class {}", ident.class)));
        }
        if ident.data != ELFDATA2LSB {
            return Err(LoadError::Format("only little-endian images are supported".into()));
        }
        let machine = header.e_machine.get(LE);
        if machine != self.arch.machine() {
            return Err(LoadError::Format(format!("unsupported machine {machine}")));
        }
        match header.e_type.get(LE) {
            ET_DYN => {}
            ET_EXEC => tracing::warn!("ET_EXEC image will run away from its link address"),
            e_type => return Err(LoadError::Format(format!("unsupported ELF type {e_type}"))),
        }
        Ok(())
    }

    fn plan<R: Read + Seek>(&self, reader: &mut R, header: &Header) -> Result<Layout> {
        let entry_size = header.e_phentsize.get(LE) as u64;
        if entry_size != mem::size_of::<ProgramHeader>() as u64 {
            return Err(LoadError::EntrySize {
                table: "program header",
                expected: mem::size_of::<ProgramHeader>(),
                found: entry_size,
            });
        }
        let headers = read_table::<ProgramHeader, R>(
            reader,
            header.e_phoff.get(LE),
            header.e_phnum.get(LE) as u64 * entry_size,
            entry_size,
            "program header",
        )?;
        Layout::plan(&headers)
    }
}

/// A loaded, relocated and sealed image together with its symbol table.
pub struct LoadedElf {
    image: ExecutableImage,
    symbols: Option<SymbolTable>,
    layout: Layout,
}

impl LoadedElf {
    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Runtime address of the first byte of the image.
    pub fn base(&self) -> u64 {
        self.image.base()
    }

    /// Looks up `name` in the image's symbol table.
    pub fn resolve(&self, name: &str) -> Result<ResolvedSymbol<'_>> {
        match &self.symbols {
            Some(symbols) => symbols.resolve(&self.image, name),
            None => Err(LoadError::SymbolNotFound(name.to_string())),
        }
    }
}

/// Loads `path`, resolves `function` and calls it with `args`.
///
/// # Safety
///
/// Runs code from the file in this process. See [`ResolvedSymbol::call`].
pub unsafe fn load_and_call(path: &Path, function: &str, args: &[c_int]) -> Result<c_int> {
    load_and_call_with(path, function, args, LoadOptions::default())
}

/// [`load_and_call`] with explicit options.
///
/// # Safety
///
/// See [`load_and_call`].
pub unsafe fn load_and_call_with(
    path: &Path,
    function: &str,
    args: &[c_int],
    options: LoadOptions,
) -> Result<c_int> {
    let elf = Loader::with_options(X86_64, options).load(path)?;
    let symbol = elf.resolve(function)?;
    symbol.call(args)
}
