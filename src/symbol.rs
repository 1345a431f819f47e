//! Symbol table lookup.
//!
//! Pairs a symbol table with its string table and resolves names to runtime
//! addresses inside a sealed image.

use object::elf::SHN_UNDEF;
use object::LittleEndian as LE;

use crate::error::{LoadError, Result};
use crate::image::ExecutableImage;
use crate::invoke::ResolvedSymbol;
use crate::reader::Sym;

/// A symbol table and the string table its names index into.
pub struct SymbolTable {
    symbols: Vec<Sym>,
    strings: Vec<u8>,
}

impl SymbolTable {
    pub fn new(symbols: Vec<Sym>, strings: Vec<u8>) -> Self {
        Self { symbols, strings }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Name of `sym`, or `None` when the offset is out of range, the name is
    /// not NUL-terminated, or it is empty.
    pub fn name(&self, sym: &Sym) -> Option<&[u8]> {
        let start = sym.st_name.get(LE) as usize;
        let rest = self.strings.get(start..)?;
        let len = rest.iter().position(|&b| b == 0)?;
        (len > 0).then(|| &rest[..len])
    }

    /// First defined symbol named exactly `name`.
    pub fn lookup(&self, name: &str) -> Option<&Sym> {
        self.symbols.iter().find(|sym| {
            sym.st_shndx.get(LE) != SHN_UNDEF && self.name(sym) == Some(name.as_bytes())
        })
    }

    /// Resolves `name` to its runtime address in `image`.
    pub fn resolve<'a>(&self, image: &'a ExecutableImage, name: &str) -> Result<ResolvedSymbol<'a>> {
        let sym = self
            .lookup(name)
            .ok_or_else(|| LoadError::SymbolNotFound(name.to_string()))?;
        let value = sym.st_value.get(LE);
        let address = image.runtime_address(value).ok_or_else(|| {
            LoadError::Format(format!(
                "symbol `{name}` at 0x{value:x} lies outside the image"
            ))
        })?;
        tracing::debug!("resolved {} (0x{:x}) to 0x{:x}", name, value, address);
        Ok(ResolvedSymbol::new(image, name, address, sym.st_size.get(LE)))
    }
}
