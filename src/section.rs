//! Section-header scan.
//!
//! Sections are only consulted to find the symbol table, its string table and
//! the relocation tables. Everything else in the section-header table is
//! ignored.

use std::io::{Read, Seek};
use std::mem;

use object::elf::{SHT_DYNSYM, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB};
use object::LittleEndian as LE;

use crate::error::{LoadError, Result};
use crate::reader::{read_bytes, read_table, Header, Rel, Rela, SectionHeader, Sym};
use crate::relocation::{Relocation, RelocationTable};
use crate::symbol::SymbolTable;

/// Tables located through the section headers.
#[derive(Default)]
pub struct SectionTables {
    pub symbols: Option<SymbolTable>,
    pub relocations: Vec<RelocationTable>,
}

impl SectionTables {
    pub fn read<R: Read + Seek>(reader: &mut R, header: &Header) -> Result<Self> {
        let count = header.e_shnum.get(LE) as u64;
        if count == 0 {
            tracing::debug!("image has no section headers");
            return Ok(Self::default());
        }

        let entry_size = header.e_shentsize.get(LE) as u64;
        let sections = read_table::<SectionHeader, R>(
            reader,
            header.e_shoff.get(LE),
            count * entry_size,
            entry_size,
            "section header",
        )?;
        let names = section_names(reader, header, &sections);
        let name_of = |index: usize| -> String {
            names
                .as_ref()
                .and_then(|names| {
                    let start = sections[index].sh_name.get(LE) as usize;
                    let rest = names.get(start..)?;
                    let len = rest.iter().position(|&b| b == 0)?;
                    Some(String::from_utf8_lossy(&rest[..len]).into_owned())
                })
                .unwrap_or_else(|| format!("section {index}"))
        };

        let mut relocations = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            let entries: Vec<Relocation> = match section.sh_type.get(LE) {
                SHT_RELA => read_section::<Rela, R>(reader, section, "relocation (rela)")?
                    .iter()
                    .map(Relocation::from_rela)
                    .collect(),
                SHT_REL => read_section::<Rel, R>(reader, section, "relocation (rel)")?
                    .iter()
                    .map(Relocation::from_rel)
                    .collect(),
                _ => continue,
            };
            relocations.push(RelocationTable {
                name: name_of(index),
                entries,
            });
        }

        let symtab = sections
            .iter()
            .position(|s| s.sh_type.get(LE) == SHT_SYMTAB)
            .or_else(|| sections.iter().position(|s| s.sh_type.get(LE) == SHT_DYNSYM));
        let symbols = match symtab {
            Some(index) => {
                let section = &sections[index];
                let link = section.sh_link.get(LE) as usize;
                let strtab = sections
                    .get(link)
                    .filter(|s| s.sh_type.get(LE) == SHT_STRTAB)
                    .ok_or_else(|| {
                        LoadError::Format(format!(
                            "{} links to section {link}, which is not a string table",
                            name_of(index)
                        ))
                    })?;
                let symbols = read_section::<Sym, R>(reader, section, "symbol table")?;
                let strings = read_bytes(
                    reader,
                    strtab.sh_offset.get(LE),
                    strtab.sh_size.get(LE),
                    "string table",
                )?;
                tracing::debug!("{}: {} symbols", name_of(index), symbols.len());
                Some(SymbolTable::new(symbols, strings))
            }
            None => {
                tracing::debug!("image has no symbol table");
                None
            }
        };

        Ok(Self {
            symbols,
            relocations,
        })
    }
}

fn read_section<T: object::pod::Pod, R: Read + Seek>(
    reader: &mut R,
    section: &SectionHeader,
    table: &'static str,
) -> Result<Vec<T>> {
    // Some producers leave sh_entsize at zero; the record size is fixed anyway.
    let entry_size = match section.sh_entsize.get(LE) {
        0 => mem::size_of::<T>() as u64,
        n => n,
    };
    read_table::<T, R>(
        reader,
        section.sh_offset.get(LE),
        section.sh_size.get(LE),
        entry_size,
        table,
    )
}

/// Section-name string table, when the header names a usable one.
fn section_names<R: Read + Seek>(
    reader: &mut R,
    header: &Header,
    sections: &[SectionHeader],
) -> Option<Vec<u8>> {
    let section = sections.get(header.e_shstrndx.get(LE) as usize)?;
    if section.sh_type.get(LE) != SHT_STRTAB {
        return None;
    }
    match read_bytes(
        reader,
        section.sh_offset.get(LE),
        section.sh_size.get(LE),
        "section names",
    ) {
        Ok(names) => Some(names),
        Err(err) => {
            tracing::debug!("section names unavailable: {}", err);
            None
        }
    }
}
