//! ELF image writer.
//!
//! Produces small position-independent ELF64 shared objects: one read/execute
//! segment holding the headers and code, one read/write segment holding data
//! and a zero-initialized tail, plus the section headers, symbol table and
//! base-relative relocations the loader consumes. Used to build fixtures.
//!
//! File layout (link base `B`):
//! - `0x0000`: file header and program headers
//! - `0x1000`: `.text` at `B + 0x1000`
//! - `0x2000`: `.data` at `B + 0x2000`, followed in memory by `.bss`
//! - after `.data`: relocations, `.symtab`, `.strtab`, `.shstrtab`, section headers

use anyhow::{bail, Result};
use object::elf::{
    FileHeader64, Ident, ProgramHeader64, Rel64, Rela64, SectionHeader64, Sym64,
    R_X86_64_RELATIVE,
};
use object::endian::{I64, U16, U32, U64};
use object::pod::{bytes_of, bytes_of_slice};
use object::LittleEndian as LE;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const TEXT_OFFSET: u64 = 0x1000;
const DATA_OFFSET: u64 = 0x2000;

fn u16(v: u16) -> U16<LE> {
    U16::new(LE, v)
}
fn u32(v: u32) -> U32<LE> {
    U32::new(LE, v)
}
fn u64(v: u64) -> U64<LE> {
    U64::new(LE, v)
}

fn align(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Relocation section flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelocationFormat {
    /// `SHT_RELA`: the addend lives in the entry.
    #[default]
    Rela,
    /// `SHT_REL`: the addend is stored at the patched location.
    Rel,
}

struct Symbol {
    name: String,
    address: u64,
    size: u64,
    kind: u8,
    section: u16,
}

struct Reloc {
    offset: u64,
    r_type: u32,
    addend: i64,
}

/// Builder for a minimal shared object.
pub struct ElfWriter {
    link_base: u64,
    text: Vec<u8>,
    data: Vec<u8>,
    bss: u64,
    symbols: Vec<Symbol>,
    relocations: Vec<Reloc>,
    format: RelocationFormat,
}

impl Default for ElfWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfWriter {
    pub fn new() -> Self {
        Self {
            link_base: 0,
            text: Vec::new(),
            data: Vec::new(),
            bss: 0,
            symbols: Vec::new(),
            relocations: Vec::new(),
            format: RelocationFormat::Rela,
        }
    }

    /// Sets the link-time address of the first segment. Must be page aligned.
    pub fn set_link_base(&mut self, base: u64) {
        self.link_base = base;
    }

    pub fn set_relocation_format(&mut self, format: RelocationFormat) {
        self.format = format;
    }

    /// Address the next function added will be placed at.
    pub fn next_function_address(&self) -> u64 {
        self.link_base + TEXT_OFFSET + align(self.text.len(), 16) as u64
    }

    /// Appends a global function and returns its address.
    pub fn add_function(&mut self, name: &str, code: &[u8]) -> u64 {
        let address = self.next_function_address();
        self.text.resize(align(self.text.len(), 16), 0xcc);
        self.text.extend_from_slice(code);
        self.symbols.push(Symbol {
            name: name.to_string(),
            address,
            size: code.len() as u64,
            kind: object::elf::STT_FUNC,
            section: 1,
        });
        address
    }

    /// Appends a global data object to `.data` and returns its address.
    pub fn add_object(&mut self, name: &str, bytes: &[u8]) -> u64 {
        let address = self.add_data(bytes);
        self.symbols.push(Symbol {
            name: name.to_string(),
            address,
            size: bytes.len() as u64,
            kind: object::elf::STT_OBJECT,
            section: 2,
        });
        address
    }

    /// Appends 8-byte aligned bytes to `.data` and returns their address.
    pub fn add_data(&mut self, bytes: &[u8]) -> u64 {
        self.data.resize(align(self.data.len(), 8), 0);
        let address = self.link_base + DATA_OFFSET + self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        address
    }

    /// Appends a pointer slot in `.data` holding `target` once relocated.
    pub fn add_pointer(&mut self, target: u64) -> u64 {
        let slot = self.add_data(&[0; 8]);
        self.add_relocation(slot, R_X86_64_RELATIVE, target as i64);
        slot
    }

    /// Records a raw relocation entry.
    pub fn add_relocation(&mut self, offset: u64, r_type: u32, addend: i64) {
        self.relocations.push(Reloc {
            offset,
            r_type,
            addend,
        });
    }

    /// Grows the zero-initialized tail of the data segment.
    pub fn reserve_bss(&mut self, size: u64) {
        self.bss += size;
    }

    /// Serializes the image.
    pub fn finish(&self) -> Result<Vec<u8>> {
        if self.text.len() as u64 > DATA_OFFSET - TEXT_OFFSET {
            bail!("text of {} bytes does not fit before the data segment", self.text.len());
        }
        if self.link_base % 0x1000 != 0 {
            bail!("link base 0x{:x} is not page aligned", self.link_base);
        }

        let base = self.link_base;
        let data_addr = base + DATA_OFFSET;

        // REL entries carry their addend in the target location.
        let mut data = self.data.clone();
        if self.format == RelocationFormat::Rel {
            for reloc in &self.relocations {
                let Some(start) = reloc.offset.checked_sub(data_addr) else { continue };
                let start = start as usize;
                if let Some(slot) = data.get_mut(start..start + 8) {
                    slot.copy_from_slice(&(reloc.addend as u64).to_le_bytes());
                }
            }
        }

        let mut buffer = vec![0u8; TEXT_OFFSET as usize];
        buffer.extend_from_slice(&self.text);
        buffer.resize(DATA_OFFSET as usize, 0);
        buffer.extend_from_slice(&data);

        // Relocation table
        buffer.resize(align(buffer.len(), 8), 0);
        let reloc_offset = buffer.len() as u64;
        let (reloc_type, reloc_name, reloc_entsize) = match self.format {
            RelocationFormat::Rela => (object::elf::SHT_RELA, ".rela.dyn", 24),
            RelocationFormat::Rel => (object::elf::SHT_REL, ".rel.dyn", 16),
        };
        for reloc in &self.relocations {
            let r_info = u64(reloc.r_type as u64);
            match self.format {
                RelocationFormat::Rela => buffer.extend_from_slice(bytes_of(&Rela64::<LE> {
                    r_offset: u64(reloc.offset),
                    r_info,
                    r_addend: I64::new(LE, reloc.addend),
                })),
                RelocationFormat::Rel => buffer.extend_from_slice(bytes_of(&Rel64::<LE> {
                    r_offset: u64(reloc.offset),
                    r_info,
                })),
            }
        }
        let reloc_size = buffer.len() as u64 - reloc_offset;

        // Symbol and string tables
        let mut strtab = vec![0u8];
        let mut symtab = vec![Sym64::<LE> {
            st_name: u32(0),
            st_info: 0,
            st_other: 0,
            st_shndx: u16(0),
            st_value: u64(0),
            st_size: u64(0),
        }];
        for symbol in &self.symbols {
            let name = strtab.len() as u32;
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
            symtab.push(Sym64 {
                st_name: u32(name),
                st_info: (object::elf::STB_GLOBAL << 4) | symbol.kind,
                st_other: object::elf::STV_DEFAULT,
                st_shndx: u16(symbol.section),
                st_value: u64(symbol.address),
                st_size: u64(symbol.size),
            });
        }
        let symtab_offset = buffer.len() as u64;
        buffer.extend_from_slice(bytes_of_slice(&symtab));
        let strtab_offset = buffer.len() as u64;
        buffer.extend_from_slice(&strtab);

        // Section header string table
        let section_names = [".text", ".data", ".bss", reloc_name, ".symtab", ".strtab", ".shstrtab"];
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in section_names {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_offset = buffer.len() as u64;
        buffer.extend_from_slice(&shstrtab);

        let section = |name: u32, sh_type: u32, flags: u32, addr: u64, offset: u64, size: u64| {
            SectionHeader64::<LE> {
                sh_name: u32(name),
                sh_type: u32(sh_type),
                sh_flags: u64(flags as u64),
                sh_addr: u64(addr),
                sh_offset: u64(offset),
                sh_size: u64(size),
                sh_link: u32(0),
                sh_info: u32(0),
                sh_addralign: u64(8),
                sh_entsize: u64(0),
            }
        };
        let alloc = object::elf::SHF_ALLOC;
        let mut sections = vec![
            section(0, object::elf::SHT_NULL, 0, 0, 0, 0),
            section(
                name_offsets[0],
                object::elf::SHT_PROGBITS,
                alloc | object::elf::SHF_EXECINSTR,
                base + TEXT_OFFSET,
                TEXT_OFFSET,
                self.text.len() as u64,
            ),
            section(
                name_offsets[1],
                object::elf::SHT_PROGBITS,
                alloc | object::elf::SHF_WRITE,
                data_addr,
                DATA_OFFSET,
                data.len() as u64,
            ),
            section(
                name_offsets[2],
                object::elf::SHT_NOBITS,
                alloc | object::elf::SHF_WRITE,
                data_addr + data.len() as u64,
                DATA_OFFSET + data.len() as u64,
                self.bss,
            ),
            section(name_offsets[3], reloc_type, alloc, 0, reloc_offset, reloc_size),
            section(
                name_offsets[4],
                object::elf::SHT_SYMTAB,
                0,
                0,
                symtab_offset,
                strtab_offset - symtab_offset,
            ),
            section(
                name_offsets[5],
                object::elf::SHT_STRTAB,
                0,
                0,
                strtab_offset,
                strtab.len() as u64,
            ),
            section(
                name_offsets[6],
                object::elf::SHT_STRTAB,
                0,
                0,
                shstrtab_offset,
                shstrtab.len() as u64,
            ),
        ];
        sections[4].sh_link = u32(5);
        sections[4].sh_entsize = u64(reloc_entsize);
        sections[5].sh_link = u32(6);
        sections[5].sh_info = u32(1);
        sections[5].sh_entsize = u64(24);

        buffer.resize(align(buffer.len(), 8), 0);
        let shoff = buffer.len() as u64;
        buffer.extend_from_slice(bytes_of_slice(&sections));

        let text_end = TEXT_OFFSET + self.text.len() as u64;
        let program_headers = [
            ProgramHeader64::<LE> {
                p_type: u32(object::elf::PT_LOAD),
                p_flags: u32(object::elf::PF_R | object::elf::PF_X),
                p_offset: u64(0),
                p_vaddr: u64(base),
                p_paddr: u64(base),
                p_filesz: u64(text_end),
                p_memsz: u64(text_end),
                p_align: u64(0x1000),
            },
            ProgramHeader64::<LE> {
                p_type: u32(object::elf::PT_LOAD),
                p_flags: u32(object::elf::PF_R | object::elf::PF_W),
                p_offset: u64(DATA_OFFSET),
                p_vaddr: u64(data_addr),
                p_paddr: u64(data_addr),
                p_filesz: u64(data.len() as u64),
                p_memsz: u64(data.len() as u64 + self.bss),
                p_align: u64(0x1000),
            },
        ];

        let file_header = FileHeader64::<LE> {
            e_ident: Ident {
                magic: object::elf::ELFMAG,
                class: object::elf::ELFCLASS64,
                data: object::elf::ELFDATA2LSB,
                version: object::elf::EV_CURRENT,
                os_abi: object::elf::ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: u16(object::elf::ET_DYN),
            e_machine: u16(object::elf::EM_X86_64),
            e_version: u32(object::elf::EV_CURRENT as u32),
            e_entry: u64(0),
            e_phoff: u64(64),
            e_shoff: u64(shoff),
            e_flags: u32(0),
            e_ehsize: u16(64),
            e_phentsize: u16(56),
            e_phnum: u16(program_headers.len() as u16),
            e_shentsize: u16(64),
            e_shnum: u16(sections.len() as u16),
            e_shstrndx: u16(sections.len() as u16 - 1),
        };
        let header_bytes = bytes_of(&file_header);
        buffer[..header_bytes.len()].copy_from_slice(header_bytes);
        let phdr_bytes = bytes_of_slice(&program_headers);
        buffer[64..64 + phdr_bytes.len()].copy_from_slice(phdr_bytes);

        Ok(buffer)
    }

    /// Writes the image to disk and marks it executable.
    pub fn write(&self, output_path: &Path) -> Result<()> {
        std::fs::write(output_path, self.finish()?)?;

        let mut perms = std::fs::metadata(output_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(output_path, perms)?;

        Ok(())
    }
}
