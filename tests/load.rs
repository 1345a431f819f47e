//! End-to-end loads of generated images: map, relocate, resolve and call.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use elfload::arch::x86_64::X86_64;
use elfload::error::ErrorKind;
use elfload::image::{self, Protection};
use elfload::layout::Layout;
use elfload::loader::{load_and_call, load_and_call_with, LoadOptions, Loader};
use elfload::reader::{read_header, read_table, ProgramHeader};
use elfload::relocation::RelocationPolicy;
use elfload::writer::{ElfWriter, RelocationFormat};
use elfload::LoadError;
use object::elf::R_X86_64_GLOB_DAT;
use object::LittleEndian as LE;
use tempfile::TempDir;

/// `lea eax, [rdi + rsi]; ret`
const ADD: &[u8] = &[0x8d, 0x04, 0x37, 0xc3];

/// `int add(int a, int b) { return a + b; }`
fn add_image() -> ElfWriter {
    let mut writer = ElfWriter::new();
    writer.add_function("add", ADD);
    writer
}

/// `int linear_transform(int x) { return coeffs->a * x + coeffs->b; }`
///
/// `coeffs` is a pointer in `.data` that only holds a valid address once its
/// base-relative relocation has been applied.
struct LinearTransform {
    writer: ElfWriter,
    coeffs: u64,
    pointer: u64,
}

fn linear_transform_image(link_base: u64, format: RelocationFormat) -> LinearTransform {
    let mut writer = ElfWriter::new();
    writer.set_link_base(link_base);
    writer.set_relocation_format(format);

    let mut coeffs = 3i32.to_le_bytes().to_vec();
    coeffs.extend_from_slice(&5i32.to_le_bytes());
    let coeffs = writer.add_data(&coeffs);
    let pointer = writer.add_pointer(coeffs);
    writer.reserve_bss(0x40);

    let at = writer.next_function_address();
    let disp = (pointer as i64 - (at as i64 + 7)) as i32;
    let mut code = vec![0x48, 0x8b, 0x05]; // mov rax, [rip + disp]
    code.extend_from_slice(&disp.to_le_bytes());
    code.extend_from_slice(&[
        0x8b, 0x08, // mov ecx, [rax]
        0x0f, 0xaf, 0xcf, // imul ecx, edi
        0x03, 0x48, 0x04, // add ecx, [rax + 4]
        0x89, 0xc8, // mov eax, ecx
        0xc3, // ret
    ]);
    writer.add_function("linear_transform", &code);

    LinearTransform {
        writer,
        coeffs,
        pointer,
    }
}

fn write(dir: &TempDir, name: &str, writer: &ElfWriter) -> PathBuf {
    let path = dir.path().join(name);
    writer.write(&path).unwrap();
    path
}

fn call(path: &Path, function: &str, args: &[i32]) -> Result<i32, LoadError> {
    unsafe { load_and_call(path, function, args) }
}

#[test]
fn test_add() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "elf", &add_image());
    assert_eq!(call(&path, "add", &[1, 2]).unwrap(), 3);
    assert_eq!(call(&path, "add", &[-7, 2]).unwrap(), -5);
}

#[test]
fn test_linear_transform_rela() {
    let dir = TempDir::new().unwrap();
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let path = write(&dir, "elf1", &image.writer);
    assert_eq!(call(&path, "linear_transform", &[4]).unwrap(), 17);
}

#[test]
fn test_linear_transform_rel() {
    let dir = TempDir::new().unwrap();
    let image = linear_transform_image(0, RelocationFormat::Rel);
    let path = write(&dir, "elf1", &image.writer);
    assert_eq!(call(&path, "linear_transform", &[4]).unwrap(), 17);
}

#[test]
fn test_nonzero_link_base() {
    let dir = TempDir::new().unwrap();
    let image = linear_transform_image(0x400000, RelocationFormat::Rela);
    let path = write(&dir, "elf_extra_credit", &image.writer);

    let elf = Loader::new(X86_64).load(&path).unwrap();
    assert_eq!(elf.layout().min_vaddr, 0x400000);
    let symbol = elf.resolve("linear_transform").unwrap();
    assert_eq!(unsafe { symbol.call(&[10]) }.unwrap(), 35);
}

#[test]
fn test_rwx_protection() {
    let dir = TempDir::new().unwrap();
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let path = write(&dir, "elf1", &image.writer);
    let options = LoadOptions {
        protection: Protection::Rwx,
        ..LoadOptions::default()
    };
    let ret = unsafe { load_and_call_with(&path, "linear_transform", &[-2], options) };
    assert_eq!(ret.unwrap(), -1);
}

#[test]
fn test_relocated_pointer_targets_image() {
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let bytes = image.writer.finish().unwrap();
    let elf = Loader::new(X86_64)
        .load_from(&mut Cursor::new(bytes))
        .unwrap();

    let patched = elf.image().read_u64(image.pointer).unwrap();
    assert_eq!(patched, elf.base() + image.coeffs);
    assert_eq!(
        elf.image().runtime_address(image.coeffs),
        Some(patched)
    );
}

#[test]
fn test_unrelocated_pointer_is_wrong() {
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let bytes = image.writer.finish().unwrap();

    // Stop after building the image: the pointer still holds nothing usable.
    let mut cursor = Cursor::new(bytes);
    let header = read_header(&mut cursor).unwrap();
    let phs = read_table::<ProgramHeader, _>(
        &mut cursor,
        header.e_phoff.get(LE),
        header.e_phnum.get(LE) as u64 * 56,
        56,
        "program header",
    )
    .unwrap();
    let layout = Layout::plan(&phs).unwrap();
    let unrelocated = image::build(&mut cursor, &layout).unwrap();

    let stored = unrelocated.read_u64(image.pointer).unwrap();
    let base = unrelocated.base();
    let end = base + unrelocated.len() as u64;
    assert!(!(base..end).contains(&stored));

    // With REL the link-time address is stored instead, still outside the image.
    let image = linear_transform_image(0, RelocationFormat::Rel);
    let mut cursor = Cursor::new(image.writer.finish().unwrap());
    let unrelocated = image::build(&mut cursor, &layout).unwrap();
    let stored = unrelocated.read_u64(image.pointer).unwrap();
    assert_eq!(stored, image.coeffs);
    let base = unrelocated.base();
    assert!(!(base..base + unrelocated.len() as u64).contains(&stored));
}

#[test]
fn test_resolved_address_within_image() {
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let elf = Loader::new(X86_64)
        .load_from(&mut Cursor::new(image.writer.finish().unwrap()))
        .unwrap();
    let symbol = elf.resolve("linear_transform").unwrap();
    let base = elf.base();
    let end = base + elf.layout().size;
    assert!((base..end).contains(&symbol.address()));
    assert_eq!(symbol.name(), "linear_transform");
    assert_eq!(symbol.size(), 18);
}

#[test]
fn test_symbol_not_found() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "elf", &add_image());
    let err = call(&path, "sub", &[1, 2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);
    assert!(matches!(err, LoadError::SymbolNotFound(name) if name == "sub"));

    // The process is unaffected: the same image still loads and runs.
    assert_eq!(call(&path, "add", &[20, 22]).unwrap(), 42);
}

#[test]
fn test_program_header_size_mismatch() {
    let dir = TempDir::new().unwrap();
    let mut bytes = add_image().finish().unwrap();
    bytes[54..56].copy_from_slice(&48u16.to_le_bytes());
    let path = dir.path().join("elf");
    std::fs::write(&path, bytes).unwrap();

    let err = call(&path, "add", &[1, 2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn test_truncated_segment() {
    let dir = TempDir::new().unwrap();
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let bytes = image.writer.finish().unwrap();
    let path = dir.path().join("elf1");
    std::fs::write(&path, &bytes[..(image.pointer + 4) as usize]).unwrap();

    let err = call(&path, "linear_transform", &[4]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_unsupported_relocation() {
    let mut image = linear_transform_image(0, RelocationFormat::Rela);
    let slot = image.writer.add_data(&[0; 8]);
    image.writer.add_relocation(slot, R_X86_64_GLOB_DAT, 0);
    let bytes = image.writer.finish().unwrap();

    let err = Loader::new(X86_64)
        .load_from(&mut Cursor::new(bytes.clone()))
        .err()
        .unwrap();
    assert!(matches!(err, LoadError::UnsupportedRelocation { .. }));

    let options = LoadOptions {
        relocations: RelocationPolicy::Skip,
        ..LoadOptions::default()
    };
    let elf = Loader::with_options(X86_64, options)
        .load_from(&mut Cursor::new(bytes))
        .unwrap();
    assert_eq!(elf.image().read_u64(slot).unwrap(), 0);
    let symbol = elf.resolve("linear_transform").unwrap();
    assert_eq!(unsafe { symbol.call(&[4]) }.unwrap(), 17);
}

#[test]
fn test_data_symbol_not_callable() {
    let mut writer = add_image();
    writer.add_object("table", &[1, 2, 3, 4]);
    let elf = Loader::new(X86_64)
        .load_from(&mut Cursor::new(writer.finish().unwrap()))
        .unwrap();

    let symbol = elf.resolve("table").unwrap();
    let err = unsafe { symbol.call(&[]) }.unwrap_err();
    assert!(matches!(err, LoadError::NotExecutable { .. }));
}

#[test]
fn test_too_many_arguments() {
    let elf = Loader::new(X86_64)
        .load_from(&mut Cursor::new(add_image().finish().unwrap()))
        .unwrap();
    let symbol = elf.resolve("add").unwrap();
    let args = [0; elfload::invoke::MAX_ARGS + 1];
    let err = unsafe { symbol.call(&args) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Signature);
}

#[test]
fn test_independent_loads() {
    let first = Loader::new(X86_64)
        .load_from(&mut Cursor::new(add_image().finish().unwrap()))
        .unwrap();
    let image = linear_transform_image(0, RelocationFormat::Rela);
    let second = Loader::new(X86_64)
        .load_from(&mut Cursor::new(image.writer.finish().unwrap()))
        .unwrap();

    assert_ne!(first.base(), second.base());
    let add = first.resolve("add").unwrap();
    let transform = second.resolve("linear_transform").unwrap();
    assert_eq!(unsafe { add.call(&[2, 3]) }.unwrap(), 5);
    assert_eq!(unsafe { transform.call(&[1]) }.unwrap(), 8);
    assert!(first.resolve("linear_transform").is_err());
}
