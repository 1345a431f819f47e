//! Binary reader.
//!
//! Streams fixed-size ELF records out of a seekable source. Records are the
//! raw `object::elf` definitions, decoded through `object::pod` from a buffer
//! owned by the caller. Every read repositions the cursor first, so callers
//! never depend on where a previous read left it.

use std::io::{self, Read, Seek, SeekFrom};
use std::mem;

use object::elf::{FileHeader64, ProgramHeader64, Rel64, Rela64, SectionHeader64, Sym64};
use object::pod::{self, Pod};
use object::LittleEndian;

use crate::error::{LoadError, Result};

pub type Header = FileHeader64<LittleEndian>;
pub type ProgramHeader = ProgramHeader64<LittleEndian>;
pub type SectionHeader = SectionHeader64<LittleEndian>;
pub type Sym = Sym64<LittleEndian>;
pub type Rel = Rel64<LittleEndian>;
pub type Rela = Rela64<LittleEndian>;

/// Reads the 64-byte file header at offset 0.
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<Header> {
    let mut headers = read_table::<Header, R>(
        reader,
        0,
        mem::size_of::<Header>() as u64,
        mem::size_of::<Header>() as u64,
        "file header",
    )?;
    headers
        .pop()
        .ok_or_else(|| LoadError::Format("missing file header".into()))
}

/// Reads `size / entry_size` records of type `T` starting at `offset`.
///
/// `entry_size` is the size the file declares for one record; it must equal
/// the in-memory size of `T`, and `size` must be an exact multiple of it.
pub fn read_table<T: Pod, R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    size: u64,
    entry_size: u64,
    table: &'static str,
) -> Result<Vec<T>> {
    let expected = mem::size_of::<T>();
    if entry_size != expected as u64 {
        return Err(LoadError::EntrySize {
            table,
            expected,
            found: entry_size,
        });
    }
    if size % entry_size != 0 {
        return Err(LoadError::TableSize {
            table,
            size,
            entry_size: expected,
        });
    }

    let count = (size / entry_size) as usize;
    let bytes = read_bytes(reader, offset, size, table)?;
    let (entries, _) = pod::slice_from_bytes::<T>(&bytes, count)
        .map_err(|()| LoadError::Format(format!("cannot decode {table} entries")))?;
    tracing::trace!("read {} {} entries at 0x{:x}", count, table, offset);
    Ok(entries.to_vec())
}

/// Reads `size` raw bytes at `offset` into a freshly allocated buffer.
pub fn read_bytes<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    size: u64,
    what: &str,
) -> Result<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| {
        LoadError::io(
            format!("{what} of {size:#x} bytes cannot be buffered"),
            io::ErrorKind::OutOfMemory.into(),
        )
    })?;

    let stream_len = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| LoadError::io(format!("failed to size the stream for {what}"), e))?;
    if offset.checked_add(size).map_or(true, |end| end > stream_len) {
        return Err(LoadError::io(
            format!("short read: {what} at 0x{offset:x} needs {size} bytes"),
            io::ErrorKind::UnexpectedEof.into(),
        ));
    }

    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|e| {
        LoadError::io(
            format!("failed to allocate {len:#x} bytes for {what}"),
            io::Error::new(io::ErrorKind::OutOfMemory, e),
        )
    })?;
    buffer.resize(len, 0);

    read_exact_at(reader, offset, &mut buffer, what)?;
    Ok(buffer)
}

/// Fills `buffer` from `offset`. A short read is reported as an I/O error.
pub fn read_exact_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    buffer: &mut [u8],
    what: &str,
) -> Result<()> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| LoadError::io(format!("failed to seek to {what} at 0x{offset:x}"), e))?;
    reader.read_exact(buffer).map_err(|e| {
        let context = if e.kind() == io::ErrorKind::UnexpectedEof {
            format!("short read: {what} at 0x{offset:x} needs {} bytes", buffer.len())
        } else {
            format!("failed to read {what} at 0x{offset:x}")
        };
        LoadError::io(context, e)
    })
}
