//! Binary reader for Lama bytecode files.
//!
//! Layout, head to tail: `stringtab_size:i32`, `global_area_size:i32`,
//! `public_symbols_number:i32`, the publics array, the string table bytes and
//! the code section filling the remainder of the file.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use super::file::{BytecodeFile, PublicSymbol};

/// Why a bytecode file could not be loaded. The discriminants double as the
/// process exit status of the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReadError {
    NonExistingFile = 1,
    NotRegularFile = 2,
    ReadFailure = 3,
    WrongBytecodeFile = 4,
    WrongStringTableSize = 5,
    WrongPublicSymbolsNumber = 6,
    WrongGlobalAreaSize = 7,
    OutOfMemory = 8,
}

impl ReadError {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ReadError::NonExistingFile => "file does not exist",
            ReadError::NotRegularFile => "not a regular file",
            ReadError::ReadFailure => "error while reading file",
            ReadError::WrongBytecodeFile => "wrong bytecode",
            ReadError::WrongStringTableSize => "wrong string table size",
            ReadError::WrongPublicSymbolsNumber => "wrong public symbols number",
            ReadError::WrongGlobalAreaSize => "wrong global area size",
            ReadError::OutOfMemory => "out of memory",
        };

        f.write_str(message)
    }
}

impl std::error::Error for ReadError {}

/// Read and parse a bytecode file from disk.
pub fn read_bytecode_file(path: impl AsRef<Path>) -> Result<BytecodeFile, ReadError> {
    let path = path.as_ref();

    let meta = fs::metadata(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ReadError::NonExistingFile,
        _ => ReadError::ReadFailure,
    })?;
    if !meta.is_file() {
        return Err(ReadError::NotRegularFile);
    }

    let bytes = fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ReadError::NonExistingFile,
        io::ErrorKind::OutOfMemory => ReadError::OutOfMemory,
        _ => ReadError::ReadFailure,
    })?;

    parse_image(path, &bytes)
}

/// Parse an in-memory image. Exposed so tests and tools can load images that
/// never touch the filesystem.
pub fn parse_image(path: impl AsRef<Path>, bytes: &[u8]) -> Result<BytecodeFile, ReadError> {
    let mut cursor = Cursor::new(bytes);

    let stringtab_size = cursor.read_i32().ok_or(ReadError::WrongBytecodeFile)?;
    if stringtab_size < 0 {
        return Err(ReadError::WrongStringTableSize);
    }

    let global_area_size = cursor.read_i32().ok_or(ReadError::WrongBytecodeFile)?;
    if global_area_size < 0 {
        return Err(ReadError::WrongGlobalAreaSize);
    }

    let public_symbols_number = cursor.read_i32().ok_or(ReadError::WrongBytecodeFile)?;
    if public_symbols_number < 0 {
        return Err(ReadError::WrongPublicSymbolsNumber);
    }

    let mut publics = Vec::with_capacity(public_symbols_number as usize);
    for _ in 0..public_symbols_number {
        let name_offset = cursor.read_u32().ok_or(ReadError::WrongBytecodeFile)?;
        let code_offset = cursor.read_u32().ok_or(ReadError::WrongBytecodeFile)?;
        publics.push(PublicSymbol {
            name_offset,
            code_offset,
        });
    }

    let string_table = cursor
        .read_bytes(stringtab_size as usize)
        .ok_or(ReadError::WrongBytecodeFile)?
        .to_vec();
    let code = cursor.rest().to_vec();

    Ok(BytecodeFile::new(
        path.as_ref(),
        string_table,
        publics,
        code,
        global_area_size as u32,
    ))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;

        Some(slice)
    }

    fn read_i32(&mut self) -> Option<i32> {
        let bytes = self.read_bytes(4)?;

        Some(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.read_i32().map(|v| v as u32)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}
