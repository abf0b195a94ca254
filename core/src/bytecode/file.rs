//! In-memory image of a Lama bytecode file.
//!
//! The image owns the string table, the public-symbol table and the code
//! section. It is read-only after loading, except for the verifier patching
//! the second `BEGIN`/`CBEGIN` operand with the discovered stack-growth
//! metadata.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail, ensure};

use super::opcode::Opcode;

/// Name of the public symbol execution starts from.
pub const ENTRYPOINT_NAME: &str = "main";

/// One exported entry: a string-table offset naming it and a code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicSymbol {
    pub name_offset: u32,
    pub code_offset: u32,
}

#[derive(Debug, Clone)]
pub struct BytecodeFile {
    path: PathBuf,
    string_table: Vec<u8>,
    publics: Vec<PublicSymbol>,
    code: Vec<u8>,
    global_area_size: u32,
    entry_offset: Option<u32>,
}

impl BytecodeFile {
    pub fn new(
        path: impl Into<PathBuf>,
        string_table: Vec<u8>,
        publics: Vec<PublicSymbol>,
        code: Vec<u8>,
        global_area_size: u32,
    ) -> Self {
        let mut file = Self {
            path: path.into(),
            string_table,
            publics,
            code,
            global_area_size,
            entry_offset: None,
        };
        file.entry_offset = file.find_entry_offset();

        file
    }

    fn find_entry_offset(&self) -> Option<u32> {
        self.publics
            .iter()
            .find(|sym| {
                self.string_at(sym.name_offset)
                    .is_ok_and(|name| name == ENTRYPOINT_NAME)
            })
            .map(|sym| sym.code_offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn code_byte(&self, offset: u32) -> Result<u8> {
        match self.code.get(offset as usize) {
            Some(&byte) => Ok(byte),
            None => bail!("code offset {:#x} out of range", offset),
        }
    }

    pub fn opcode_at(&self, offset: u32) -> Result<Opcode> {
        let byte = self.code_byte(offset)?;

        match Opcode::from_byte(byte) {
            Some(op) => Ok(op),
            None => bail!("invalid opcode {:#04x} at offset {:#x}", byte, offset),
        }
    }

    /// Little-endian i32 at `offset` in the code section.
    pub fn code_i32(&self, offset: u32) -> Result<i32> {
        let start = offset as usize;
        let Some(bytes) = self.code.get(start..start + 4) else {
            bail!("code offset {:#x} out of range", offset);
        };

        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn string_table_size(&self) -> u32 {
        self.string_table.len() as u32
    }

    /// Null-terminated string starting at a string-table byte offset.
    pub fn string_at(&self, offset: u32) -> Result<&str> {
        let start = offset as usize;
        ensure!(
            start < self.string_table.len(),
            "string table index {} is out of range",
            offset
        );

        let rest = &self.string_table[start..];
        let end = match rest.iter().position(|&b| b == 0) {
            Some(end) => end,
            None => bail!("string at offset {} is not null-terminated", offset),
        };

        match std::str::from_utf8(&rest[..end]) {
            Ok(s) => Ok(s),
            Err(_) => bail!("string at offset {} is not valid UTF-8", offset),
        }
    }

    pub fn global_area_size(&self) -> u32 {
        self.global_area_size
    }

    pub fn publics(&self) -> &[PublicSymbol] {
        &self.publics
    }

    pub fn public_name(&self, sym: PublicSymbol) -> Result<&str> {
        self.string_at(sym.name_offset)
    }

    /// Code offset of the `main` public, if one is exported.
    pub fn entry_offset(&self) -> Option<u32> {
        self.entry_offset
    }

    /// Overwrite the second operand of a `BEGIN`/`CBEGIN` with the packed
    /// `(max_stack << 16) | locals` annotation. Only the verifier calls this.
    pub fn patch_begin_metadata(&mut self, begin_offset: u32, packed: u32) -> Result<()> {
        let op = self.opcode_at(begin_offset)?;
        ensure!(
            matches!(op, Opcode::Begin | Opcode::Cbegin),
            "cannot patch {:?} at offset {:#x}: not a function prologue",
            op,
            begin_offset
        );

        let operand_start = begin_offset as usize + 5;
        ensure!(
            operand_start + 4 <= self.code.len(),
            "truncated prologue at offset {:#x}",
            begin_offset
        );
        self.code[operand_start..operand_start + 4].copy_from_slice(&packed.to_le_bytes());

        Ok(())
    }
}

/// Split the packed second `BEGIN` operand into `(max_stack, locals)`.
pub fn unpack_begin_metadata(operand: i32) -> (u32, u32) {
    let raw = operand as u32;

    (raw >> 16, raw & 0xffff)
}

/// Pack the verifier-discovered max stack growth with the locals count.
pub fn pack_begin_metadata(max_stack: u32, locals: u32) -> u32 {
    (max_stack << 16) | (locals & 0xffff)
}
