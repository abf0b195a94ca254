//! Programmatic assembly of bytecode images.
//!
//! The builder is the encode side of the on-disk container: it lays out the
//! header, the publics table, the string table and the code section exactly
//! as the reader consumes them. Tests, benches and tooling build their
//! fixtures through it instead of hand-writing byte arrays.

use std::collections::HashMap;

use super::opcode::{CaptureKind, Opcode};

#[derive(Debug, Default)]
pub struct ImageBuilder {
    strings: Vec<u8>,
    interned: HashMap<String, u32>,
    publics: Vec<(u32, u32)>,
    code: Vec<u8>,
    global_area_size: u32,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_area_size(&mut self, words: u32) {
        self.global_area_size = words;
    }

    /// Append a null-terminated string to the string table, reusing the
    /// offset when the same string was interned before.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.interned.get(s) {
            return offset;
        }

        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.interned.insert(s.to_string(), offset);

        offset
    }

    pub fn add_public(&mut self, name_offset: u32, code_offset: u32) {
        self.publics.push((name_offset, code_offset));
    }

    /// Current code offset, i.e. where the next emitted byte lands.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit_op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_op_i32(&mut self, op: Opcode, operand: i32) {
        self.emit_op(op);
        self.emit_i32(operand);
    }

    pub fn emit_op_i32x2(&mut self, op: Opcode, first: i32, second: i32) {
        self.emit_op(op);
        self.emit_i32(first);
        self.emit_i32(second);
    }

    pub fn emit_const(&mut self, value: i32) {
        self.emit_op_i32(Opcode::Const, value);
    }

    pub fn emit_begin(&mut self, args: i32, locals: i32) {
        self.emit_op_i32x2(Opcode::Begin, args, locals);
    }

    pub fn emit_cbegin(&mut self, args: i32, locals: i32) {
        self.emit_op_i32x2(Opcode::Cbegin, args, locals);
    }

    pub fn emit_call(&mut self, addr: u32, args: i32) {
        self.emit_op_i32x2(Opcode::Call, addr as i32, args);
    }

    pub fn emit_closure(&mut self, addr: u32, varspecs: &[(CaptureKind, i32)]) {
        self.emit_op(Opcode::Closure);
        self.emit_i32(addr as i32);
        self.emit_i32(varspecs.len() as i32);
        for &(kind, index) in varspecs {
            self.code.push(kind as u8);
            self.emit_i32(index);
        }
    }

    /// Emit a jump-family instruction with a placeholder target; returns the
    /// operand offset to pass to [`patch_i32`] once the target is known.
    ///
    /// [`patch_i32`]: ImageBuilder::patch_i32
    pub fn emit_forward(&mut self, op: Opcode) -> u32 {
        self.emit_op(op);
        let at = self.here();
        self.emit_i32(0);

        at
    }

    pub fn patch_i32(&mut self, at: u32, value: i32) {
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Serialize the image in the on-disk layout.
    pub fn build(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(12 + self.publics.len() * 8 + self.strings.len() + self.code.len());

        out.extend_from_slice(&(self.strings.len() as i32).to_le_bytes());
        out.extend_from_slice(&(self.global_area_size as i32).to_le_bytes());
        out.extend_from_slice(&(self.publics.len() as i32).to_le_bytes());
        for &(name_offset, code_offset) in &self.publics {
            out.extend_from_slice(&name_offset.to_le_bytes());
            out.extend_from_slice(&code_offset.to_le_bytes());
        }
        out.extend_from_slice(&self.strings);
        out.extend_from_slice(&self.code);

        out
    }
}
