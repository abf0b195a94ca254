//! Static verification of bytecode by abstract interpretation.
//!
//! A worklist of abstract states is seeded at the entry point and at every
//! call and closure target. Each code offset must be reached with one
//! consistent operand-stack depth; operands are range-checked against the
//! file. On success the second operand of every traversed `BEGIN`/`CBEGIN`
//! is rewritten with the function's maximum stack growth, so the interpreter
//! can replace per-push overflow checks with one check per call.
//!
//! `STA` stores through a runtime-computed address and cannot be modelled
//! statically; encountering one aborts the pass with
//! [`Verification::Incomplete`] and the caller falls back to dynamic checks.

use std::collections::BTreeMap;
use std::fmt;

use crate::bytecode::{
    BytecodeFile, CaptureKind, Opcode, pack_begin_metadata, unpack_begin_metadata,
};

use super::stack::{CALLSTACK_CAPACITY, OP_STACK_CAPACITY};

/// Number of synthetic arguments the entry function is invoked with.
pub const MAIN_FUNCTION_ARGUMENTS: u32 = 2;

/// Outcome of a verification pass that did not find an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Every reachable instruction was proven consistent; `BEGIN` operands
    /// carry the stack-growth annotation.
    Complete,
    /// An `STA` was reached; nothing was patched and the interpreter must
    /// keep its dynamic checks.
    Incomplete,
}

#[derive(Debug)]
pub struct VerifyError {
    pub offset: u32,
    message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification error (code offset {:#x}): {}",
            self.offset, self.message
        )
    }
}

impl std::error::Error for VerifyError {}

/// Abstract machine state attached to one worklist entry.
#[derive(Debug, Clone, Copy)]
struct AbstractState {
    /// Offset of the enclosing function's `BEGIN`/`CBEGIN`.
    function_begin: u32,
    args: u32,
    start_ip: u32,
    locals: u32,
    stack: u32,
    callstack: u32,
}

enum Step {
    Continue,
    Incomplete,
}

pub struct Verifier<'a> {
    file: &'a mut BytecodeFile,
    ip: u32,
    instr_start: u32,
    depths: Vec<Option<u32>>,
    max_stack: BTreeMap<u32, u32>,
    worklist: Vec<AbstractState>,
    state: AbstractState,
    fall_through: bool,
}

/// Run the static pass over a whole file.
pub fn verify(file: &mut BytecodeFile) -> Result<Verification, VerifyError> {
    Verifier::new(file)?.run()
}

impl<'a> Verifier<'a> {
    pub fn new(file: &'a mut BytecodeFile) -> Result<Self, VerifyError> {
        let Some(entry) = file.entry_offset() else {
            return Err(VerifyError {
                offset: 0,
                message: format!("entry point {:?} is not defined", crate::bytecode::ENTRYPOINT_NAME),
            });
        };

        let seed = AbstractState {
            function_begin: entry,
            args: MAIN_FUNCTION_ARGUMENTS,
            start_ip: entry,
            locals: 0,
            stack: 0,
            callstack: 1,
        };
        let depths = vec![None; file.code_size()];

        Ok(Self {
            file,
            ip: entry,
            instr_start: entry,
            depths,
            max_stack: BTreeMap::new(),
            worklist: vec![seed],
            state: seed,
            fall_through: true,
        })
    }

    pub fn run(mut self) -> Result<Verification, VerifyError> {
        while let Some(state) = self.worklist.pop() {
            self.state = state;
            match self.step()? {
                Step::Continue => {}
                Step::Incomplete => return Ok(Verification::Incomplete),
            }
        }

        let patches: Vec<(u32, u32)> = self
            .max_stack
            .iter()
            .map(|(&begin, &max)| (begin, max))
            .collect();
        for (begin, max) in patches {
            let operand = self
                .file
                .code_i32(begin + 5)
                .map_err(|err| self.err_at(begin, err))?;
            let (_, locals) = unpack_begin_metadata(operand);
            self.file
                .patch_begin_metadata(begin, pack_begin_metadata(max, locals))
                .map_err(|err| self.err_at(begin, err))?;
        }

        Ok(Verification::Complete)
    }

    fn step(&mut self) -> Result<Step, VerifyError> {
        self.ip = self.state.start_ip;
        self.instr_start = self.ip;

        match self.depths.get(self.instr_start as usize) {
            Some(Some(depth)) => {
                if *depth != self.state.stack {
                    return Err(self.err("stack size inconsistency"));
                }

                // Already traversed from here with the same depth.
                return Ok(Step::Continue);
            }
            Some(None) => self.depths[self.instr_start as usize] = Some(self.state.stack),
            None => return Err(self.err("code offset out of range")),
        }

        self.note_peak(0)?;
        self.fall_through = true;

        let op = self.fetch_opcode()?;
        match op {
            Opcode::BinopAdd
            | Opcode::BinopSub
            | Opcode::BinopMul
            | Opcode::BinopDiv
            | Opcode::BinopMod
            | Opcode::BinopLt
            | Opcode::BinopLe
            | Opcode::BinopGt
            | Opcode::BinopGe
            | Opcode::BinopEq
            | Opcode::BinopNe
            | Opcode::BinopAnd
            | Opcode::BinopOr => {
                self.pop_words(2)?;
                self.push_word()?;
            }
            Opcode::Const => {
                self.fetch_i32()?;
                self.push_word()?;
            }
            Opcode::String => {
                let index = self.fetch_i32()?;
                self.check_string_index(index)?;
                self.push_word()?;
            }
            Opcode::Sexp => {
                let index = self.fetch_i32()?;
                self.check_string_index(index)?;
                let members = self.fetch_i32()?;
                self.check_non_negative(members, "sexp members count must not be negative")?;
                self.note_peak(1)?; // staged tag fingerprint
                self.pop_words(members as u32)?;
                self.push_word()?;
            }
            Opcode::Sti => {
                self.pop_words(2)?;
                self.push_word()?;
            }
            Opcode::Sta => return Ok(Step::Incomplete),
            Opcode::Jmp => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                self.enqueue(AbstractState {
                    start_ip: target as u32,
                    ..self.state
                });
                self.fall_through = false;
            }
            Opcode::End | Opcode::Ret => {
                if self.state.callstack == 0 {
                    return Err(self.err("callstack is empty"));
                }
                self.state.callstack -= 1;
                self.fall_through = false;
            }
            Opcode::Drop => self.pop_words(1)?,
            Opcode::Dup => {
                self.pop_words(1)?;
                self.push_words(2)?;
            }
            Opcode::Swap => {
                self.pop_words(2)?;
                self.push_words(2)?;
            }
            Opcode::Elem => {
                self.pop_words(2)?;
                self.push_word()?;
            }
            Opcode::LdG | Opcode::LdaG => {
                let index = self.fetch_i32()?;
                self.check_global_index(index)?;
                self.push_word()?;
            }
            Opcode::LdL | Opcode::LdaL => {
                let index = self.fetch_i32()?;
                self.check_local_index(index)?;
                self.push_word()?;
            }
            Opcode::LdA | Opcode::LdaA => {
                let index = self.fetch_i32()?;
                self.check_argument_index(index)?;
                self.push_word()?;
            }
            Opcode::LdC | Opcode::LdaC => {
                let index = self.fetch_i32()?;
                self.check_capture_index(index)?;
                self.push_word()?;
            }
            Opcode::StG => {
                let index = self.fetch_i32()?;
                self.check_global_index(index)?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::StL => {
                let index = self.fetch_i32()?;
                self.check_local_index(index)?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::StA => {
                let index = self.fetch_i32()?;
                self.check_argument_index(index)?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::StC => {
                let index = self.fetch_i32()?;
                self.check_capture_index(index)?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::Cjmpz | Opcode::Cjmpnz => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                self.pop_words(1)?;
                self.enqueue(AbstractState {
                    start_ip: target as u32,
                    ..self.state
                });
                self.enqueue(AbstractState {
                    start_ip: self.ip,
                    ..self.state
                });
                self.fall_through = false;
            }
            Opcode::Begin | Opcode::Cbegin => {
                let args = self.fetch_i32()?;
                self.check_non_negative(args, "arguments number must not be negative")?;
                if args as u32 != self.state.args {
                    return Err(self.err(
                        "the number of passed arguments differs from the number declared in BEGIN",
                    ));
                }

                let packed = self.fetch_i32()?;
                let (_, locals) = unpack_begin_metadata(packed);
                self.state.locals = locals;
            }
            Opcode::Closure => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                let target_op = self
                    .file
                    .opcode_at(target as u32)
                    .map_err(|err| self.err(err))?;
                if !matches!(target_op, Opcode::Begin | Opcode::Cbegin) {
                    return Err(
                        self.err("closure function should start with BEGIN or CBEGIN instruction")
                    );
                }

                let captures = self.fetch_i32()?;
                self.check_non_negative(captures, "captures number must not be negative")?;
                for _ in 0..captures {
                    let kind = self.fetch_byte()?;
                    let index = self.fetch_i32()?;
                    match CaptureKind::from_byte(kind) {
                        Some(CaptureKind::Global) => self.check_global_index(index)?,
                        Some(CaptureKind::Local) => self.check_local_index(index)?,
                        Some(CaptureKind::Argument) => self.check_argument_index(index)?,
                        Some(CaptureKind::Capture) => self.check_capture_index(index)?,
                        None => return Err(self.err("invalid varspec")),
                    }
                }

                // The entry offset and every capture are staged before the
                // closure block is allocated.
                self.note_peak(captures as u32 + 1)?;
                self.push_word()?;

                // The body is only ever entered through CALLC, whose target
                // is invisible statically; traverse it from here with the
                // argument count its own prologue declares.
                let declared_args = self
                    .file
                    .code_i32(target as u32 + 1)
                    .map_err(|err| self.err(err))?;
                self.check_non_negative(declared_args, "arguments number must not be negative")?;
                self.check_callstack_growth()?;
                self.enqueue(AbstractState {
                    function_begin: target as u32,
                    args: declared_args as u32,
                    start_ip: target as u32,
                    locals: 0,
                    stack: 0,
                    callstack: self.state.callstack + 1,
                });
            }
            Opcode::Callc => {
                let args = self.fetch_i32()?;
                self.check_non_negative(args, "arguments number must not be negative")?;
                self.note_peak(1)?; // pushed return ip
                self.pop_words(args as u32 + 1)?;
                self.push_word()?;
            }
            Opcode::Call => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                let target_op = self
                    .file
                    .opcode_at(target as u32)
                    .map_err(|err| self.err(err))?;
                if target_op != Opcode::Begin {
                    return Err(self.err("CALL should go to BEGIN instruction"));
                }

                let args = self.fetch_i32()?;
                self.check_non_negative(args, "arguments number must not be negative")?;
                self.note_peak(1)?; // pushed return ip
                if self.state.stack < args as u32 {
                    return Err(self.err("operand stack is empty"));
                }
                self.check_callstack_growth()?;

                self.enqueue(AbstractState {
                    function_begin: target as u32,
                    args: args as u32,
                    start_ip: target as u32,
                    locals: 0,
                    stack: 0,
                    callstack: self.state.callstack + 1,
                });
                self.enqueue(AbstractState {
                    start_ip: self.ip,
                    stack: self.state.stack - args as u32 + 1,
                    ..self.state
                });
                self.fall_through = false;
            }
            Opcode::Tag => {
                let index = self.fetch_i32()?;
                self.check_string_index(index)?;
                let members = self.fetch_i32()?;
                self.check_non_negative(members, "sexp members count must not be negative")?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::Array => {
                let len = self.fetch_i32()?;
                self.check_non_negative(len, "array length must not be negative")?;
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::Fail => {
                let line = self.fetch_i32()?;
                let col = self.fetch_i32()?;
                if line < 1 {
                    return Err(self.err("line number should be greater than 0"));
                }
                if col < 1 {
                    return Err(self.err("column number should be greater than 0"));
                }
                self.fall_through = false;
            }
            Opcode::Line => {
                self.fetch_i32()?;
            }
            Opcode::PattStr => {
                self.pop_words(2)?;
                self.push_word()?;
            }
            Opcode::PattString
            | Opcode::PattArray
            | Opcode::PattSexp
            | Opcode::PattRef
            | Opcode::PattVal
            | Opcode::PattFun => {
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::CallLread => self.push_word()?,
            Opcode::CallLwrite | Opcode::CallLlength | Opcode::CallLstring => {
                self.pop_words(1)?;
                self.push_word()?;
            }
            Opcode::CallBarray => {
                let len = self.fetch_i32()?;
                self.check_non_negative(len, "array length must not be negative")?;
                self.pop_words(len as u32)?;
                self.push_word()?;
            }
        }

        if self.fall_through {
            self.enqueue(AbstractState {
                start_ip: self.ip,
                ..self.state
            });
        }

        Ok(Step::Continue)
    }

    fn enqueue(&mut self, state: AbstractState) {
        self.worklist.push(state);
    }

    fn fetch_byte(&mut self) -> Result<u8, VerifyError> {
        let byte = self
            .file
            .code_byte(self.ip)
            .map_err(|_| self.err("code offset out of range"))?;
        self.ip += 1;

        Ok(byte)
    }

    fn fetch_opcode(&mut self) -> Result<Opcode, VerifyError> {
        let byte = self.fetch_byte()?;

        Opcode::from_byte(byte).ok_or_else(|| self.err("invalid instruction"))
    }

    fn fetch_i32(&mut self) -> Result<i32, VerifyError> {
        let value = self
            .file
            .code_i32(self.ip)
            .map_err(|_| self.err("code offset out of range"))?;
        self.ip += 4;

        Ok(value)
    }

    fn push_words(&mut self, words: u32) -> Result<(), VerifyError> {
        if self.state.stack as usize + words as usize >= OP_STACK_CAPACITY {
            return Err(self.err("operand stack exhausted"));
        }
        self.state.stack += words;

        self.note_peak(0)
    }

    fn push_word(&mut self) -> Result<(), VerifyError> {
        self.push_words(1)
    }

    fn pop_words(&mut self, words: u32) -> Result<(), VerifyError> {
        if self.state.stack < words {
            return Err(self.err("operand stack is empty"));
        }
        self.state.stack -= words;

        Ok(())
    }

    /// Record the current depth, plus `extra` transient slots the interpreter
    /// stages mid-instruction, as a candidate for the enclosing function's
    /// maximum stack growth.
    fn note_peak(&mut self, extra: u32) -> Result<(), VerifyError> {
        let peak = self.state.stack as usize + extra as usize;
        if peak >= OP_STACK_CAPACITY {
            return Err(self.err("operand stack exhausted"));
        }

        let entry = self.max_stack.entry(self.state.function_begin).or_insert(0);
        *entry = (*entry).max(peak as u32);

        Ok(())
    }

    fn check_callstack_growth(&self) -> Result<(), VerifyError> {
        if self.state.callstack as usize >= CALLSTACK_CAPACITY {
            return Err(self.err("callstack exhausted"));
        }

        Ok(())
    }

    fn check_code_offset(&self, offset: i32) -> Result<(), VerifyError> {
        if offset < 0 || offset as usize >= self.file.code_size() {
            return Err(self.err("code offset out of range"));
        }

        Ok(())
    }

    fn check_string_index(&self, index: i32) -> Result<(), VerifyError> {
        if index < 0 || index as u32 >= self.file.string_table_size() {
            return Err(self.err("string table index is out of range"));
        }

        Ok(())
    }

    fn check_global_index(&self, index: i32) -> Result<(), VerifyError> {
        if index < 0 || index as u32 >= self.file.global_area_size() {
            return Err(self.err("global value index out of range"));
        }

        Ok(())
    }

    fn check_local_index(&self, index: i32) -> Result<(), VerifyError> {
        if index < 0 || index as u32 >= self.state.locals {
            return Err(self.err("local value index out of range"));
        }

        Ok(())
    }

    fn check_argument_index(&self, index: i32) -> Result<(), VerifyError> {
        if index < 0 || index as u32 >= self.state.args {
            return Err(self.err("argument value index out of range"));
        }

        Ok(())
    }

    fn check_capture_index(&self, index: i32) -> Result<(), VerifyError> {
        // The capture count lives in the closure object and is unknown
        // statically; only the sign can be checked here.
        self.check_non_negative(index, "captured value index out of range")
    }

    fn check_non_negative(&self, value: i32, message: &str) -> Result<(), VerifyError> {
        if value < 0 {
            return Err(self.err(message));
        }

        Ok(())
    }

    fn err(&self, message: impl ToString) -> VerifyError {
        self.err_at(self.instr_start, message)
    }

    fn err_at(&self, offset: u32, message: impl ToString) -> VerifyError {
        VerifyError {
            offset,
            message: message.to_string(),
        }
    }
}
