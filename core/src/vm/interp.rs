//! The bytecode interpreter: a single-threaded evaluator dispatching over
//! one opcode at a time.
//!
//! The operand stack carries every live value, so allocating opcodes stage
//! their inputs there before calling into the runtime and clean up only
//! after the allocation returned. Activation records point into the stack;
//! the frame module documents the layout.

use anyhow::{Context, Result, bail, ensure};
use tracing::trace;

use crate::bytecode::{BytecodeFile, CaptureKind, Opcode, unpack_begin_metadata};
use crate::rt::{Runtime, Tag, Value};

use super::frame::{CallStack, Frame};
use super::stack::{OP_STACK_CAPACITY, OpStack};
use super::verifier::{self, MAIN_FUNCTION_ARGUMENTS, Verification};

/// Location string reported by `FAIL` for code without a source file.
const FAIL_LOCATION: &str = "<bytecode>";

/// How much checking the interpreter performs per instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    /// No pre-pass; every operand is validated while executing.
    Dynamic,
    /// Run the static verifier first and elide per-instruction operand
    /// checks when it completes; fall back to dynamic checks when it
    /// reports an `STA`.
    Static,
}

pub struct Interpreter<'a, R: Runtime> {
    file: &'a BytecodeFile,
    rt: &'a mut R,
    stack: OpStack,
    calls: CallStack,
    ip: u32,
    instr_start: u32,
    /// Set by `CALLC`, cleared by `CALL`: tells the next `BEGIN` whether a
    /// closure object sits below the arguments.
    closure_on_call: bool,
    ended: bool,
    /// Per-instruction operand validation; off after complete static
    /// verification.
    checked: bool,
}

/// Verify as requested, then run the file to completion.
pub fn interpret_file<R: Runtime>(
    file: &mut BytecodeFile,
    rt: &mut R,
    mode: VerificationMode,
) -> Result<()> {
    let checked = match mode {
        VerificationMode::Dynamic => true,
        VerificationMode::Static => match verifier::verify(file) {
            Ok(Verification::Complete) => false,
            Ok(Verification::Incomplete) => true,
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("verification failed for {}", file.path().display())));
            }
        },
    };

    Interpreter::with_checks(file, rt, checked).run()
}

impl<'a, R: Runtime> Interpreter<'a, R> {
    pub fn new(file: &'a BytecodeFile, rt: &'a mut R) -> Self {
        Self::with_checks(file, rt, true)
    }

    pub fn with_checks(file: &'a BytecodeFile, rt: &'a mut R, checked: bool) -> Self {
        // Globals, two synthetic `main` arguments, and the slot `main`'s
        // BEGIN adopts as its frame base.
        let prefix = file.global_area_size() as usize + MAIN_FUNCTION_ARGUMENTS as usize + 1;

        Self {
            file,
            rt,
            stack: OpStack::with_prefix(prefix),
            calls: CallStack::new(),
            ip: 0,
            instr_start: 0,
            closure_on_call: false,
            ended: false,
            checked,
        }
    }

    /// Execute until the call stack unwinds past the entry function.
    pub fn run(&mut self) -> Result<()> {
        let Some(entry) = self.file.entry_offset() else {
            bail!(
                "{}: entry point {:?} is not defined",
                self.file.path().display(),
                crate::bytecode::ENTRYPOINT_NAME
            );
        };
        self.ip = entry;

        while !self.ended {
            if let Err(err) = self.step() {
                return Err(err.context(format!(
                    "internal error (file: {}, code offset: {:#x})",
                    self.file.path().display(),
                    self.instr_start
                )));
            }
        }

        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.instr_start = self.ip;
        let op = self.fetch_opcode()?;
        trace!(target: "lama::vm", ip = self.instr_start, ?op);

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
            | Opcode::BinopOr => self.execute_binop(op)?,
            Opcode::Const => {
                let value = self.fetch_i32()?;
                self.push(Value::Int(value))?;
            }
            Opcode::String => {
                let index = self.fetch_i32()?;
                let contents = self.get_string(index)?.as_bytes().to_vec();
                let allocated = self.rt.alloc_string(&contents)?;
                self.push(allocated)?;
            }
            Opcode::Sexp => self.execute_sexp()?,
            Opcode::Sti => self.execute_sti()?,
            Opcode::Sta => self.execute_sta()?,
            Opcode::Jmp => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                self.ip = target as u32;
            }
            Opcode::End | Opcode::Ret => self.execute_return()?,
            Opcode::Drop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.peek(1)?;
                self.push(top)?;
            }
            Opcode::Swap => {
                let first = self.pop()?;
                let second = self.pop()?;
                self.push(first)?;
                self.push(second)?;
            }
            Opcode::Elem => {
                let index = self.pop_int("expected an integer")?;
                let container = self.pop()?;
                let element = self.rt.elem(container, index)?;
                self.push(element)?;
            }
            Opcode::LdG | Opcode::LdL | Opcode::LdA | Opcode::LdC => self.execute_load(op)?,
            Opcode::LdaG | Opcode::LdaL | Opcode::LdaA | Opcode::LdaC => {
                self.execute_load_address(op)?
            }
            Opcode::StG | Opcode::StL | Opcode::StA | Opcode::StC => self.execute_store(op)?,
            Opcode::Cjmpz => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                if self.pop_int("expected an integer")? == 0 {
                    self.ip = target as u32;
                }
            }
            Opcode::Cjmpnz => {
                let target = self.fetch_i32()?;
                self.check_code_offset(target)?;
                if self.pop_int("expected an integer")? != 0 {
                    self.ip = target as u32;
                }
            }
            Opcode::Begin => self.execute_begin(false)?,
            Opcode::Cbegin => self.execute_begin(true)?,
            Opcode::Closure => self.execute_closure()?,
            Opcode::Callc => self.execute_call_closure()?,
            Opcode::Call => self.execute_call()?,
            Opcode::Tag => {
                let index = self.fetch_i32()?;
                let hash = self.rt.tag_hash(self.get_string(index)?);
                let members = self.fetch_i32()?;
                self.check_non_negative(members, "sexp members count must not be negative")?;
                let value = self.pop()?;
                self.push(Value::from_bool(self.rt.tag_match(value, hash, members)))?;
            }
            Opcode::Array => {
                let len = self.fetch_i32()?;
                self.check_non_negative(len, "array length must not be negative")?;
                let value = self.pop()?;
                self.push(Value::from_bool(self.rt.array_shape_match(value, len)))?;
            }
            Opcode::Fail => {
                let line = self.fetch_i32()?;
                ensure!(line >= 1, "line number must be greater than zero");
                let col = self.fetch_i32()?;
                ensure!(col >= 1, "column number must be greater than zero");
                let value = self.pop()?;

                return Err(self.rt.match_failure(value, FAIL_LOCATION, line, col));
            }
            Opcode::Line => {
                self.fetch_i32()?;
            }
            Opcode::PattStr => {
                let second = self.pop()?;
                let first = self.pop()?;
                self.push(Value::from_bool(self.rt.string_match(first, second)))?;
            }
            Opcode::PattString => self.execute_kind_pattern(Tag::String)?,
            Opcode::PattArray => self.execute_kind_pattern(Tag::Array)?,
            Opcode::PattSexp => self.execute_kind_pattern(Tag::Sexp)?,
            Opcode::PattFun => self.execute_kind_pattern(Tag::Closure)?,
            Opcode::PattRef => {
                let value = self.pop()?;
                self.push(Value::from_bool(!value.is_int()))?;
            }
            Opcode::PattVal => {
                let value = self.pop()?;
                self.push(Value::from_bool(value.is_int()))?;
            }
            Opcode::CallLread => {
                let value = self.rt.read()?;
                self.push(Value::Int(value))?;
            }
            Opcode::CallLwrite => {
                let value = self.pop_int("expected an integer")?;
                self.rt.write(value)?;
                self.push(Value::Int(0))?;
            }
            Opcode::CallLlength => {
                let value = self.pop()?;
                let len = self.rt.length(value)?;
                self.push(Value::Int(len))?;
            }
            Opcode::CallLstring => {
                // Keep the argument staged on the stack across the
                // allocation, then replace it with the result.
                let value = self.peek(1)?;
                let rendered = self.rt.string_of(value)?;
                self.pop()?;
                self.push(rendered)?;
            }
            Opcode::CallBarray => {
                let len = self.fetch_i32()?;
                self.check_non_negative(len, "array length must not be negative")?;
                let allocated = self.rt.alloc_array(self.stack.peek_slice(len as usize)?)?;
                self.stack.pop_many(len as usize)?;
                self.push(allocated)?;
            }
        }

        Ok(())
    }

    /* instruction fetching */

    fn fetch_opcode(&mut self) -> Result<Opcode> {
        let byte = self.file.code_byte(self.ip)?;
        let Some(op) = Opcode::from_byte(byte) else {
            bail!("invalid instruction {:#04x}", byte);
        };
        self.ip += 1;

        Ok(op)
    }

    fn fetch_byte(&mut self) -> Result<u8> {
        let byte = self.file.code_byte(self.ip)?;
        self.ip += 1;

        Ok(byte)
    }

    fn fetch_i32(&mut self) -> Result<i32> {
        let value = self.file.code_i32(self.ip)?;
        self.ip += 4;

        Ok(value)
    }

    fn get_string(&self, index: i32) -> Result<&str> {
        if self.checked {
            self.check_non_negative(index, "string table index must not be negative")?;
            ensure!(
                (index as u32) < self.file.string_table_size(),
                "string table index is out of range"
            );
        }

        self.file.string_at(index as u32)
    }

    /* operand stack helpers */

    fn push(&mut self, value: Value) -> Result<()> {
        self.stack.push(value)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop()
    }

    fn peek(&self, depth: usize) -> Result<Value> {
        self.stack.peek(depth)
    }

    fn pop_int(&mut self, message: &'static str) -> Result<i32> {
        self.pop()?.as_int().context(message)
    }

    /* checks */

    fn check_non_negative(&self, value: i32, message: &'static str) -> Result<()> {
        if self.checked {
            ensure!(value >= 0, message);
        }

        Ok(())
    }

    fn check_code_offset(&self, offset: i32) -> Result<()> {
        if self.checked {
            ensure!(
                offset >= 0 && (offset as usize) < self.file.code_size(),
                "code offset out of range"
            );
        }

        Ok(())
    }

    fn check_local_index(&self, frame: Frame, index: i32) -> Result<()> {
        if self.checked {
            ensure!(
                index >= 0 && (index as u32) < frame.locals,
                "local value index out of range"
            );
        }

        Ok(())
    }

    fn check_argument_index(&self, frame: Frame, index: i32) -> Result<()> {
        if self.checked {
            ensure!(
                index >= 0 && (index as u32) < frame.args,
                "argument value index out of range"
            );
        }

        Ok(())
    }

    /// Resolve the closure object the current frame reads captures from,
    /// validating `index` against it on the way.
    fn capture_source(&self, frame: Frame, index: i32) -> Result<Value> {
        if self.checked {
            ensure!(frame.has_captures, "function cannot use captured values");
            ensure!(index >= 0, "captured value index must not be negative");
        }

        let closure = self.frame_closure(frame)?;
        if self.checked {
            ensure!(
                (index as u32) < self.rt.capture_count(closure)?,
                "captured value index out of range"
            );
        }

        Ok(closure)
    }

    fn global_slot(&self, index: i32) -> Result<usize> {
        if self.checked {
            ensure!(index >= 0, "global value index must not be negative");
            ensure!(
                (index as u32) < self.file.global_area_size(),
                "global value index out of range"
            );
        }

        Ok(index as usize)
    }

    /* value locations */

    fn frame_closure(&self, frame: Frame) -> Result<Value> {
        self.stack.slot(frame.closure_slot())
    }

    fn load_location(&mut self, kind: CaptureKind, index: i32) -> Result<Value> {
        match kind {
            CaptureKind::Global => {
                let slot = self.global_slot(index)?;
                self.stack.slot(slot)
            }
            CaptureKind::Local => {
                let frame = self.calls.peek()?;
                self.check_local_index(frame, index)?;
                self.stack.slot(frame.local_slot(index as u32))
            }
            CaptureKind::Argument => {
                let frame = self.calls.peek()?;
                self.check_argument_index(frame, index)?;
                self.stack.slot(frame.arg_slot(index as u32))
            }
            CaptureKind::Capture => {
                let frame = self.calls.peek()?;
                let closure = self.capture_source(frame, index)?;
                self.rt.capture(closure, index as u32)
            }
        }
    }

    fn execute_load(&mut self, op: Opcode) -> Result<()> {
        let index = self.fetch_i32()?;
        let kind = match op {
            Opcode::LdG => CaptureKind::Global,
            Opcode::LdL => CaptureKind::Local,
            Opcode::LdA => CaptureKind::Argument,
            _ => CaptureKind::Capture,
        };
        let value = self.load_location(kind, index)?;

        self.push(value)
    }

    fn execute_load_address(&mut self, op: Opcode) -> Result<()> {
        let index = self.fetch_i32()?;
        let address = match op {
            Opcode::LdaG => Value::StackRef(self.global_slot(index)? as u32),
            Opcode::LdaL => {
                let frame = self.calls.peek()?;
                self.check_local_index(frame, index)?;
                Value::StackRef(frame.local_slot(index as u32) as u32)
            }
            Opcode::LdaA => {
                let frame = self.calls.peek()?;
                self.check_argument_index(frame, index)?;
                Value::StackRef(frame.arg_slot(index as u32) as u32)
            }
            _ => {
                let frame = self.calls.peek()?;
                let closure = self.capture_source(frame, index)?;
                let handle = closure.as_heap().context("expected a closure")?;
                Value::CellRef(handle, index as u32)
            }
        };

        self.push(address)
    }

    fn execute_store(&mut self, op: Opcode) -> Result<()> {
        let index = self.fetch_i32()?;
        let value = self.pop()?;

        match op {
            Opcode::StG => {
                let slot = self.global_slot(index)?;
                self.stack.set_slot(slot, value)?;
            }
            Opcode::StL => {
                let frame = self.calls.peek()?;
                self.check_local_index(frame, index)?;
                self.stack.set_slot(frame.local_slot(index as u32), value)?;
            }
            Opcode::StA => {
                let frame = self.calls.peek()?;
                self.check_argument_index(frame, index)?;
                self.stack.set_slot(frame.arg_slot(index as u32), value)?;
            }
            _ => {
                let frame = self.calls.peek()?;
                let closure = self.capture_source(frame, index)?;
                self.rt.set_capture(closure, index as u32, value)?;
            }
        }

        self.push(value)
    }

    /* stores through addresses */

    fn store_through(&mut self, target: Value, value: Value) -> Result<()> {
        match target {
            Value::StackRef(slot) => self.stack.set_slot(slot as usize, value),
            Value::CellRef(handle, index) => {
                self.rt.set_capture(Value::Heap(handle), index, value)
            }
            _ => bail!("expected a variable reference"),
        }
    }

    fn execute_sti(&mut self) -> Result<()> {
        let value = self.pop()?;
        let target = self.pop()?;
        ensure!(!target.is_int(), "expected a variable reference");
        self.store_through(target, value)?;

        self.push(value)
    }

    fn execute_sta(&mut self) -> Result<()> {
        let value = self.pop()?;
        let target = self.pop()?;

        // A boxed integer on top means "indexed store into the aggregate
        // beneath"; anything else is a direct store through an address.
        match target.as_int() {
            Some(index) => {
                let base = self.pop()?;
                self.rt.store_indexed(base, index, value)?;
            }
            None => self.store_through(target, value)?,
        }

        self.push(value)
    }

    /* functions */

    fn execute_begin(&mut self, has_captures: bool) -> Result<()> {
        let args = self.fetch_i32()?;
        self.check_non_negative(args, "arguments number must not be negative")?;
        let packed = self.fetch_i32()?;
        let (max_stack, locals) = unpack_begin_metadata(packed);

        if has_captures && self.checked {
            let closure = self.peek(1 + args as usize + 1)?;
            ensure!(
                self.rt.kind_of(closure) == Tag::Closure,
                "closure value must be present in stack"
            );
        }

        if !self.checked {
            // The verifier proved this bound; one check per call replaces
            // the per-push checks.
            ensure!(
                self.stack.len() + locals as usize + max_stack as usize <= OP_STACK_CAPACITY,
                "operand stack exhausted"
            );
        }

        let frame = Frame {
            base: self.stack.top_index()?,
            args: args as u32,
            locals,
            has_closure: self.closure_on_call,
            has_captures,
        };
        self.calls.push(frame)?;

        for _ in 0..locals {
            self.push(Value::Int(0))?;
        }

        Ok(())
    }

    fn execute_return(&mut self) -> Result<()> {
        let frame = self.calls.pop()?;
        let return_ip = self
            .stack
            .slot(frame.base)?
            .as_int()
            .context("corrupted return address")?;
        let result = self.pop()?;

        self.stack.pop_many(frame.locals as usize)?;
        self.pop()?; // return ip
        self.stack.pop_many(frame.args as usize)?;
        if frame.has_closure {
            self.pop()?;
        }

        self.push(result)?;
        self.ip = return_ip as u32;

        if self.calls.is_empty() {
            self.ended = true;
        }

        Ok(())
    }

    fn execute_closure(&mut self) -> Result<()> {
        let entry = self.fetch_i32()?;
        self.check_code_offset(entry)?;
        let captures = self.fetch_i32()?;
        self.check_non_negative(captures, "captures number must not be negative")?;

        // Stage the entry offset and every captured value on the stack so a
        // collecting runtime sees them while allocating the closure block.
        self.push(Value::Int(entry))?;
        for _ in 0..captures {
            let kind = match CaptureKind::from_byte(self.fetch_byte()?) {
                Some(kind) => kind,
                None => bail!("invalid varspec"),
            };
            let index = self.fetch_i32()?;
            let value = self.load_location(kind, index)?;
            self.push(value)?;
        }

        let staged = self.stack.peek_slice(captures as usize + 1)?;
        let closure = self.rt.alloc_closure(staged)?;
        self.stack.pop_many(captures as usize + 1)?;

        self.push(closure)
    }

    fn execute_call(&mut self) -> Result<()> {
        let target = self.fetch_i32()?;
        self.check_code_offset(target)?;
        ensure!(
            self.file.opcode_at(target as u32)? == Opcode::Begin,
            "CALL should go to BEGIN instruction"
        );

        let args = self.fetch_i32()?;
        self.check_non_negative(args, "arguments number must not be negative")?;

        self.push(Value::Int(self.ip as i32))?;
        self.ip = target as u32;
        self.closure_on_call = false;

        Ok(())
    }

    fn execute_call_closure(&mut self) -> Result<()> {
        let args = self.fetch_i32()?;
        self.check_non_negative(args, "arguments number must not be negative")?;

        let closure = self.peek(args as usize + 1)?;
        let target = self.rt.closure_entry(closure)?;
        ensure!(
            target >= 0 && (target as usize) < self.file.code_size(),
            "code offset out of range"
        );
        let target_op = self.file.opcode_at(target as u32)?;
        ensure!(
            matches!(target_op, Opcode::Begin | Opcode::Cbegin),
            "CALLC should go to BEGIN or CBEGIN instruction"
        );

        self.push(Value::Int(self.ip as i32))?;
        self.ip = target as u32;
        self.closure_on_call = true;

        Ok(())
    }

    /* allocation opcodes */

    fn execute_sexp(&mut self) -> Result<()> {
        let index = self.fetch_i32()?;
        let hash = self.rt.tag_hash(self.get_string(index)?);
        // The tag fingerprint joins the already-staged members on the stack
        // before the allocation call.
        self.push(Value::Int(hash))?;

        let members = self.fetch_i32()?;
        self.check_non_negative(members, "sexp members count must not be negative")?;

        let staged = self.stack.peek_slice(members as usize + 1)?;
        let sexp = self.rt.alloc_sexp(staged)?;
        self.stack.pop_many(members as usize + 1)?;

        self.push(sexp)
    }

    /* binops */

    fn execute_binop(&mut self, op: Opcode) -> Result<()> {
        use Opcode::*;

        if op == BinopEq {
            let second = self.pop()?;
            let first = self.pop()?;
            ensure!(
                first.is_int() || second.is_int(),
                "at least one of equality operands must be an integer"
            );
            let equal = match (first.as_int(), second.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            };

            return self.push(Value::from_bool(equal));
        }

        let y = self.pop_int("expected an integer")?;
        let x = self.pop_int("expected an integer")?;

        let result = match op {
            BinopAdd => Value::Int(x.wrapping_add(y)),
            BinopSub => Value::Int(x.wrapping_sub(y)),
            BinopMul => Value::Int(x.wrapping_mul(y)),
            BinopDiv => {
                ensure!(y != 0, "/ 0");
                Value::Int(x.wrapping_div(y))
            }
            BinopMod => {
                ensure!(y != 0, "% 0");
                Value::Int(x.wrapping_rem(y))
            }
            BinopLt => Value::from_bool(x < y),
            BinopLe => Value::from_bool(x <= y),
            BinopGt => Value::from_bool(x > y),
            BinopGe => Value::from_bool(x >= y),
            BinopNe => Value::from_bool(x != y),
            BinopAnd => Value::from_bool(if x != 0 { y != 0 } else { false }),
            BinopOr => Value::from_bool(if x == 0 { y != 0 } else { true }),
            _ => bail!("invalid instruction"),
        };

        self.push(result)
    }

    fn execute_kind_pattern(&mut self, expected: Tag) -> Result<()> {
        let value = self.pop()?;

        self.push(Value::from_bool(self.rt.kind_of(value) == expected))
    }
}
