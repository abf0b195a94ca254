//! Instruction decoding: lengths, jump targets and disassembly.
//!
//! The length of every instruction is a pure function of its opcode, except
//! `CLOSURE` whose trailing varspec list is sized by its second operand.

use anyhow::{Result, bail};

use super::file::{BytecodeFile, unpack_begin_metadata};
use super::opcode::{CaptureKind, Opcode};

/// Total byte length of the instruction at `offset`, opcode included.
///
/// `None` when the opcode byte is invalid, the instruction is truncated by
/// the end of the code section, or a `CLOSURE` declares a negative capture
/// count.
pub fn instruction_length(code: &[u8], offset: usize) -> Option<usize> {
    let op = Opcode::from_byte(*code.get(offset)?)?;

    let len = match op {
        Opcode::Closure => {
            let captures = read_i32(code, offset + 5)?;
            if captures < 0 {
                return None;
            }

            1 + 4 + 4 + captures as usize * 5
        }
        _ => 1 + 4 * operand_words(op),
    };

    if offset.checked_add(len)? > code.len() {
        return None;
    }

    Some(len)
}

/// The explicit code-offset operand of `JMP`/`CJMPZ`/`CJMPNZ`/`CLOSURE`/`CALL`.
pub fn jump_target(code: &[u8], offset: usize) -> Option<i32> {
    let op = Opcode::from_byte(*code.get(offset)?)?;
    if !op.has_jump_operand() {
        return None;
    }

    read_i32(code, offset + 1)
}

/// Number of fixed 32-bit operands following the opcode byte.
fn operand_words(op: Opcode) -> usize {
    use Opcode::*;

    match op {
        Const | String | Jmp | LdG | LdL | LdA | LdC | LdaG | LdaL | LdaA | LdaC | StG | StL
        | StA | StC | Cjmpz | Cjmpnz | Callc | Array | Line | CallBarray => 1,
        Sexp | Begin | Cbegin | Call | Tag | Fail => 2,
        Closure => unreachable!("CLOSURE length depends on its varspec count"),
        _ => 0,
    }
}

fn read_i32(code: &[u8], offset: usize) -> Option<i32> {
    let bytes = code.get(offset..offset.checked_add(4)?)?;

    Some(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

/// Render the instruction at `offset` as one line of disassembly.
pub fn fmt_instruction(file: &BytecodeFile, offset: u32) -> Result<String> {
    use Opcode::*;

    let code = file.code();
    let op = file.opcode_at(offset)?;
    if instruction_length(code, offset as usize).is_none() {
        bail!("truncated instruction at offset {:#x}", offset);
    }

    let int_operand = |index: u32| file.code_i32(offset + 1 + 4 * index);
    let string_operand = |index: u32| -> Result<&str> { file.string_at(int_operand(index)? as u32) };

    let text = match op {
        BinopAdd | BinopSub | BinopMul | BinopDiv | BinopMod | BinopLt | BinopLe | BinopGt
        | BinopGe | BinopEq | BinopNe | BinopAnd | BinopOr => {
            format!("BINOP {}", op.binop_spelling().expect("binop"))
        }
        Const => format!("CONST {}", int_operand(0)?),
        String => format!("STRING {:?}", string_operand(0)?),
        Sexp => format!("SEXP {:?} {}", string_operand(0)?, int_operand(1)?),
        Sti => "STI".to_string(),
        Sta => "STA".to_string(),
        Jmp => format!("JMP {:#x}", int_operand(0)?),
        End => "END".to_string(),
        Ret => "RET".to_string(),
        Drop => "DROP".to_string(),
        Dup => "DUP".to_string(),
        Swap => "SWAP".to_string(),
        Elem => "ELEM".to_string(),
        LdG | LdL | LdA | LdC => format!("LD {}({})", location_spelling(op), int_operand(0)?),
        LdaG | LdaL | LdaA | LdaC => format!("LDA {}({})", location_spelling(op), int_operand(0)?),
        StG | StL | StA | StC => format!("ST {}({})", location_spelling(op), int_operand(0)?),
        Cjmpz => format!("CJMPz {:#x}", int_operand(0)?),
        Cjmpnz => format!("CJMPnz {:#x}", int_operand(0)?),
        Begin | Cbegin => {
            let (_, locals) = unpack_begin_metadata(int_operand(1)?);
            let mnemonic = if op == Begin { "BEGIN" } else { "CBEGIN" };

            format!("{} {} {}", mnemonic, int_operand(0)?, locals)
        }
        Closure => {
            let mut text = format!("CLOSURE {:#x}", int_operand(0)?);
            let captures = int_operand(1)?;
            let mut cursor = offset + 9;
            for _ in 0..captures {
                let kind = match CaptureKind::from_byte(file.code_byte(cursor)?) {
                    Some(kind) => kind,
                    None => bail!("invalid varspec at offset {:#x}", cursor),
                };
                let index = file.code_i32(cursor + 1)?;
                text.push_str(&format!(" {}({})", kind.spelling(), index));
                cursor += 5;
            }

            text
        }
        Callc => format!("CALLC {}", int_operand(0)?),
        Call => format!("CALL {:#x} {}", int_operand(0)?, int_operand(1)?),
        Tag => format!("TAG {:?} {}", string_operand(0)?, int_operand(1)?),
        Array => format!("ARRAY {}", int_operand(0)?),
        Fail => format!("FAIL {} {}", int_operand(0)?, int_operand(1)?),
        Line => format!("LINE {}", int_operand(0)?),
        PattStr => "PATT =str".to_string(),
        PattString => "PATT #string".to_string(),
        PattArray => "PATT #array".to_string(),
        PattSexp => "PATT #sexp".to_string(),
        PattRef => "PATT #ref".to_string(),
        PattVal => "PATT #val".to_string(),
        PattFun => "PATT #fun".to_string(),
        CallLread => "CALL Lread".to_string(),
        CallLwrite => "CALL Lwrite".to_string(),
        CallLlength => "CALL Llength".to_string(),
        CallLstring => "CALL Lstring".to_string(),
        CallBarray => format!("CALL Barray {}", int_operand(0)?),
    };

    Ok(text)
}

fn location_spelling(op: Opcode) -> char {
    use Opcode::*;

    match op {
        LdG | LdaG | StG => 'G',
        LdL | LdaL | StL => 'L',
        LdA | LdaA | StA => 'A',
        LdC | LdaC | StC => 'C',
        _ => unreachable!("not a location instruction"),
    }
}
