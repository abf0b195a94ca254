//! The Lama instruction set.
//!
//! Opcodes are a single byte; the numeric assignments are fixed by the
//! compiler and must never be renumbered.

/// One-byte instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    BinopAdd = 0x01,
    BinopSub = 0x02,
    BinopMul = 0x03,
    BinopDiv = 0x04,
    BinopMod = 0x05,

    BinopLt = 0x06,
    BinopLe = 0x07,
    BinopGt = 0x08,
    BinopGe = 0x09,

    BinopEq = 0x0a,
    BinopNe = 0x0b,

    BinopAnd = 0x0c,
    BinopOr = 0x0d,

    Const = 0x10,
    String = 0x11,
    Sexp = 0x12,
    Sti = 0x13,
    Sta = 0x14,

    Jmp = 0x15,
    End = 0x16,

    Ret = 0x17,
    Drop = 0x18,
    Dup = 0x19,
    Swap = 0x1a,
    Elem = 0x1b,

    LdG = 0x20,
    LdL = 0x21,
    LdA = 0x22,
    LdC = 0x23,

    LdaG = 0x30,
    LdaL = 0x31,
    LdaA = 0x32,
    LdaC = 0x33,

    StG = 0x40,
    StL = 0x41,
    StA = 0x42,
    StC = 0x43,

    Cjmpz = 0x50,
    Cjmpnz = 0x51,

    Begin = 0x52,
    Cbegin = 0x53,

    Closure = 0x54,

    Callc = 0x55,
    Call = 0x56,

    Tag = 0x57,
    Array = 0x58,
    Fail = 0x59,
    Line = 0x5a,

    PattStr = 0x60,
    PattString = 0x61,
    PattArray = 0x62,
    PattSexp = 0x63,
    PattRef = 0x64,
    PattVal = 0x65,
    PattFun = 0x66,

    CallLread = 0x70,
    CallLwrite = 0x71,
    CallLlength = 0x72,
    CallLstring = 0x73,
    CallBarray = 0x74,
}

/// Source of one captured value in a `CLOSURE` varspec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureKind {
    Global = 0x0,
    Local = 0x1,
    Argument = 0x2,
    Capture = 0x3,
}

impl CaptureKind {
    pub fn from_byte(byte: u8) -> Option<CaptureKind> {
        Some(match byte {
            0x0 => CaptureKind::Global,
            0x1 => CaptureKind::Local,
            0x2 => CaptureKind::Argument,
            0x3 => CaptureKind::Capture,
            _ => return None,
        })
    }

    pub fn spelling(self) -> char {
        match self {
            CaptureKind::Global => 'G',
            CaptureKind::Local => 'L',
            CaptureKind::Argument => 'A',
            CaptureKind::Capture => 'C',
        }
    }
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;

        Some(match byte {
            0x01 => BinopAdd,
            0x02 => BinopSub,
            0x03 => BinopMul,
            0x04 => BinopDiv,
            0x05 => BinopMod,
            0x06 => BinopLt,
            0x07 => BinopLe,
            0x08 => BinopGt,
            0x09 => BinopGe,
            0x0a => BinopEq,
            0x0b => BinopNe,
            0x0c => BinopAnd,
            0x0d => BinopOr,
            0x10 => Const,
            0x11 => String,
            0x12 => Sexp,
            0x13 => Sti,
            0x14 => Sta,
            0x15 => Jmp,
            0x16 => End,
            0x17 => Ret,
            0x18 => Drop,
            0x19 => Dup,
            0x1a => Swap,
            0x1b => Elem,
            0x20 => LdG,
            0x21 => LdL,
            0x22 => LdA,
            0x23 => LdC,
            0x30 => LdaG,
            0x31 => LdaL,
            0x32 => LdaA,
            0x33 => LdaC,
            0x40 => StG,
            0x41 => StL,
            0x42 => StA,
            0x43 => StC,
            0x50 => Cjmpz,
            0x51 => Cjmpnz,
            0x52 => Begin,
            0x53 => Cbegin,
            0x54 => Closure,
            0x55 => Callc,
            0x56 => Call,
            0x57 => Tag,
            0x58 => Array,
            0x59 => Fail,
            0x5a => Line,
            0x60 => PattStr,
            0x61 => PattString,
            0x62 => PattArray,
            0x63 => PattSexp,
            0x64 => PattRef,
            0x65 => PattVal,
            0x66 => PattFun,
            0x70 => CallLread,
            0x71 => CallLwrite,
            0x72 => CallLlength,
            0x73 => CallLstring,
            0x74 => CallBarray,
            _ => return None,
        })
    }

    pub fn is_binop(self) -> bool {
        (self as u8) >= Opcode::BinopAdd as u8 && (self as u8) <= Opcode::BinopOr as u8
    }

    /// Infix spelling of a binary operator (`!!` is the Lama "or").
    pub fn binop_spelling(self) -> Option<&'static str> {
        use Opcode::*;

        Some(match self {
            BinopAdd => "+",
            BinopSub => "-",
            BinopMul => "*",
            BinopDiv => "/",
            BinopMod => "%",
            BinopLt => "<",
            BinopLe => "<=",
            BinopGt => ">",
            BinopGe => ">=",
            BinopEq => "==",
            BinopNe => "!=",
            BinopAnd => "&&",
            BinopOr => "!!",
            _ => return None,
        })
    }

    /// Instructions carrying an explicit code-offset operand right after the
    /// opcode byte. `CALLC` jumps too but its target lives in the closure.
    pub fn has_jump_operand(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::Cjmpz | Opcode::Cjmpnz | Opcode::Closure | Opcode::Call
        )
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Ret | Opcode::End | Opcode::Fail)
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::Callc)
    }

    /// Instructions after which two adjacent instructions do not form a
    /// straight-line pair (jumps, calls and terminals).
    pub fn breaks_sequence(self) -> bool {
        self.is_terminal() || self.is_call()
    }
}
