//! The stack machine: operand stack, activation records, the static
//! verifier and the interpreter proper.

mod frame;
mod interp;
mod stack;
mod verifier;

pub use frame::{CallStack, Frame};
pub use interp::{Interpreter, VerificationMode, interpret_file};
pub use stack::{CALLSTACK_CAPACITY, OP_STACK_CAPACITY, OpStack};
pub use verifier::{MAIN_FUNCTION_ARGUMENTS, Verification, Verifier, VerifyError, verify};
