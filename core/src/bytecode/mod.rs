//! Bytecode file model: the opcode table, the binary container and its
//! reader/builder pair, and the instruction decoder.

pub mod builder;
pub mod decoder;
mod file;
pub mod opcode;
pub mod reader;

pub use builder::ImageBuilder;
pub use file::{
    BytecodeFile, ENTRYPOINT_NAME, PublicSymbol, pack_begin_metadata, unpack_begin_metadata,
};
pub use opcode::{CaptureKind, Opcode};
pub use reader::{ReadError, parse_image, read_bytecode_file};
