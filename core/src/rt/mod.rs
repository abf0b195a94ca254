//! Runtime seam: the tagged value model, the collaborator trait the
//! interpreter drives, and the default arena-backed implementation.

mod heap;
mod runtime;
mod value;

pub use heap::Heap;
pub use runtime::Runtime;
pub use value::{HeapRef, Tag, Value};
