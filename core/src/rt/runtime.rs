//! The runtime collaborator interface.
//!
//! The interpreter owns the operand stack and the control flow; everything
//! that touches heap blocks or the outside world goes through this trait.
//! Allocating operations receive their inputs as a slice of the operand
//! stack's live region, so a collecting implementation sees every in-flight
//! value as a root.

use anyhow::Result;

use super::value::{Tag, Value};

pub trait Runtime {
    /// Allocate a string block with the given contents.
    fn alloc_string(&mut self, bytes: &[u8]) -> Result<Value>;

    /// Allocate an array from staged stack slots, bottom-most first.
    fn alloc_array(&mut self, elements: &[Value]) -> Result<Value>;

    /// Allocate an S-expression from staged stack slots laid out as
    /// `[field_1, .., field_n, tag_hash]`.
    fn alloc_sexp(&mut self, staged: &[Value]) -> Result<Value>;

    /// Allocate a closure from staged stack slots laid out as
    /// `[entry_offset, capture_1, .., capture_n]`.
    fn alloc_closure(&mut self, staged: &[Value]) -> Result<Value>;

    fn kind_of(&self, value: Value) -> Tag;

    /// Element count of an aggregate (string bytes, array elements, sexp
    /// fields; a closure counts its entry word plus captures).
    fn length(&self, value: Value) -> Result<i32>;

    /// Indexed read from a string (byte as integer), array or sexp.
    fn elem(&self, value: Value, index: i32) -> Result<Value>;

    /// Indexed write into a string, array or sexp.
    fn store_indexed(&mut self, base: Value, index: i32, new_value: Value) -> Result<()>;

    /// Allocate the textual rendering of any value as a string block.
    fn string_of(&mut self, value: Value) -> Result<Value>;

    /// Fingerprint of an S-expression tag name.
    fn tag_hash(&self, tag: &str) -> i32;

    /// Is `value` an S-expression with the given tag fingerprint and arity?
    fn tag_match(&self, value: Value, hash: i32, arity: i32) -> bool;

    /// Is `value` an array of exactly `len` elements?
    fn array_shape_match(&self, value: Value, len: i32) -> bool;

    /// Are both values strings with equal contents?
    fn string_match(&self, x: Value, y: Value) -> bool;

    /// Code offset a closure transfers control to.
    fn closure_entry(&self, value: Value) -> Result<i32>;

    fn capture_count(&self, closure: Value) -> Result<u32>;
    fn capture(&self, closure: Value, index: u32) -> Result<Value>;
    fn set_capture(&mut self, closure: Value, index: u32, new_value: Value) -> Result<()>;

    /// The `read` builtin: one integer from the input stream.
    fn read(&mut self) -> Result<i32>;

    /// The `write` builtin: one integer line to the output stream.
    fn write(&mut self, value: i32) -> Result<()>;

    /// Report a pattern-match failure. Never returns normally; the produced
    /// error carries the offending value's rendering and the location.
    fn match_failure(&mut self, value: Value, location: &str, line: i32, col: i32) -> anyhow::Error;
}
