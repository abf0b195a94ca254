//! Default runtime: a plain arena of heap blocks plus line-based I/O.
//!
//! Blocks are never moved or reclaimed, so handles stay valid for the whole
//! run. A collecting allocator can be substituted through the [`Runtime`]
//! trait without touching the interpreter.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, anyhow, bail, ensure};

use super::runtime::Runtime;
use super::value::{HeapRef, Tag, Value};

/// Characters admissible in an S-expression tag, six bits each. The tag
/// fingerprint packs the trailing characters of the name into an i32, so
/// short tags survive a round trip through [`Heap::tag_hash`].
const TAG_CHARS: &[u8; 64] = b"_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789'";

#[derive(Debug, Clone)]
enum Block {
    String(Vec<u8>),
    Array(Vec<Value>),
    Sexp { tag: i32, fields: Vec<Value> },
    Closure { entry: i32, captures: Vec<Value> },
}

pub struct Heap {
    blocks: Vec<Block>,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_io(
            Box::new(io::BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    pub fn with_io(input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        Self {
            blocks: Vec::new(),
            input,
            output,
        }
    }

    fn push_block(&mut self, block: Block) -> Value {
        let handle = HeapRef::new(self.blocks.len() as u32);
        self.blocks.push(block);

        Value::Heap(handle)
    }

    fn block(&self, handle: HeapRef) -> Result<&Block> {
        self.blocks
            .get(handle.index() as usize)
            .ok_or_else(|| anyhow!("dangling heap reference {}", handle.index()))
    }

    fn block_mut(&mut self, handle: HeapRef) -> Result<&mut Block> {
        self.blocks
            .get_mut(handle.index() as usize)
            .ok_or_else(|| anyhow!("dangling heap reference {}", handle.index()))
    }

    fn render(&self, value: Value) -> String {
        match value {
            Value::Int(n) => n.to_string(),
            Value::Heap(handle) => match self.block(handle) {
                Ok(Block::String(bytes)) => format!("{:?}", String::from_utf8_lossy(bytes)),
                Ok(Block::Array(elements)) => {
                    let rendered: Vec<String> =
                        elements.iter().map(|&e| self.render(e)).collect();

                    format!("[{}]", rendered.join(", "))
                }
                Ok(Block::Sexp { tag, fields }) => {
                    let name = unhash_tag(*tag);
                    if fields.is_empty() {
                        name
                    } else {
                        let rendered: Vec<String> =
                            fields.iter().map(|&f| self.render(f)).collect();

                        format!("{} ({})", name, rendered.join(", "))
                    }
                }
                Ok(Block::Closure { entry, .. }) => format!("<closure {:#x}>", entry),
                Err(_) => "<dangling>".to_string(),
            },
            Value::StackRef(_) | Value::CellRef(..) => "<reference>".to_string(),
        }
    }
}

impl Runtime for Heap {
    fn alloc_string(&mut self, bytes: &[u8]) -> Result<Value> {
        Ok(self.push_block(Block::String(bytes.to_vec())))
    }

    fn alloc_array(&mut self, elements: &[Value]) -> Result<Value> {
        Ok(self.push_block(Block::Array(elements.to_vec())))
    }

    fn alloc_sexp(&mut self, staged: &[Value]) -> Result<Value> {
        let (&tag_slot, fields) = staged.split_last().context("sexp allocation without a tag")?;
        let tag = tag_slot
            .as_int()
            .context("sexp tag slot must hold the tag fingerprint")?;

        Ok(self.push_block(Block::Sexp {
            tag,
            fields: fields.to_vec(),
        }))
    }

    fn alloc_closure(&mut self, staged: &[Value]) -> Result<Value> {
        let (&entry_slot, captures) = staged
            .split_first()
            .context("closure allocation without an entry offset")?;
        let entry = entry_slot
            .as_int()
            .context("closure entry slot must hold a code offset")?;

        Ok(self.push_block(Block::Closure {
            entry,
            captures: captures.to_vec(),
        }))
    }

    fn kind_of(&self, value: Value) -> Tag {
        match value {
            Value::Int(_) => Tag::Int,
            Value::StackRef(_) | Value::CellRef(..) => Tag::Reference,
            Value::Heap(handle) => match self.block(handle) {
                Ok(Block::String(_)) => Tag::String,
                Ok(Block::Array(_)) => Tag::Array,
                Ok(Block::Sexp { .. }) => Tag::Sexp,
                Ok(Block::Closure { .. }) => Tag::Closure,
                Err(_) => Tag::Reference,
            },
        }
    }

    fn length(&self, value: Value) -> Result<i32> {
        let handle = value.as_heap().context("length expects an aggregate")?;

        Ok(match self.block(handle)? {
            Block::String(bytes) => bytes.len() as i32,
            Block::Array(elements) => elements.len() as i32,
            Block::Sexp { fields, .. } => fields.len() as i32,
            Block::Closure { captures, .. } => captures.len() as i32 + 1,
        })
    }

    fn elem(&self, value: Value, index: i32) -> Result<Value> {
        let handle = value.as_heap().context("indexing expects an aggregate")?;
        ensure!(index >= 0, "index {} must not be negative", index);
        let index = index as usize;

        Ok(match self.block(handle)? {
            Block::String(bytes) => match bytes.get(index) {
                Some(&byte) => Value::Int(byte as i32),
                None => bail!("string index {} out of range", index),
            },
            Block::Array(elements) => match elements.get(index) {
                Some(&element) => element,
                None => bail!("array index {} out of range", index),
            },
            Block::Sexp { fields, .. } => match fields.get(index) {
                Some(&field) => field,
                None => bail!("sexp index {} out of range", index),
            },
            Block::Closure { .. } => bail!("cannot index a closure"),
        })
    }

    fn store_indexed(&mut self, base: Value, index: i32, new_value: Value) -> Result<()> {
        let handle = base.as_heap().context("indexed store expects an aggregate")?;
        ensure!(index >= 0, "index {} must not be negative", index);
        let index = index as usize;

        match self.block_mut(handle)? {
            Block::String(bytes) => {
                let byte = new_value
                    .as_int()
                    .context("only integers can be stored into a string")?;
                match bytes.get_mut(index) {
                    Some(slot) => *slot = byte as u8,
                    None => bail!("string index {} out of range", index),
                }
            }
            Block::Array(elements) => match elements.get_mut(index) {
                Some(slot) => *slot = new_value,
                None => bail!("array index {} out of range", index),
            },
            Block::Sexp { fields, .. } => match fields.get_mut(index) {
                Some(slot) => *slot = new_value,
                None => bail!("sexp index {} out of range", index),
            },
            Block::Closure { .. } => bail!("cannot store into a closure"),
        }

        Ok(())
    }

    fn string_of(&mut self, value: Value) -> Result<Value> {
        if let Value::Heap(handle) = value {
            if let Block::String(bytes) = self.block(handle)? {
                let copied = bytes.clone();

                return Ok(self.push_block(Block::String(copied)));
            }
        }

        let rendered = self.render(value);

        Ok(self.push_block(Block::String(rendered.into_bytes())))
    }

    fn tag_hash(&self, tag: &str) -> i32 {
        let mut hash: u32 = 0;
        for byte in tag.bytes() {
            let index = TAG_CHARS
                .iter()
                .position(|&c| c == byte)
                .unwrap_or(0) as u32;
            hash = (hash << 6) | index;
        }

        hash as i32
    }

    fn tag_match(&self, value: Value, hash: i32, arity: i32) -> bool {
        let Some(handle) = value.as_heap() else {
            return false;
        };

        matches!(
            self.block(handle),
            Ok(Block::Sexp { tag, fields }) if *tag == hash && fields.len() as i32 == arity
        )
    }

    fn array_shape_match(&self, value: Value, len: i32) -> bool {
        let Some(handle) = value.as_heap() else {
            return false;
        };

        matches!(
            self.block(handle),
            Ok(Block::Array(elements)) if elements.len() as i32 == len
        )
    }

    fn string_match(&self, x: Value, y: Value) -> bool {
        let (Some(xh), Some(yh)) = (x.as_heap(), y.as_heap()) else {
            return false;
        };

        matches!(
            (self.block(xh), self.block(yh)),
            (Ok(Block::String(xb)), Ok(Block::String(yb))) if xb == yb
        )
    }

    fn closure_entry(&self, value: Value) -> Result<i32> {
        let handle = value.as_heap().context("expected a closure")?;

        match self.block(handle)? {
            Block::Closure { entry, .. } => Ok(*entry),
            _ => bail!("expected a closure"),
        }
    }

    fn capture_count(&self, closure: Value) -> Result<u32> {
        let handle = closure.as_heap().context("expected a closure")?;

        match self.block(handle)? {
            Block::Closure { captures, .. } => Ok(captures.len() as u32),
            _ => bail!("expected a closure"),
        }
    }

    fn capture(&self, closure: Value, index: u32) -> Result<Value> {
        let handle = closure.as_heap().context("expected a closure")?;

        match self.block(handle)? {
            Block::Closure { captures, .. } => match captures.get(index as usize) {
                Some(&value) => Ok(value),
                None => bail!("captured value index {} out of range", index),
            },
            _ => bail!("expected a closure"),
        }
    }

    fn set_capture(&mut self, closure: Value, index: u32, new_value: Value) -> Result<()> {
        let handle = closure.as_heap().context("expected a closure")?;

        match self.block_mut(handle)? {
            Block::Closure { captures, .. } => match captures.get_mut(index as usize) {
                Some(slot) => {
                    *slot = new_value;
                    Ok(())
                }
                None => bail!("captured value index {} out of range", index),
            },
            _ => bail!("expected a closure"),
        }
    }

    fn read(&mut self) -> Result<i32> {
        let mut line = String::new();
        let n = self.input.read_line(&mut line).context("read failed")?;
        ensure!(n > 0, "unexpected end of input");

        line.trim()
            .parse::<i32>()
            .with_context(|| format!("read: {:?} is not an integer", line.trim()))
    }

    fn write(&mut self, value: i32) -> Result<()> {
        writeln!(self.output, "{}", value).context("write failed")?;
        self.output.flush().context("flush failed")?;

        Ok(())
    }

    fn match_failure(&mut self, value: Value, location: &str, line: i32, col: i32) -> anyhow::Error {
        anyhow!(
            "match failure at {}:{}:{}: value {}",
            location,
            line,
            col,
            self.render(value)
        )
    }
}

/// Reverse of [`Heap::tag_hash`] for tags short enough to fit the packing.
fn unhash_tag(hash: i32) -> String {
    let mut hash = hash as u32;
    let mut chars = Vec::new();
    while hash != 0 {
        chars.push(TAG_CHARS[(hash & 0x3f) as usize]);
        hash >>= 6;
    }
    chars.reverse();

    String::from_utf8(chars).expect("tag characters are ASCII")
}
