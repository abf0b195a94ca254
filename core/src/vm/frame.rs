//! Activation records.
//!
//! A frame is a view into the operand stack, not an owning structure. The
//! frame base is the absolute index of the slot holding the saved return ip;
//! arguments live below it, locals above it, and the closure object (when
//! the callee was entered through `CALLC`) sits just below the arguments:
//!
//! ```text
//! ==================
//! |   local #n     |
//! | .............. |
//! |   local #0     |
//! ==================
//! | return address | <------ frame base
//! ==================
//! |  argument #m   |
//! | .............. |
//! |  argument #0   |
//! ==================
//! |   (closure)    |
//! ==================
//! ```

use anyhow::{Result, bail};

use super::stack::CALLSTACK_CAPACITY;

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub base: usize,
    pub args: u32,
    pub locals: u32,
    /// A closure object was pushed before the arguments (`CALLC` entry).
    pub has_closure: bool,
    /// The function reads captured values (`CBEGIN` prologue).
    pub has_captures: bool,
}

impl Frame {
    pub fn arg_slot(&self, index: u32) -> usize {
        self.base - self.args as usize + index as usize
    }

    pub fn local_slot(&self, index: u32) -> usize {
        self.base + 1 + index as usize
    }

    pub fn closure_slot(&self) -> usize {
        self.base - self.args as usize - 1
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Frame) -> Result<()> {
        if self.frames.len() >= CALLSTACK_CAPACITY {
            bail!("callstack exhausted");
        }
        self.frames.push(frame);

        Ok(())
    }

    pub fn pop(&mut self) -> Result<Frame> {
        match self.frames.pop() {
            Some(frame) => Ok(frame),
            None => bail!("callstack is empty"),
        }
    }

    pub fn peek(&self) -> Result<Frame> {
        match self.frames.last() {
            Some(&frame) => Ok(frame),
            None => bail!("callstack is empty"),
        }
    }
}
