//! Idiom analysis: which instructions and adjacent instruction pairs recur
//! in the reachable code, and how often.
//!
//! Two phases. Reachability walks the code from every public symbol,
//! following explicit jump targets and fall-through edges, and labels
//! offsets that start a basic block (public entries, jump targets, return
//! sites of calls). Enumeration then collects every reachable instruction
//! and every straight-line pair whose second instruction is not labeled,
//! collapses spans with identical raw bytes into frequency counts, and
//! merges the two rankings by descending frequency.

use anyhow::{Context, Result, bail, ensure};

use crate::bytecode::decoder::{fmt_instruction, instruction_length, jump_target};
use crate::bytecode::{BytecodeFile, Opcode};

/// A contiguous byte span covering one or two instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdiomSpan {
    pub offset: u32,
    pub len: u32,
}

/// One idiom with its occurrence count; `span` points at a representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdiomFrequency {
    pub span: IdiomSpan,
    pub count: u32,
}

/// Render a span as `; `-separated disassembly.
pub fn render_span(file: &BytecodeFile, span: IdiomSpan) -> Result<String> {
    let mut parts = Vec::new();
    let mut cursor = span.offset;
    while cursor < span.offset + span.len {
        parts.push(fmt_instruction(file, cursor)?);
        let len = instruction_length(file.code(), cursor as usize)
            .with_context(|| format!("invalid opcode at offset {:#x}", cursor))?;
        cursor += len as u32;
    }

    Ok(parts.join("; "))
}

/// Instructions whose explicit target the reachability walk follows.
/// `CALLC` transfers control too, but its target lives in a closure value.
fn follows_jump(op: Opcode) -> bool {
    matches!(op, Opcode::Jmp | Opcode::Cjmpz | Opcode::Cjmpnz | Opcode::Call)
}

struct IdiomAnalyzer<'a> {
    file: &'a BytecodeFile,
    reachable: Vec<bool>,
    labeled: Vec<bool>,
}

impl<'a> IdiomAnalyzer<'a> {
    fn new(file: &'a BytecodeFile) -> Self {
        Self {
            file,
            reachable: vec![false; file.code_size()],
            labeled: vec![false; file.code_size()],
        }
    }

    /// Mark reachable and labeled offsets starting from the publics.
    fn preprocess(&mut self) -> Result<()> {
        let code = self.file.code();
        let mut pending: Vec<u32> = Vec::new();

        for sym in self.file.publics() {
            let offset = sym.code_offset;
            ensure!(
                (offset as usize) < code.len(),
                "public symbol offset {:#x} out of range",
                offset
            );
            if !self.labeled[offset as usize] {
                self.labeled[offset as usize] = true;
                pending.push(offset);
            }
        }

        while let Some(offset) = pending.pop() {
            self.reachable[offset as usize] = true;
            let op = self.file.opcode_at(offset)?;
            let len = instruction_length(code, offset as usize)
                .with_context(|| format!("invalid opcode at offset {:#x}", offset))?
                as u32;

            if follows_jump(op) {
                let target = jump_target(code, offset as usize).expect("jump has a target operand");
                if target < 0 || target as usize >= code.len() {
                    bail!("wrong jump at offset {:#x}", offset);
                }
                self.labeled[target as usize] = true;
                if !self.reachable[target as usize] {
                    self.reachable[target as usize] = true;
                    pending.push(target as u32);
                }
            }

            if !op.is_terminal() {
                let next = offset + len;
                if (next as usize) < code.len() {
                    if !self.reachable[next as usize] {
                        self.reachable[next as usize] = true;
                        pending.push(next);
                    }
                    if op.is_call() {
                        self.labeled[next as usize] = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Enumerate single-instruction spans and unlabeled adjacent pairs.
    fn find_idioms(&mut self) -> Result<(Vec<IdiomSpan>, Vec<IdiomSpan>)> {
        self.preprocess()?;

        let code = self.file.code();
        let mut singles = Vec::new();
        let mut pairs = Vec::new();

        let mut offset = 0usize;
        while offset < code.len() {
            if !self.reachable[offset] {
                offset += 1;
                continue;
            }

            let op = self.file.opcode_at(offset as u32)?;
            let len = instruction_length(code, offset)
                .with_context(|| format!("invalid opcode at offset {:#x}", offset))?;
            singles.push(IdiomSpan {
                offset: offset as u32,
                len: len as u32,
            });

            let next = offset + len;
            if next < code.len()
                && !op.breaks_sequence()
                && !self.labeled[next]
                && self.reachable[next]
            {
                let next_len = instruction_length(code, next)
                    .with_context(|| format!("invalid opcode at offset {:#x}", next))?;
                pairs.push(IdiomSpan {
                    offset: offset as u32,
                    len: (len + next_len) as u32,
                });
            }

            offset = next;
        }

        Ok((singles, pairs))
    }
}

/// Collapse spans with identical raw bytes into one representative each,
/// ranked by descending frequency.
fn collect_frequencies(file: &BytecodeFile, mut spans: Vec<IdiomSpan>) -> Vec<IdiomFrequency> {
    let code = file.code();
    let bytes_of =
        |span: &IdiomSpan| &code[span.offset as usize..(span.offset + span.len) as usize];

    spans.sort_by(|a, b| bytes_of(a).cmp(bytes_of(b)));

    let mut frequencies: Vec<IdiomFrequency> = Vec::new();
    for span in spans {
        match frequencies.last_mut() {
            Some(last) if bytes_of(&last.span) == bytes_of(&span) => last.count += 1,
            _ => frequencies.push(IdiomFrequency { span, count: 1 }),
        }
    }

    frequencies.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| bytes_of(&a.span).cmp(bytes_of(&b.span)))
    });

    frequencies
}

/// Full analysis: reachability, enumeration, frequency ranking, and a merge
/// of the single and pair rankings that always takes the more frequent head.
pub fn analyze(file: &BytecodeFile) -> Result<Vec<IdiomFrequency>> {
    let (singles, pairs) = IdiomAnalyzer::new(file).find_idioms()?;
    let mut singles = collect_frequencies(file, singles).into_iter().peekable();
    let mut pairs = collect_frequencies(file, pairs).into_iter().peekable();

    let mut merged = Vec::new();
    loop {
        let take_single = match (singles.peek(), pairs.peek()) {
            (Some(single), Some(pair)) => single.count >= pair.count,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_single {
            singles.next()
        } else {
            pairs.next()
        };
        merged.push(next.expect("peeked queue is non-empty"));
    }

    Ok(merged)
}
