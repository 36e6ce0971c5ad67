//! Splits long documents into chunks at item boundaries.
//!
//! A block is a main item line plus everything up to the next main item
//! (its sub-items, choices and continuation lines). Chunks are built from
//! whole blocks only, so a main item never lands in a different chunk than
//! its sub-items. A block larger than the target becomes its own chunk.

use super::patterns::{classify_line, LineMatch};

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub lines: Vec<(u32, String)>,
}

impl Block {
    fn char_len(&self) -> usize {
        self.lines.iter().map(|(_, l)| l.len() + 1).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub lines: Vec<(u32, String)>,
}

impl Chunk {
    pub fn first_line(&self) -> u32 {
        self.lines.first().map(|(n, _)| *n).unwrap_or(0)
    }

    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|(_, l)| l.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn line_refs(&self) -> Vec<(u32, &str)> {
        self.lines.iter().map(|(n, l)| (*n, l.as_str())).collect()
    }

    pub fn char_len(&self) -> usize {
        self.lines.iter().map(|(_, l)| l.len() + 1).sum()
    }
}

pub struct ItemChunker {
    max_chunk_chars: usize,
    target_chunk_chars: usize,
    overlap_blocks: usize,
}

impl ItemChunker {
    pub fn new(max_chunk_chars: usize, target_chunk_chars: usize, overlap_blocks: usize) -> Self {
        Self {
            max_chunk_chars,
            target_chunk_chars: target_chunk_chars.min(max_chunk_chars).max(1),
            overlap_blocks,
        }
    }

    pub fn chunk(&self, lines: &[(u32, &str)]) -> Vec<Chunk> {
        let total: usize = lines.iter().map(|(_, l)| l.len() + 1).sum();
        if total <= self.max_chunk_chars {
            return vec![Chunk {
                index: 0,
                lines: lines.iter().map(|(n, l)| (*n, l.to_string())).collect(),
            }];
        }

        let blocks = split_blocks(lines);
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<&Block> = Vec::new();
        let mut current_len = 0usize;
        let mut fresh_in_current = 0usize;

        for block in &blocks {
            let len = block.char_len();
            if fresh_in_current > 0 && current_len + len > self.target_chunk_chars {
                let carried = self.overlap_blocks.min(current.len());
                chunks.push(to_chunk(chunks.len(), &current));
                current = current.split_off(current.len() - carried);
                current_len = current.iter().map(|b| b.char_len()).sum();
                fresh_in_current = 0;
            }
            current.push(block);
            current_len += len;
            fresh_in_current += 1;
        }
        if fresh_in_current > 0 {
            chunks.push(to_chunk(chunks.len(), &current));
        }
        chunks
    }
}

fn to_chunk(index: usize, blocks: &[&Block]) -> Chunk {
    Chunk {
        index,
        lines: blocks.iter().flat_map(|b| b.lines.iter().cloned()).collect(),
    }
}

/// Group lines into blocks starting at each main item line.
pub fn split_blocks(lines: &[(u32, &str)]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = Block { lines: Vec::new() };
    for (number, line) in lines {
        let starts_block = matches!(classify_line(line), LineMatch::Main { .. });
        if starts_block && !current.lines.is_empty() {
            blocks.push(std::mem::replace(&mut current, Block { lines: Vec::new() }));
        }
        current.lines.push((*number, line.to_string()));
    }
    if !current.lines.is_empty() {
        blocks.push(current);
    }
    blocks
}
