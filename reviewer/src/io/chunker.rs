//! Splitting large files into reviewable chunks.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::types::{Chunk, ChunkKind};

/// Chunking capability used by `READ_FILE`.
pub trait Chunker {
    /// Whether `path` is large enough to be read in chunks.
    fn should_chunk(&self, path: &Path) -> Result<bool>;

    /// Ordered, non-overlapping chunks covering the whole file.
    fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>>;
}

/// style(9) function header: the name starts in column 0 and is followed by `(`.
static FUNCTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\(").expect("function header regex"));

const C_SUFFIXES: [&str; 6] = ["c", "h", "cc", "cpp", "y", "l"];

/// Splits C sources at top-level closing braces and everything else into
/// fixed line windows.
#[derive(Debug, Clone)]
pub struct FunctionChunker {
    pub threshold_lines: usize,
    pub chunk_lines: usize,
}

impl FunctionChunker {
    pub fn new(threshold_lines: usize, chunk_lines: usize) -> Self {
        Self {
            threshold_lines,
            chunk_lines: chunk_lines.max(1),
        }
    }

    /// Chunk already-loaded text. `structured` selects brace splitting.
    pub fn chunk_text(&self, text: &str, structured: bool) -> Vec<Chunk> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }
        if !structured {
            return windows(&lines, 0, lines.len(), self.chunk_lines);
        }

        let mut chunks = Vec::new();
        let mut pack_start = 0usize;
        let mut pack_end = 0usize;
        for (seg_start, seg_end) in segments(&lines) {
            let seg_len = seg_end - seg_start;
            if seg_len > self.chunk_lines {
                if pack_end > pack_start {
                    chunks.push(structured_chunk(&lines, pack_start, pack_end));
                }
                chunks.extend(windows(&lines, seg_start, seg_end, self.chunk_lines));
                pack_start = seg_end;
                pack_end = seg_end;
                continue;
            }
            if pack_end - pack_start + seg_len > self.chunk_lines && pack_end > pack_start {
                chunks.push(structured_chunk(&lines, pack_start, pack_end));
                pack_start = seg_start;
            }
            pack_end = seg_end;
        }
        if pack_end > pack_start {
            chunks.push(structured_chunk(&lines, pack_start, pack_end));
        }
        chunks
    }
}

impl Chunker for FunctionChunker {
    fn should_chunk(&self, path: &Path) -> Result<bool> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let lines = bytes.iter().filter(|b| **b == b'\n').count();
        Ok(lines > self.threshold_lines)
    }

    fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Ok(self.chunk_text(&text, is_c_source(path)))
    }
}

fn is_c_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| C_SUFFIXES.contains(&ext))
}

/// Half-open line ranges, each ending just after a `}` in column 0.
fn segments(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with('}') {
            out.push((start, i + 1));
            start = i + 1;
        }
    }
    if start < lines.len() {
        out.push((start, lines.len()));
    }
    out
}

fn structured_chunk(lines: &[&str], start: usize, end: usize) -> Chunk {
    let name = lines[start..end]
        .iter()
        .find_map(|l| FUNCTION_HEADER_RE.captures(l))
        .map(|c| c[1].to_string());
    Chunk {
        start_line: start + 1,
        end_line: end,
        content: join(&lines[start..end]),
        kind: if name.is_some() {
            ChunkKind::Function
        } else {
            ChunkKind::Lines
        },
        name,
    }
}

fn windows(lines: &[&str], start: usize, end: usize, size: usize) -> Vec<Chunk> {
    (start..end)
        .step_by(size)
        .map(|s| {
            let e = (s + size).min(end);
            Chunk {
                start_line: s + 1,
                end_line: e,
                content: join(&lines[s..e]),
                kind: ChunkKind::Lines,
                name: None,
            }
        })
        .collect()
}

fn join(lines: &[&str]) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}
