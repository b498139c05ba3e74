//! Language-aware chunking. Splits source text into ordered, overlapping
//! chunks with exact line spans and byte offsets. Token counts are a cheap
//! bytes/4 approximation; the chunker never talks to the embedding provider.

use crate::config::Config;

/// One chunk of a file, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    /// 0-based position within the file.
    pub index: usize,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub content: String,
    pub token_estimate: usize,
}

/// Chunking parameters, fixed per deployment.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl ChunkPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_tokens: config.chunk_target_tokens,
            max_tokens: config.chunk_max_tokens,
            overlap_tokens: config.chunk_overlap_tokens,
        }
    }
}

/// Cheap token estimate: 4 bytes per token, rounded up.
pub fn estimate_tokens(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

/// True when the first 8 KiB contain a NUL byte.
pub fn is_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(8192)];
    head.contains(&0)
}

/// Best-effort language detection by extension. Missing language is fine.
pub fn detect_language(rel_path: &str) -> Option<&'static str> {
    let ext = rel_path.rsplit_once('.').map(|(_, e)| e)?;
    let lang = match ext {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "go" => "go",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "jsx" => "typescript",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "html" | "htm" => "html",
        "css" | "scss" | "less" => "css",
        "lua" => "lua",
        "zig" => "zig",
        _ => return None,
    };
    Some(lang)
}

/// A physical line with its byte extent (newline included in `end`).
struct Line<'a> {
    number: usize,
    start: usize,
    end: usize,
    text: &'a str,
}

fn split_lines(content: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    for (i, text) in content.split_inclusive('\n').enumerate() {
        let end = offset + text.len();
        lines.push(Line { number: i + 1, start: offset, end, text: text.trim_end_matches('\n') });
        offset = end;
    }
    lines
}

/// Split `content` into ordered chunks.
///
/// Split preference: blank lines once the target budget is reached, any
/// line boundary at the hard maximum, and a raw byte split only for a
/// single line that alone exceeds the maximum. Each chunk after the first
/// starts with the tail of its predecessor (up to `overlap_tokens`) so
/// identifiers spanning a boundary remain recoverable. Empty input yields
/// no chunks.
pub fn chunk_text(content: &str, policy: &ChunkPolicy) -> Vec<ChunkSpan> {
    if content.is_empty() {
        return Vec::new();
    }
    let lines = split_lines(content);
    let mut chunks: Vec<ChunkSpan> = Vec::new();

    // Indices into `lines` of the chunk being accumulated.
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;
    // First line of the previous chunk, to bound overlap back-off.
    let mut prev_start_idx = 0usize;

    let mut i = 0usize;
    while i < lines.len() {
        let line = &lines[i];
        let line_tokens = estimate_tokens(line.end - line.start);

        // A single line larger than the hard budget is split by bytes.
        if line_tokens > policy.max_tokens && current.is_empty() {
            flush(&mut chunks, content, &lines, &current);
            for span in split_oversized_line(content, line, policy, chunks.len()) {
                chunks.push(span);
            }
            prev_start_idx = i;
            i += 1;
            continue;
        }

        if current_tokens + line_tokens > policy.max_tokens && !current.is_empty() {
            // Hard budget: close at this line boundary.
            flush(&mut chunks, content, &lines, &current);
            let overlap_from = overlap_start(&lines, &current, policy.overlap_tokens, prev_start_idx);
            prev_start_idx = current[0];
            current = (overlap_from..=*current.last().unwrap()).collect();
            current_tokens = current
                .iter()
                .map(|&idx| estimate_tokens(lines[idx].end - lines[idx].start))
                .sum();
            continue;
        }

        current.push(i);
        current_tokens += line_tokens;
        i += 1;

        // Preferred split: a blank line once the target is reached.
        if current_tokens >= policy.target_tokens && line.text.trim().is_empty() {
            flush(&mut chunks, content, &lines, &current);
            let overlap_from = overlap_start(&lines, &current, policy.overlap_tokens, prev_start_idx);
            prev_start_idx = current[0];
            current = (overlap_from..i).collect();
            current_tokens = current
                .iter()
                .map(|&idx| estimate_tokens(lines[idx].end - lines[idx].start))
                .sum();
        }
    }

    flush(&mut chunks, content, &lines, &current);
    chunks
}

/// Close the accumulated chunk, if any, appending it with the next index.
fn flush(chunks: &mut Vec<ChunkSpan>, content: &str, lines: &[Line<'_>], current: &[usize]) {
    // Overlap-only leftovers (every line already covered) are dropped.
    if current.is_empty() {
        return;
    }
    if let Some(last_chunk) = chunks.last() {
        let last_line = lines[*current.last().unwrap()].number;
        if last_line <= last_chunk.end_line {
            return;
        }
    }
    let first = &lines[current[0]];
    let last = &lines[*current.last().unwrap()];
    let byte_start = first.start;
    let byte_end = last.end;
    let text = &content[byte_start..byte_end];
    chunks.push(ChunkSpan {
        index: chunks.len(),
        start_line: first.number,
        end_line: last.number,
        byte_start,
        byte_end,
        content: text.to_string(),
        token_estimate: estimate_tokens(text.len()),
    });
}

/// First line index of the next chunk: walk back from the tail of the chunk
/// just closed until the overlap budget is spent, never crossing into the
/// previous chunk's start (guarantees forward progress).
fn overlap_start(
    lines: &[Line<'_>],
    closed: &[usize],
    overlap_tokens: usize,
    prev_start_idx: usize,
) -> usize {
    let last = *closed.last().unwrap();
    if overlap_tokens == 0 {
        return last + 1;
    }
    let floor = prev_start_idx.max(closed[0]) + 1;
    let mut start = last + 1;
    let mut spent = 0usize;
    for &idx in closed.iter().rev() {
        let tokens = estimate_tokens(lines[idx].end - lines[idx].start);
        if spent + tokens > overlap_tokens || idx < floor {
            break;
        }
        spent += tokens;
        start = idx;
    }
    start
}

/// Byte-split a single line that exceeds the hard budget on its own.
fn split_oversized_line(
    content: &str,
    line: &Line<'_>,
    policy: &ChunkPolicy,
    first_index: usize,
) -> Vec<ChunkSpan> {
    let budget_bytes = policy.max_tokens * 4;
    let mut spans = Vec::new();
    let mut start = line.start;
    while start < line.end {
        let mut end = (start + budget_bytes).min(line.end);
        while end > start && !content.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            break;
        }
        let text = &content[start..end];
        spans.push(ChunkSpan {
            index: first_index + spans.len(),
            start_line: line.number,
            end_line: line.number,
            byte_start: start,
            byte_end: end,
            content: text.to_string(),
            token_estimate: estimate_tokens(text.len()),
        });
        start = end;
    }
    spans
}
