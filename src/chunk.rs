//! Lua chunk line classification.
//!
//! Script bodies are streamed to the instrument one physical line at a time.
//! Comments and blank lines are dropped on the way, and comments are cut out
//! of lines that also carry code. The only state carried from one line to
//! the next is the level of an open block comment (`--[[` is level 0,
//! `--[==[` level 2), so a [`ChunkLineReader`] is restarted for every file.
//!
//! Comment markers inside single or double quoted strings, and inside long
//! brackets that open and close on the same line, are not comments. Long
//! strings spanning several lines are not tracked.

/// Single line comment marker.
pub const COMMENT: &str = "--";
/// Level 0 block comment opening marker.
pub const START_COMMENT_BLOCK: &str = "--[[";
/// Level 0 block comment closing marker.
pub const END_COMMENT_BLOCK: &str = "]]";

const TAB_WIDTH: usize = 4;

/// What a source line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineContentType {
    /// Blank or whitespace only.
    None,
    /// Comment only.
    Comment,
    /// Opens a block comment.
    StartCommentBlock,
    /// Closes a block comment.
    EndCommentBlock,
    /// Code, possibly mixed with comments that end on this line.
    Syntax,
    /// Code followed by the opening of a block comment.
    SyntaxStartCommentBlock,
}

impl LineContentType {
    /// True for lines that are transmitted.
    pub fn is_syntax(self) -> bool {
        matches!(self, Self::Syntax | Self::SyntaxStartCommentBlock)
    }
}

/// A classified line together with the text to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLine {
    /// Classification.
    pub content_type: LineContentType,
    /// Live code with comments removed, untrimmed; empty unless syntax.
    pub live: String,
    /// Level of the block comment still open after this line.
    pub open_block: Option<usize>,
}

/// Replaces tabs with spaces up to the next tab stop.
pub fn expand_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut column = 0;
    for c in line.chars() {
        if c == '\t' {
            let pad = TAB_WIDTH - column % TAB_WIDTH;
            out.extend(std::iter::repeat(' ').take(pad));
            column += pad;
        } else {
            out.push(c);
            column += 1;
        }
    }
    out
}

/// Level of the long bracket opening at `bytes[0]`, as in `[[` or `[==[`.
fn long_bracket_level(bytes: &[u8]) -> Option<usize> {
    if bytes.first() != Some(&b'[') {
        return None;
    }
    let level = bytes[1..].iter().take_while(|&&b| b == b'=').count();
    (bytes.get(1 + level) == Some(&b'[')).then_some(level)
}

fn long_bracket_close(level: usize) -> String {
    format!("]{}]", "=".repeat(level))
}

/// Live code of `line` and the block comment level open at its end.
///
/// A comment between two pieces of code is replaced by a single space, the
/// way the Lua lexer treats it.
fn strip_comments(line: &str, mut open_block: Option<usize>) -> (String, Option<usize>) {
    let bytes = line.as_bytes();
    let mut live = String::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(level) = open_block {
            let close = long_bracket_close(level);
            match line[i..].find(&close) {
                Some(end) => {
                    i += end + close.len();
                    start = i;
                    open_block = None;
                    if !live.trim().is_empty() && !live.ends_with(' ') {
                        live.push(' ');
                    }
                    continue;
                }
                None => return (live, open_block),
            }
        }

        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
        } else if b == b'\'' || b == b'"' {
            quote = Some(b);
        } else if bytes[i..].starts_with(COMMENT.as_bytes()) {
            live.push_str(&line[start..i]);
            let opener = i + COMMENT.len();
            match long_bracket_level(&bytes[opener..]) {
                Some(level) => {
                    open_block = Some(level);
                    i = opener + level + 2;
                    start = i;
                    continue;
                }
                None => return (live, None),
            }
        } else if let Some(level) = long_bracket_level(&bytes[i..]) {
            let body = i + level + 2;
            if let Some(end) = line[body..].find(&long_bracket_close(level)) {
                i = body + end + level + 2;
                continue;
            }
        }
        i += 1;
    }
    if open_block.is_none() {
        live.push_str(&line[start..]);
    }
    (live, open_block)
}

/// Classifies `line` given the block comment level carried from the
/// previous line, and extracts its live code.
pub fn classify_line(line: &str, open_block: Option<usize>) -> ClassifiedLine {
    let expanded = expand_tabs(line);
    if expanded.trim().is_empty() {
        return ClassifiedLine {
            content_type: LineContentType::None,
            live: String::new(),
            open_block,
        };
    }

    let (live, still_open) = strip_comments(&expanded, open_block);
    let content_type = match (live.trim().is_empty(), open_block, still_open) {
        (false, _, Some(_)) => LineContentType::SyntaxStartCommentBlock,
        (false, _, None) => LineContentType::Syntax,
        (true, Some(_), None) => LineContentType::EndCommentBlock,
        (true, None, Some(_)) => LineContentType::StartCommentBlock,
        (true, _, _) => LineContentType::Comment,
    };
    ClassifiedLine {
        live: if content_type.is_syntax() { live } else { String::new() },
        content_type,
        open_block: still_open,
    }
}

/// Classifies `line` given the block comment level carried from the previous line.
pub fn classify(line: &str, open_block: Option<usize>) -> LineContentType {
    classify_line(line, open_block).content_type
}

/// Sequential classifier for the lines of one script file.
#[derive(Debug, Clone, Default)]
pub struct ChunkLineReader {
    open_block: Option<usize>,
    retain_outline: bool,
}

impl ChunkLineReader {
    /// `retain_outline` keeps leading indentation of transmitted lines.
    pub fn new(retain_outline: bool) -> Self {
        Self {
            open_block: None,
            retain_outline,
        }
    }

    /// Whether a block comment is open.
    pub fn in_comment_block(&self) -> bool {
        self.open_block.is_some()
    }

    /// Restarts for a new file.
    pub fn reset(&mut self) {
        self.open_block = None;
    }

    /// Classifies the next physical line; the live text is trimmed.
    pub fn next_line(&mut self, line: &str) -> ClassifiedLine {
        let mut classified = classify_line(line, self.open_block);
        self.open_block = classified.open_block;
        classified.live = if self.retain_outline {
            classified.live.trim_end().to_string()
        } else {
            classified.live.trim().to_string()
        };
        classified
    }
}
