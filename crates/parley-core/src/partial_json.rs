//! Partial JSON recovery
//!
//! Derives the best currently-available value from a prefix of a JSON document.
//! Tool arguments arrive as raw text fragments; this keeps them renderable
//! long before the closing braces show up.
//!
//! Strategies, first success wins:
//! 1. Direct parse of the whole text
//! 2. Structural completion: close an open string, then every open container
//! 3. Longest balanced prefix: drop trailing noise after a complete value
//! 4. Last complete field: truncate at the last top-level comma and close
//!
//! Once the input is complete, strategy 1 always wins, so the result converges
//! to exactly what `serde_json` produces for the full document.

use serde_json::Value;
use tracing::trace;

/// Parse a possibly-incomplete JSON document into the best value derivable so far.
///
/// Returns `None` for empty or whitespace-only input, or when no value can be
/// salvaged. Never panics.
pub fn parse_partial(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }

    if let Some(value) = parse_exact(text) {
        return Some(value);
    }

    let scan = Scan::run(text);

    if let Some(value) = parse_completed(text, &scan) {
        trace!("partial json: recovered by structural completion");
        return Some(value);
    }

    if let Some(value) = parse_balanced_prefix(text, &scan) {
        trace!("partial json: recovered balanced prefix");
        return Some(value);
    }

    let value = parse_last_complete_field(text, &scan);
    if value.is_some() {
        trace!("partial json: recovered up to last complete field");
    }
    value
}

/// Strategy 1: the exact path
fn parse_exact(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// Strategy 2: close whatever is still open and try again
fn parse_completed(text: &str, scan: &Scan) -> Option<Value> {
    parse_exact(&scan.close(text))
}

/// Strategy 3: cut at the end of the last balanced top-level value
fn parse_balanced_prefix(text: &str, scan: &Scan) -> Option<Value> {
    let balance = scan.balance_point?;
    let tail = text.get(balance..)?;
    let whitespace_end = balance
        + tail
            .bytes()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
    let boundary = scan
        .garbage_offset
        .map_or(whitespace_end, |garbage| garbage.min(whitespace_end));

    let prefix = text.get(..boundary)?.trim_end();
    if prefix.is_empty() {
        return None;
    }

    parse_exact(prefix).or_else(|| parse_completed(prefix, &Scan::run(prefix)))
}

/// Strategy 4: keep every field before the last top-level comma
fn parse_last_complete_field(text: &str, scan: &Scan) -> Option<Value> {
    let comma = scan.last_top_level_comma?;
    let head = text.get(..comma)?;
    parse_completed(head, &Scan::run(head))
}

/// Escape sequence state while inside a string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    /// Just saw a backslash
    Pending,
    /// Inside `\uXXXX`: hex digits still expected and the code unit so far
    Unicode { remaining: u8, code: u16 },
}

/// Result of one structural pass over the input
///
/// All offsets are byte offsets of ASCII bytes, so they always fall on
/// `char` boundaries.
#[derive(Debug, Default)]
struct Scan {
    /// Input ended inside a string literal
    in_string: bool,
    /// Start of an escape sequence cut off by the end of input
    dangling_escape: Option<usize>,
    /// Expected closing tokens, innermost last
    closers: Vec<u8>,
    /// Offset just after the container stack last returned to empty
    balance_point: Option<usize>,
    /// First structurally invalid byte; scanning stops there
    garbage_offset: Option<usize>,
    /// Last comma seen at container depth 1, outside strings
    last_top_level_comma: Option<usize>,
}

impl Scan {
    fn run(text: &str) -> Self {
        let mut scan = Scan::default();
        let mut escape = Escape::None;
        let mut escape_start = 0;
        // Start of a `\uD800`-`\uDBFF` escape still waiting for its low half
        let mut high_surrogate: Option<usize> = None;

        for (offset, byte) in text.bytes().enumerate() {
            if scan.in_string {
                match escape {
                    Escape::Pending => {
                        escape = if byte == b'u' {
                            Escape::Unicode {
                                remaining: 4,
                                code: 0,
                            }
                        } else {
                            high_surrogate = None;
                            Escape::None
                        };
                    }
                    Escape::Unicode { remaining, code } => {
                        escape = match char::from(byte).to_digit(16) {
                            Some(digit) if remaining > 1 => Escape::Unicode {
                                remaining: remaining - 1,
                                code: code << 4 | digit as u16,
                            },
                            Some(digit) => {
                                let code = code << 4 | digit as u16;
                                high_surrogate =
                                    (0xD800..=0xDBFF).contains(&code).then_some(escape_start);
                                Escape::None
                            }
                            None => {
                                high_surrogate = None;
                                Escape::None
                            }
                        };
                    }
                    Escape::None => match byte {
                        b'\\' => {
                            escape = Escape::Pending;
                            escape_start = offset;
                        }
                        b'"' => {
                            scan.in_string = false;
                            high_surrogate = None;
                        }
                        _ => high_surrogate = None,
                    },
                }
                continue;
            }

            // Anything but whitespace after a complete top-level value is noise
            if scan.closers.is_empty()
                && scan.balance_point.is_some()
                && !byte.is_ascii_whitespace()
            {
                scan.garbage_offset = Some(offset);
                break;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' => scan.closers.push(b'}'),
                b'[' => scan.closers.push(b']'),
                b'}' | b']' => {
                    if scan.closers.last() != Some(&byte) {
                        scan.garbage_offset = Some(offset);
                        break;
                    }
                    scan.closers.pop();
                    if scan.closers.is_empty() {
                        scan.balance_point = Some(offset + 1);
                    }
                }
                b',' if scan.closers.len() == 1 => {
                    scan.last_top_level_comma = Some(offset);
                }
                _ => {}
            }
        }

        if scan.in_string {
            // A high surrogate is unusable without its pair, so it goes too
            scan.dangling_escape = match (high_surrogate, escape) {
                (Some(start), _) => Some(start),
                (None, Escape::None) => None,
                (None, _) => Some(escape_start),
            };
        }

        scan
    }

    /// Append the tokens needed to close every open string and container
    fn close(&self, text: &str) -> String {
        let body = match self.dangling_escape {
            Some(start) if self.in_string => text.get(..start).unwrap_or(text),
            _ => text,
        };

        let mut completed = String::with_capacity(body.len() + self.closers.len() + 1);
        completed.push_str(body);
        if self.in_string {
            completed.push('"');
        }
        completed.extend(self.closers.iter().rev().map(|&closer| char::from(closer)));
        completed
    }
}
