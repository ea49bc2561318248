//! SFZ Parser Module
//!
//! Tokenizes SFZ text into a stream of `(header, opcodes)` blocks for the
//! synth's parser listener. SFZ is free-form: several headers and opcodes
//! may share a line, opcode values may contain spaces (sample paths), and
//! `//` starts a comment.
//!
//! Parsing is deliberately forgiving. Malformed input produces a
//! diagnostic with its line number and is skipped; only I/O failures are
//! fatal.

use crate::opcode::Opcode;

use std::path::Path;

use thiserror::Error;

/// SFZ block headers understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Global,
    Control,
    Master,
    Group,
    Region,
    Curve,
    Effect,
}

impl Header {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "global" => Some(Header::Global),
            "control" => Some(Header::Control),
            "master" => Some(Header::Master),
            "group" => Some(Header::Group),
            "region" => Some(Header::Region),
            "curve" => Some(Header::Curve),
            "effect" => Some(Header::Effect),
            _ => None,
        }
    }
}

/// One header block with its opcodes, in file order.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub header: Header,
    pub opcodes: Vec<Opcode>,
}

/// Fatal parser failures.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read sfz file: {0}")]
    Io(#[from] std::io::Error),
}

/// A non-fatal problem found while parsing, with its 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub message: String,
}

/// Result of tokenizing one SFZ source.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    /// Blocks in file order
    pub blocks: Vec<ParsedBlock>,

    /// Skipped constructs, for reporting
    pub diagnostics: Vec<Diagnostic>,
}

/// Reads and tokenizes an SFZ file.
pub fn parse_sfz_file(path: &Path) -> Result<ParseOutcome, ParseError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_sfz(&content))
}

/// Tokenizes SFZ text.
pub fn parse_sfz(content: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut current: Option<ParsedBlock> = None;

    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            outcome.diagnostics.push(Diagnostic {
                line: line_number,
                message: format!("unsupported directive skipped: {}", first_token(line)),
            });
            continue;
        }

        scan_line(line, line_number, &mut current, &mut outcome);
    }

    if let Some(block) = current.take() {
        outcome.blocks.push(block);
    }

    outcome
}

/// Scans one comment-stripped line for headers and opcodes.
fn scan_line(
    line: &str,
    line_number: usize,
    current: &mut Option<ParsedBlock>,
    outcome: &mut ParseOutcome,
) {
    let mut rest = line;

    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        if let Some(after_open) = rest.strip_prefix('<') {
            let Some(close) = after_open.find('>') else {
                outcome.diagnostics.push(Diagnostic {
                    line: line_number,
                    message: format!("unterminated header skipped: {}", rest),
                });
                return;
            };
            let name = after_open[..close].trim().to_ascii_lowercase();
            match Header::from_name(&name) {
                Some(header) => {
                    if let Some(block) = current.take() {
                        outcome.blocks.push(block);
                    }
                    *current = Some(ParsedBlock {
                        header,
                        opcodes: Vec::new(),
                    });
                }
                None => outcome.diagnostics.push(Diagnostic {
                    line: line_number,
                    message: format!("unknown header skipped: <{}>", name),
                }),
            }
            rest = &after_open[close + 1..];
            continue;
        }

        let Some(equals) = rest.find('=') else {
            outcome.diagnostics.push(Diagnostic {
                line: line_number,
                message: format!("stray text skipped: {}", first_token(rest)),
            });
            return;
        };

        let name = rest[..equals].trim();
        let after_value = &rest[equals + 1..];
        let (value, remainder) = take_value(after_value);

        if name.is_empty() || name.contains(char::is_whitespace) {
            outcome.diagnostics.push(Diagnostic {
                line: line_number,
                message: format!("malformed opcode skipped: {}", first_token(rest)),
            });
            rest = remainder;
            continue;
        }

        match current.as_mut() {
            Some(block) => block.opcodes.push(Opcode::new(name, value)),
            None => outcome.diagnostics.push(Diagnostic {
                line: line_number,
                message: format!("opcode before any header skipped: {}", name),
            }),
        }

        rest = remainder;
    }
}

/// Extracts an opcode value from the text following `=`.
///
/// The value extends to the next header, or to the whitespace preceding
/// the next `name=` token, or to the end of the line. This is what lets
/// sample paths contain spaces.
fn take_value(text: &str) -> (&str, &str) {
    let mut end = text.len();

    if let Some(angle) = text.find('<') {
        end = angle;
    }

    if let Some(next_equals) = text[..end].find('=') {
        // Walk back from the next '=' to the whitespace before its name
        let mut boundary = None;
        for (position, character) in text[..next_equals].char_indices().rev() {
            if character.is_whitespace() {
                boundary = Some(position);
                break;
            }
        }
        if let Some(boundary) = boundary {
            end = boundary;
        }
    }

    (text[..end].trim(), &text[end..])
}

/// Removes a `//` comment from a line.
fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(position) => &line[..position],
        None => line,
    }
}

fn first_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opcode<'a>(block: &'a ParsedBlock, name: &str) -> Option<&'a str> {
        block
            .opcodes
            .iter()
            .find(|op| op.name == name)
            .map(|op| op.value.as_str())
    }

    #[test]
    fn test_single_region() {
        let outcome = parse_sfz("<region> sample=kick.wav key=36");
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(outcome.blocks[0].header, Header::Region);
        assert_eq!(opcode(&outcome.blocks[0], "sample"), Some("kick.wav"));
        assert_eq!(opcode(&outcome.blocks[0], "key"), Some("36"));
    }

    #[test]
    fn test_inline_hierarchy_on_one_line() {
        let outcome =
            parse_sfz("<global>width=40 <group>pan=30 delay=56 <region>sample=a <region>sample=b");
        let headers: Vec<Header> = outcome.blocks.iter().map(|b| b.header).collect();
        assert_eq!(
            headers,
            vec![Header::Global, Header::Group, Header::Region, Header::Region]
        );
        assert_eq!(opcode(&outcome.blocks[1], "pan"), Some("30"));
        assert_eq!(opcode(&outcome.blocks[1], "delay"), Some("56"));
    }

    #[test]
    fn test_values_with_spaces() {
        let outcome = parse_sfz("<region> sample=Grand Piano C4.wav lokey=60 hikey=62");
        assert_eq!(
            opcode(&outcome.blocks[0], "sample"),
            Some("Grand Piano C4.wav")
        );
        assert_eq!(opcode(&outcome.blocks[0], "lokey"), Some("60"));
    }

    #[test]
    fn test_value_ends_at_header() {
        let outcome = parse_sfz("<region>sample=a.wav<region>sample=b.wav");
        assert_eq!(outcome.blocks.len(), 2);
        assert_eq!(opcode(&outcome.blocks[0], "sample"), Some("a.wav"));
        assert_eq!(opcode(&outcome.blocks[1], "sample"), Some("b.wav"));
    }

    #[test]
    fn test_comments_are_stripped() {
        let outcome = parse_sfz(
            "// full line comment\n<region> sample=kick.wav // trailing comment\nkey=36",
        );
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(opcode(&outcome.blocks[0], "sample"), Some("kick.wav"));
        assert_eq!(opcode(&outcome.blocks[0], "key"), Some("36"));
    }

    #[test]
    fn test_unknown_header_is_reported() {
        let outcome = parse_sfz("<bogus> x=1 <region> sample=a.wav");
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(outcome.blocks[0].header, Header::Region);
        assert!(!outcome.diagnostics.is_empty());
        assert_eq!(outcome.diagnostics[0].line, 1);
    }

    #[test]
    fn test_define_is_skipped_with_diagnostic() {
        let outcome = parse_sfz("#define $KEY 36\n<region> sample=kick.wav");
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert!(outcome.diagnostics[0].message.contains("#define"));
    }

    #[test]
    fn test_opcode_before_header_is_skipped() {
        let outcome = parse_sfz("volume=3\n<region> sample=a.wav");
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(outcome.blocks[0].opcodes.len(), 1);
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn test_blocks_accumulate_across_lines() {
        let outcome = parse_sfz("<group>\npan=10\nvolume=-3\n<region>\nsample=a.wav\n");
        assert_eq!(outcome.blocks.len(), 2);
        assert_eq!(outcome.blocks[0].opcodes.len(), 2);
        assert_eq!(outcome.blocks[1].opcodes.len(), 1);
    }
}
