//! Textual manifest serialization and strict parsing.
//!
//! Directives, one per line:
//!
//! ```text
//! stack_size <bytes>
//! shared <id> <name> <initial_u64>
//! bytes 0x<16 hex> ; <comment>
//! label <name> <instruction_index>
//! string "<escaped>"
//! ```

use std::fmt::Write as _;

use super::{Inst, ManifestUnit, SharedVar, StringLit};
use crate::error::{Error, Result};

pub(super) fn serialize(unit: &ManifestUnit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "stack_size {}", unit.stack_size);
    for sv in &unit.shared {
        let _ = writeln!(out, "shared {} {} {}", sv.id, sv.name, sv.init);
    }
    for inst in &unit.instructions {
        let _ = writeln!(out, "bytes 0x{:016X} ; {}", inst.word(), inst.comment);
    }
    let mut labels: Vec<(&str, usize)> = unit
        .labels
        .iter()
        .map(|(name, &idx)| (name.as_str(), idx))
        .collect();
    labels.sort_by_key(|&(_, idx)| idx);
    for (name, idx) in labels {
        let _ = writeln!(out, "label {name} {idx}");
    }
    for s in &unit.strings {
        let _ = writeln!(out, "string \"{}\"", escape(&s.text));
    }
    out
}

pub(super) fn parse(input: &str) -> Result<ManifestUnit> {
    let mut unit = ManifestUnit::default();
    let mut next_string = 0usize;

    for (line_no, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let err = |msg: &str| Error::MalformedManifest(format!("line {}: {msg}", line_no + 1));

        let (directive, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| err("missing operand"))?;
        let rest = rest.trim();

        match directive {
            "stack_size" => {
                unit.stack_size = rest.parse().map_err(|_| err("bad stack_size value"))?;
            }
            "shared" => {
                let mut parts = rest.split_whitespace();
                let id = parts
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| err("bad shared id"))?;
                let name = parts.next().ok_or_else(|| err("missing shared name"))?;
                let init = parts
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| err("bad shared initial value"))?;
                if parts.next().is_some() {
                    return Err(err("trailing tokens after shared directive"));
                }
                unit.shared.push(SharedVar {
                    id,
                    name: name.to_string(),
                    init,
                });
            }
            "bytes" => {
                let (word_tok, comment) = match rest.split_once(';') {
                    Some((w, c)) => (w.trim(), c.trim()),
                    None => (rest, ""),
                };
                let hex = word_tok
                    .strip_prefix("0x")
                    .ok_or_else(|| err("bytes value must be 0x-prefixed"))?;
                if hex.len() != 16 {
                    return Err(err("bytes value must be 16 hex digits"));
                }
                let word = u64::from_str_radix(hex, 16).map_err(|_| err("bad hex in bytes"))?;
                unit.instructions.push(Inst::unpack(word, comment)?);
            }
            "label" => {
                let (name, idx) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| err("label needs a name and an index"))?;
                let idx = idx
                    .trim()
                    .parse()
                    .map_err(|_| err("bad label instruction index"))?;
                unit.labels.insert(name.to_string(), idx);
            }
            "string" => {
                let text = unescape(rest)
                    .map_err(|msg| Error::MalformedString(format!("line {}: {msg}", line_no + 1)))?;
                unit.strings.push(StringLit {
                    label: format!("str_{next_string}"),
                    text,
                });
                next_string += 1;
            }
            other => return Err(err(&format!("unknown directive '{other}'"))),
        }
    }

    Ok(unit)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

/// Strict string literal grammar: must open and close with `"` on the same
/// line, recognizing exactly the escapes `\n \r \t \\ \"`.
fn unescape(token: &str) -> std::result::Result<String, String> {
    let inner = token
        .strip_prefix('"')
        .ok_or_else(|| "string literal must start with '\"'".to_string())?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    loop {
        match chars.next() {
            None => return Err("unterminated string literal".to_string()),
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(c) => return Err(format!("unknown escape '\\{c}'")),
                None => return Err("unterminated escape at end of string".to_string()),
            },
            Some(c) => out.push(c),
        }
    }
    if chars.next().is_some() {
        return Err("trailing characters after closing quote".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{OPERAND_IMM, OPERAND_LABEL, Opcode};

    fn sample_unit() -> ManifestUnit {
        let mut unit = ManifestUnit {
            stack_size: 88,
            ..ManifestUnit::default()
        };
        unit.instructions
            .push(Inst::new(Opcode::Jmp, [OPERAND_LABEL, 0, 0], 0, "jmp fn_main"));
        unit.instructions
            .push(Inst::new(Opcode::Mov, [1, OPERAND_IMM, 0], -3, "mov r1, #-3"));
        unit.instructions.push(Inst::new(Opcode::Halt, [0; 3], 0, "halt"));
        unit.labels.insert("fn_main".to_string(), 1);
        unit.strings.push(StringLit {
            label: "str_0".to_string(),
            text: "hi\n\t\"q\\".to_string(),
        });
        unit.shared.push(SharedVar {
            id: 0,
            name: "counter".to_string(),
            init: 7,
        });
        unit
    }

    #[test]
    fn round_trip_preserves_everything() {
        let unit = sample_unit();
        let text = unit.to_text();
        let back = ManifestUnit::parse(&text).unwrap();
        assert_eq!(back.stack_size, unit.stack_size);
        assert_eq!(back.instructions, unit.instructions);
        assert_eq!(back.labels, unit.labels);
        assert_eq!(back.strings, unit.strings);
        assert_eq!(back.shared, unit.shared);
    }

    #[test]
    fn unterminated_string_is_malformed_string() {
        let err = ManifestUnit::parse("string \"oops").unwrap_err();
        assert!(matches!(err, Error::MalformedString(_)));
    }

    #[test]
    fn unknown_escape_is_malformed_string() {
        let err = ManifestUnit::parse("string \"a\\q\"").unwrap_err();
        assert!(matches!(err, Error::MalformedString(_)));
    }

    #[test]
    fn unknown_directive_is_malformed_manifest() {
        let err = ManifestUnit::parse("frobnicate 3").unwrap_err();
        assert!(matches!(err, Error::MalformedManifest(_)));
    }

    #[test]
    fn short_hex_is_rejected() {
        let err = ManifestUnit::parse("bytes 0x0102 ; nop").unwrap_err();
        assert!(matches!(err, Error::MalformedManifest(_)));
    }

    #[test]
    fn string_labels_are_assigned_in_order() {
        let unit = ManifestUnit::parse("string \"a\"\nstring \"b\"").unwrap();
        assert_eq!(unit.strings[0].label, "str_0");
        assert_eq!(unit.strings[1].label, "str_1");
    }
}
