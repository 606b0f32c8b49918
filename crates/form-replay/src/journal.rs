//! Operation journals.
//!
//! A journal is a text file with one JSON operation per line, in wire format.
//! Blank lines and lines starting with `#` are ignored.

use anyhow::{Context, Result};
use form_sync::{wire, Operation};
use std::fs;
use std::path::Path;

/// Parse journal text. Errors name the offending line.
pub fn parse_journal(text: &str) -> Result<Vec<Operation>> {
    let mut ops = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let op = wire::decode(line.as_bytes())
            .with_context(|| format!("Invalid operation on line {}", index + 1))?;
        ops.push(op);
    }
    Ok(ops)
}

/// Read and parse the journal at `path`.
pub fn load_journal(path: &Path) -> Result<Vec<Operation>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read journal {}", path.display()))?;
    parse_journal(&text).with_context(|| format!("Failed to parse journal {}", path.display()))
}

/// Write `ops` as a journal, one operation per line.
pub fn save_journal(path: &Path, ops: &[Operation]) -> Result<()> {
    let mut text = String::new();
    for op in ops {
        text.push_str(&serde_json::to_string(op)?);
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("Failed to write journal {}", path.display()))
}
