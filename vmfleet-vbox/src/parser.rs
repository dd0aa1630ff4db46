//! Parsers for the two text shapes `VBoxManage` emits.
//!
//! - Flat mode: `"key"="value"` lines from `showvminfo --machinereadable`.
//! - Block mode: blank-line separated records of `key: value` lines, as in
//!   `list dhcpservers` or `list systemproperties`.

use indexmap::IndexMap;

/// One parsed record. Keeps encounter order.
pub type Record = IndexMap<String, String>;

/// Parse `key=value` lines into one record.
///
/// Surrounding quotes are stripped from keys and values. Lines without `=`
/// are ignored. Only the first `=` splits, so values may contain `=`.
#[must_use]
pub fn parse_flat(content: &str) -> Record {
    let mut record = Record::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        record.insert(unquote(key).to_owned(), unquote(value).to_owned());
    }
    record
}

/// Parse blank-line separated `key: value` records.
///
/// End of input terminates the last record even without a trailing blank
/// line. Consecutive blank lines do not produce empty records.
#[must_use]
pub fn parse_blocks(content: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn unquote(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    trimmed.strip_suffix('"').unwrap_or(trimmed)
}
