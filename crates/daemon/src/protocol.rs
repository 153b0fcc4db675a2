//! Line protocol codec for the playout engine's control socket.
//!
//! Requests are plain text lines. Responses are one or more lines terminated by
//! a line equal to [`SENTINEL`]; a response is either free text, a list of
//! `key="value"` lines, or numbered sections introduced by `--- N ---`.
//!
//! Nothing in this module fails: malformed input yields partial or empty
//! structures and the caller decides whether that is an error.

use std::collections::{BTreeMap, HashMap};

/// Line marking the end of one command's response.
pub const SENTINEL: &str = "END";

/// Directive that makes the control socket close the connection.
pub const DISCONNECT: &str = "quit";

/// Key/value pairs of one metadata block.
pub type Section = HashMap<String, String>;

/// Encode a single command as one terminated line.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + 1);
    out.extend_from_slice(command.trim_end_matches(['\r', '\n']).as_bytes());
    out.push(b'\n');
    out
}

/// Encode several commands for a one-shot session, closed by [`DISCONNECT`].
///
/// Pooled connections stay open and send with [`encode_command`]; this form is
/// for short-lived sessions such as the startup probe.
pub fn encode_batch<S: AsRef<str>>(commands: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for command in commands {
        out.extend(encode_command(command.as_ref()));
    }
    out.extend(encode_command(DISCONNECT));
    out
}

/// Returns true when `line` is the end-of-response marker.
///
/// The comparison ignores a trailing carriage return but is otherwise exact
/// and case-sensitive.
pub fn is_sentinel(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == SENTINEL
}

/// Decode raw response bytes into lines.
///
/// Carriage returns and blank lines are dropped. Decoding stops at the first
/// sentinel line; anything after it is discarded.
pub fn decode_response(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = Vec::new();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line == SENTINEL {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        lines.push(line.to_string());
    }

    lines
}

/// Returns true when the control socket rejected the command.
pub fn is_error_reply(lines: &[String]) -> bool {
    lines
        .first()
        .map(|line| line.trim_start().starts_with("ERROR"))
        .unwrap_or(false)
}

/// Split one `key="value"` line. Quotes around the value are optional.
pub fn parse_keyvalue_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }

    let value = value.trim();
    let value = value.strip_prefix('"').unwrap_or(value);
    let value = value.strip_suffix('"').unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Collect `key="value"` lines into a map. Later keys overwrite earlier ones.
pub fn parse_keyvalue<S: AsRef<str>>(lines: &[S]) -> Section {
    lines
        .iter()
        .filter_map(|line| parse_keyvalue_line(line.as_ref()))
        .collect()
}

/// Parse a `--- N ---` header line into its section number.
pub fn parse_section_header(line: &str) -> Option<u32> {
    line.trim()
        .strip_prefix("--- ")?
        .strip_suffix(" ---")?
        .trim()
        .parse()
        .ok()
}

/// Group key/value lines under the most recent `--- N ---` header.
///
/// Key/value lines seen before the first header belong to no section and are
/// ignored.
pub fn parse_sections<S: AsRef<str>>(lines: &[S]) -> BTreeMap<u32, Section> {
    let mut sections: BTreeMap<u32, Section> = BTreeMap::new();
    let mut current: Option<u32> = None;

    for line in lines {
        let line = line.as_ref();
        if let Some(number) = parse_section_header(line) {
            sections.entry(number).or_default();
            current = Some(number);
            continue;
        }

        let Some(number) = current else { continue };
        if let Some((key, value)) = parse_keyvalue_line(line) {
            sections.entry(number).or_default().insert(key, value);
        }
    }

    sections
}

/// Parse a metadata reply into numbered sections.
///
/// A reply without section headers but with `key="value"` lines is treated as
/// a single block numbered 1.
pub fn parse_metadata<S: AsRef<str>>(lines: &[S]) -> BTreeMap<u32, Section> {
    let sections = parse_sections(lines);
    if !sections.is_empty() {
        return sections;
    }
    let block = parse_keyvalue(lines);
    if block.is_empty() {
        return sections;
    }
    BTreeMap::from([(1, block)])
}
