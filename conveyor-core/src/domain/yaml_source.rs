//! Source-level access to block-style YAML
//!
//! Locates the exact text of a scalar addressed by mapping keys and sequence
//! positions, so one value can be swapped while every other byte of the file
//! (comments, quoting, number formats) stays as written. Handles block
//! mappings, block sequences (indented or compact) and single-line scalars;
//! anything else is reported as unlocatable.

use serde_yaml::Value;
use std::ops::Range;

/// One concrete step into a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Key(String),
    Index(usize),
}

struct Line<'a> {
    /// Byte offset of the line start
    offset: usize,
    /// Byte offset just past the line terminator
    end: usize,
    indent: usize,
    text: &'a str,
}

impl Line<'_> {
    fn is_content(&self) -> bool {
        let trimmed = self.text.trim_start();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    }
}

/// Position where a node's first token starts
#[derive(Debug, Clone, Copy)]
struct Node {
    line: usize,
    col: usize,
}

fn lines(text: &str) -> Vec<Line<'_>> {
    let mut offset = 0;

    text.split_inclusive('\n')
        .map(|raw| {
            let body = raw.trim_end_matches(['\n', '\r']);
            let line = Line {
                offset,
                end: offset + raw.len(),
                indent: body.len() - body.trim_start_matches(' ').len(),
                text: body,
            };
            offset += raw.len();
            line
        })
        .collect()
}

fn is_document_marker(text: &str) -> bool {
    ["---", "..."].iter().any(|marker| {
        text.strip_prefix(*marker)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t']))
    })
}

fn is_sequence_entry(text: &str) -> bool {
    text == "-" || text.starts_with("- ") || text.starts_with("-\t")
}

/// Byte ranges of the documents of a stream, separator lines excluded
pub(crate) fn document_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;

    for line in lines(text) {
        if is_document_marker(line.text) {
            spans.push(start..line.offset);
            start = line.end;
        }
    }
    spans.push(start..text.len());

    spans
}

/// True when the text holds anything besides blank lines, comments and directives
pub(crate) fn has_content(text: &str) -> bool {
    lines(text)
        .iter()
        .any(|line| line.is_content() && !line.text.starts_with('%'))
}

fn next_content(lines: &[Line], from: usize) -> Option<usize> {
    (from..lines.len()).find(|&i| lines[i].is_content())
}

/// Next line at exactly `col`, skipping deeper lines; None once the block ends
fn next_sibling(lines: &[Line], from: usize, col: usize) -> Option<usize> {
    let mut index = from;
    loop {
        index = next_content(lines, index + 1)?;
        match lines[index].indent.cmp(&col) {
            std::cmp::Ordering::Less => return None,
            std::cmp::Ordering::Equal => return Some(index),
            std::cmp::Ordering::Greater => continue,
        }
    }
}

/// Index of the `:` ending a plain key, if the text starts with one
fn plain_key_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b':' if matches!(bytes.get(i + 1), None | Some(b' ') | Some(b'\t')) => {
                return Some(i);
            }
            b'#' if i > 0 && matches!(bytes[i - 1], b' ' | b'\t') => return None,
            _ => {}
        }
    }
    None
}

/// If the line holds `key:` at `at`, returns the byte index just past the colon
fn match_key(text: &str, at: usize, key: &str) -> Option<usize> {
    let rest = text.get(at..)?;
    if is_sequence_entry(rest) || rest.starts_with('#') {
        return None;
    }

    let (found, len) = match rest.as_bytes().first()? {
        quote @ (b'"' | b'\'') => {
            let close = rest[1..].find(char::from(*quote))?;
            (&rest[1..close + 1], close + 2)
        }
        _ => {
            let colon = plain_key_end(rest)?;
            (rest[..colon].trim_end(), colon)
        }
    };

    let after_key = &rest[len..];
    let trimmed = after_key.trim_start_matches(' ');
    let colon = len + (after_key.len() - trimmed.len());
    let after_colon = trimmed.strip_prefix(':')?;

    if !(after_colon.is_empty() || after_colon.starts_with([' ', '\t'])) || found != key {
        return None;
    }
    Some(at + colon + 1)
}

/// Node starting at or after byte `after` of line `index`
///
/// The node is inline when text follows on the same line, otherwise it is
/// the block on the following lines, deeper than `parent_col` (a compact
/// sequence may sit at `parent_col` itself).
fn node_after(lines: &[Line], index: usize, after: usize, parent_col: usize) -> Option<Node> {
    let text = lines[index].text;
    let rest = &text[after..];
    let start = after + (rest.len() - rest.trim_start_matches([' ', '\t']).len());

    if start < text.len() && !text[start..].starts_with('#') {
        return Some(Node {
            line: index,
            col: start,
        });
    }

    let next = next_content(lines, index + 1)?;
    let line = &lines[next];
    let compact = line.indent == parent_col && is_sequence_entry(&line.text[line.indent..]);
    (line.indent > parent_col || compact).then_some(Node {
        line: next,
        col: line.indent,
    })
}

fn mapping_value(lines: &[Line], node: Node, key: &str) -> Option<Node> {
    let mut index = node.line;

    loop {
        if let Some(after) = match_key(lines[index].text, node.col, key) {
            return node_after(lines, index, after, node.col);
        }
        index = next_sibling(lines, index, node.col)?;
    }
}

fn sequence_item(lines: &[Line], node: Node, position: usize) -> Option<Node> {
    let mut index = node.line;
    let mut remaining = position;

    loop {
        if !is_sequence_entry(lines[index].text.get(node.col..)?) {
            return None;
        }
        if remaining == 0 {
            return node_after(lines, index, node.col + 1, node.col);
        }
        remaining -= 1;
        index = next_sibling(lines, index, node.col)?;
    }
}

/// Span of a single-line scalar starting at `col`, relative to the line
fn scalar_span(text: &str, col: usize) -> Option<Range<usize>> {
    let rest = text.get(col..)?;

    match rest.as_bytes().first()? {
        b'"' => {
            let mut escaped = false;
            for (i, c) in rest.char_indices().skip(1) {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => return Some(col..col + i + 1),
                    _ => escaped = false,
                }
            }
            None
        }
        b'\'' => {
            let bytes = rest.as_bytes();
            let mut i = 1;
            while i < bytes.len() {
                if bytes[i] == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    return Some(col..col + i + 1);
                }
                i += 1;
            }
            None
        }
        b'|' | b'>' | b'&' | b'*' | b'!' | b'[' | b'{' => None,
        _ => {
            let bytes = rest.as_bytes();
            let end = (1..bytes.len())
                .find(|&i| bytes[i] == b'#' && matches!(bytes[i - 1], b' ' | b'\t'))
                .unwrap_or(bytes.len());
            Some(col..col + rest[..end].trim_end().len())
        }
    }
}

/// Byte range of the scalar reached by `steps`, relative to `document`
pub(crate) fn locate_scalar(document: &str, steps: &[Step]) -> Option<Range<usize>> {
    let lines = lines(document);
    let first = next_content(&lines, 0)?;
    let mut node = Node {
        line: first,
        col: lines[first].indent,
    };

    for step in steps {
        node = match step {
            Step::Key(key) => mapping_value(&lines, node, key)?,
            Step::Index(position) => sequence_item(&lines, node, *position)?,
        };
    }

    let line = &lines[node.line];
    let span = scalar_span(line.text, node.col)?;
    Some(line.offset + span.start..line.offset + span.end)
}

/// String a scalar's source text denotes, if it denotes a string
pub(crate) fn decode_scalar(raw: &str) -> Option<String> {
    match serde_yaml::from_str::<Value>(raw).ok()? {
        Value::String(value) => Some(value),
        _ => None,
    }
}

/// Words YAML 1.1 loaders (kubectl among them) read as booleans or null
const YAML11_RESERVED: [&str; 11] = [
    "y", "n", "yes", "no", "on", "off", "true", "false", "null", "~", "",
];

fn is_plain_safe(value: &str) -> bool {
    value.trim() == value
        && !value.contains(['\n', '\r', '\t'])
        && !value.contains(": ")
        && !value.contains(" #")
        && !YAML11_RESERVED.contains(&value.to_ascii_lowercase().as_str())
        && decode_scalar(value).as_deref() == Some(value)
}

fn double_quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Source text for `value`, keeping the quoting style of `original`
pub(crate) fn render_scalar(original: &str, value: &str) -> String {
    match original.as_bytes().first() {
        Some(b'\'') => format!("'{}'", value.replace('\'', "''")),
        Some(b'"') => double_quoted(value),
        _ if is_plain_safe(value) => value.to_string(),
        _ => double_quoted(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> Step {
        Step::Key(k.to_string())
    }

    fn located<'a>(document: &'a str, steps: &[Step]) -> Option<&'a str> {
        locate_scalar(document, steps).map(|span| &document[span])
    }

    #[test]
    fn test_document_spans_skip_separators() {
        let stream = "---\na: 1\n--- # second\nb: 2\n...\n";
        let spans = document_spans(stream);
        let texts: Vec<&str> = spans.into_iter().map(|s| &stream[s]).collect();

        assert_eq!(texts, vec!["", "a: 1\n", "b: 2\n", ""]);
        assert!(!has_content("# only a comment\n\n"));
        assert!(has_content("a: 1\n"));
    }

    #[test]
    fn test_locates_through_compact_and_indented_sequences() {
        let document = "\
spec:
  containers:
  - name: sidecar
    image: org/sidecar:1
  - name: app
    ports:
      - containerPort: 8080  # http
    image: org/app:41 # pinned
";
        let steps = [key("spec"), key("containers"), Step::Index(1), key("image")];
        assert_eq!(located(document, &steps), Some("org/app:41"));

        let port = [
            key("spec"),
            key("containers"),
            Step::Index(1),
            key("ports"),
            Step::Index(0),
            key("containerPort"),
        ];
        assert_eq!(located(document, &port), Some("8080"));
    }

    #[test]
    fn test_locates_quoted_scalars_and_keys() {
        let document = "meta:\n  \"name\": 'it''s'\n  image: \"org/app:41\"  # quoted\n";

        assert_eq!(located(document, &[key("meta"), key("name")]), Some("'it''s'"));
        assert_eq!(
            located(document, &[key("meta"), key("image")]),
            Some("\"org/app:41\"")
        );
        assert_eq!(decode_scalar("'it''s'").as_deref(), Some("it's"));
    }

    #[test]
    fn test_does_not_match_key_prefixes_or_nested_keys() {
        let document = "imageTag: x\nnested:\n  image: y\nimage: z\n";
        assert_eq!(located(document, &[key("image")]), Some("z"));
        assert_eq!(located(document, &[key("missing")]), None);
    }

    #[test]
    fn test_block_and_flow_values_are_not_locatable() {
        assert_eq!(located("image: |\n  org/app:41\n", &[key("image")]), None);
        assert_eq!(located("spec: {image: a}\n", &[key("spec"), key("image")]), None);
    }

    #[test]
    fn test_render_keeps_style_and_quotes_ambiguous_plain_values() {
        assert_eq!(render_scalar("org/app:41", "org/app:42"), "org/app:42");
        assert_eq!(render_scalar("\"org/app:41\"", "org/app:42"), "\"org/app:42\"");
        assert_eq!(render_scalar("'org/app:41'", "org/app:42"), "'org/app:42'");
        assert_eq!(render_scalar("a", "42"), "\"42\"");
        assert_eq!(render_scalar("a", "yes"), "\"yes\"");
    }
}
