// SPDX-License-Identifier: AGPL-3.0-or-later

//! A minimal, XML-library-agnostic tokenizer for the bus config format.
//!
//! Grounded in `examples/original_source/bus/config-parser.c`, whose own
//! header comment describes the parser as agnostic to whatever tokenizer
//! sits below it. No crate in the example pack pulls in a general XML
//! library for this shape of problem, so this module is a small hand-rolled
//! scanner: start tags (with `key="value"` attributes), end tags, text
//! content, and self-closing tags. No entities, namespaces, comments, or
//! CDATA beyond what the bus config schema exercises.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("unexpected end of input inside a tag")]
    UnterminatedTag,
    #[error("malformed attribute near byte {0}")]
    MalformedAttribute(usize),
    #[error("unterminated attribute value near byte {0}")]
    UnterminatedAttributeValue(usize),
    #[error("unexpected '<' inside attribute value")]
    UnexpectedLt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `<name attr="value" ...>`
    StartTag { name: String, attrs: Vec<(String, String)> },
    /// `<name attr="value" .../>`, reported as `StartTag` immediately
    /// followed by `EndTag` with the same name.
    EndTag { name: String },
    /// Non-whitespace-only text content between tags.
    Text(String),
}

/// Scans `input` into a flat list of [`Token`]s. XML declarations
/// (`<?xml ... ?>`) and comments (`<!-- ... -->`) are skipped.
pub fn tokenize(input: &str) -> Result<Vec<Token>, XmlError> {
    let bytes = input.as_bytes();
    let mut pos = 0usize;
    let mut tokens = Vec::new();

    while pos < bytes.len() {
        if bytes[pos] == b'<' {
            if input[pos..].starts_with("<?") {
                pos = skip_until(input, pos, "?>")?;
                continue;
            }
            if input[pos..].starts_with("<!--") {
                pos = skip_until(input, pos, "-->")?;
                continue;
            }
            let (start, self_closing, next) = scan_tag(input, pos)?;
            let end_name = match &start {
                Token::StartTag { name, .. } => name.clone(),
                Token::EndTag { name } => name.clone(),
                Token::Text(_) => unreachable!("scan_tag never produces Text"),
            };
            tokens.push(start);
            if self_closing {
                tokens.push(Token::EndTag { name: end_name });
            }
            pos = next;
        } else {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'<' {
                pos += 1;
            }
            let text = &input[start..pos];
            if !text.trim().is_empty() {
                tokens.push(Token::Text(unescape(text)));
            }
        }
    }
    Ok(tokens)
}

fn skip_until(input: &str, from: usize, terminator: &str) -> Result<usize, XmlError> {
    match input[from..].find(terminator) {
        Some(rel) => Ok(from + rel + terminator.len()),
        None => Err(XmlError::UnterminatedTag),
    }
}

/// Scans one `<...>` construct starting at `pos` (which points at `<`).
/// Returns the produced token, whether it was self-closing (`<.../>`, in
/// which case `tokenize` also pushes a matching synthetic `EndTag`), and
/// the position just past the tag.
fn scan_tag(input: &str, pos: usize) -> Result<(Token, bool, usize), XmlError> {
    let bytes = input.as_bytes();
    let end = input[pos..].find('>').map(|i| pos + i).ok_or(XmlError::UnterminatedTag)?;
    let inner = &input[pos + 1..end];

    if let Some(name) = inner.strip_prefix('/') {
        return Ok((Token::EndTag { name: name.trim().to_owned() }, false, end + 1));
    }

    let self_closing = inner.ends_with('/');
    let inner = inner.strip_suffix('/').unwrap_or(inner);

    let mut chars = inner.char_indices().peekable();
    let name_start = 0;
    let mut name_end = inner.len();
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            name_end = i;
            break;
        }
        chars.next();
    }
    let name = inner[name_start..name_end].trim().to_owned();

    let mut attrs = Vec::new();
    let rest = inner[name_end..].trim_start();
    let mut cursor = 0usize;
    let rest_bytes = rest.as_bytes();
    while cursor < rest_bytes.len() {
        while cursor < rest_bytes.len() && rest_bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= rest_bytes.len() {
            break;
        }
        let key_start = cursor;
        while cursor < rest_bytes.len() && rest_bytes[cursor] != b'=' && !rest_bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        let key = rest[key_start..cursor].to_owned();
        while cursor < rest_bytes.len() && rest_bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= rest_bytes.len() || rest_bytes[cursor] != b'=' {
            return Err(XmlError::MalformedAttribute(pos + name_end + cursor));
        }
        cursor += 1;
        while cursor < rest_bytes.len() && rest_bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        let quote = *rest_bytes.get(cursor).ok_or(XmlError::UnterminatedAttributeValue(pos))?;
        if quote != b'"' && quote != b'\'' {
            return Err(XmlError::MalformedAttribute(pos + name_end + cursor));
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < rest_bytes.len() && rest_bytes[cursor] != quote {
            if rest_bytes[cursor] == b'<' {
                return Err(XmlError::UnexpectedLt);
            }
            cursor += 1;
        }
        if cursor >= rest_bytes.len() {
            return Err(XmlError::UnterminatedAttributeValue(pos));
        }
        let value = unescape(&rest[value_start..cursor]);
        cursor += 1;
        attrs.push((key, value));
    }

    let start = Token::StartTag { name: name.clone(), attrs };
    Ok((start, self_closing, end + 1))
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
