//! Incremental XML stream parsing.
//!
//! XMPP uses one long-lived XML document per direction of a session: the
//! `<stream:stream>` root stays open while stanzas arrive as its children.
//! The parser therefore works incrementally at element depth 1 — the root
//! open tag, each complete depth-1 child, and the root close tag each become
//! one event. Bytes are fed as they arrive from the socket; partial tags and
//! partial entities simply wait for more data.

use std::collections::VecDeque;

use crate::xml::Element;

/// Cap on buffered, not-yet-parsed input. A single token larger than this
/// (one tag or one text run) means the stream is abusive or broken.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Events produced by the stream parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream root opened: `<stream:stream …>`
    StreamStart {
        /// Qualified root tag name
        name: String,
        /// Root attributes in document order
        attrs: Vec<(String, String)>,
    },
    /// A complete depth-1 element (a stanza or negotiation element)
    Element(Element),
    /// The stream root closed: `</stream:stream>`
    StreamEnd(String),
    /// The byte stream is not well-formed XML
    Error(String),
}

/// Incremental parser for one XML stream.
///
/// Feed raw bytes with [`StreamParser::feed`]; complete events come back in
/// document order. After an [`StreamEvent::Error`] the parser stops until
/// [`StreamParser::reset`] rebuilds it (used after SASL success, which
/// restarts the stream).
pub struct StreamParser {
    buf: Vec<u8>,
    stack: Vec<Element>,
    root_name: Option<String>,
    ended: bool,
    failed: bool,
}

impl StreamParser {
    /// Create a fresh parser.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            stack: Vec::new(),
            root_name: None,
            ended: false,
            failed: false,
        }
    }

    /// Discard all state and start a new stream.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stack.clear();
        self.root_name = None;
        self.ended = false;
        self.failed = false;
    }

    /// Feed bytes into the parser, returning the events they complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        if self.failed || self.ended {
            return Vec::new();
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_PENDING_BYTES {
            self.failed = true;
            return vec![StreamEvent::Error("input buffer limit exceeded".to_string())];
        }

        let mut events = VecDeque::new();
        let mut pos = 0usize;

        while pos < self.buf.len() {
            if self.buf[pos] != b'<' {
                // Character data runs to the next tag. Without a following
                // '<' the run may still grow (or hold a split entity), so
                // leave it buffered.
                let Some(rel) = find_byte(&self.buf[pos..], b'<') else {
                    break;
                };
                let end = pos + rel;
                match take_text(&self.buf[pos..end]) {
                    Ok(text) => {
                        // Text between stanzas (whitespace keepalives) is
                        // dropped; text inside an open element is kept.
                        if let Some(top) = self.stack.last_mut() {
                            top.append_text(text);
                        }
                    }
                    Err(msg) => {
                        self.failed = true;
                        events.push_back(StreamEvent::Error(msg));
                        break;
                    }
                }
                pos = end;
                continue;
            }

            match self.scan_markup(pos) {
                Scan::NeedMore => break,
                Scan::Skip(next) => pos = next,
                Scan::Token(token, next) => {
                    pos = next;
                    match self.apply(token, &mut events) {
                        Ok(()) => {}
                        Err(msg) => {
                            self.failed = true;
                            events.push_back(StreamEvent::Error(msg));
                            break;
                        }
                    }
                    if self.ended {
                        break;
                    }
                }
                Scan::Malformed(msg) => {
                    self.failed = true;
                    events.push_back(StreamEvent::Error(msg));
                    break;
                }
            }
        }

        self.buf.drain(..pos);
        events.into()
    }

    /// Classify the markup starting at `pos` (which is a `<`).
    fn scan_markup(&self, pos: usize) -> Scan {
        let rest = &self.buf[pos..];

        if rest.starts_with(b"<?") {
            return match find_seq(rest, b"?>") {
                Some(end) => Scan::Skip(pos + end + 2),
                None => Scan::NeedMore,
            };
        }
        if rest.starts_with(b"<!--") {
            return match find_seq(rest, b"-->") {
                Some(end) => Scan::Skip(pos + end + 3),
                None => Scan::NeedMore,
            };
        }
        if rest.starts_with(b"<!") {
            // Might still become a comment; otherwise DTD internals are
            // rejected on an XMPP stream.
            if rest.len() < 4 {
                return Scan::NeedMore;
            }
            return Scan::Malformed("restricted XML".to_string());
        }

        // Find the closing '>' of the tag, honouring quoted attribute
        // values ('>' may legally occur inside them).
        let mut quote: Option<u8> = None;
        for (i, &b) in rest.iter().enumerate().skip(1) {
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'>' => {
                        let inner = &rest[1..i];
                        return match parse_tag(inner) {
                            Ok(token) => Scan::Token(token, pos + i + 1),
                            Err(msg) => Scan::Malformed(msg),
                        };
                    }
                    b'<' => return Scan::Malformed("'<' inside tag".to_string()),
                    _ => {}
                },
            }
        }
        Scan::NeedMore
    }

    /// Apply one parsed tag to the element stack, emitting events.
    fn apply(&mut self, token: Tag, events: &mut VecDeque<StreamEvent>) -> Result<(), String> {
        match token {
            Tag::Open {
                name,
                attrs,
                self_closing,
            } => {
                if self.root_name.is_none() {
                    events.push_back(StreamEvent::StreamStart {
                        name: name.clone(),
                        attrs,
                    });
                    if self_closing {
                        self.ended = true;
                        events.push_back(StreamEvent::StreamEnd(name.clone()));
                    }
                    self.root_name = Some(name);
                    return Ok(());
                }
                let el = Element::with_attrs(name, attrs);
                if self_closing {
                    self.attach(el, events);
                } else {
                    self.stack.push(el);
                }
                Ok(())
            }
            Tag::Close(name) => {
                match self.stack.pop() {
                    Some(el) => {
                        if el.name() != name {
                            return Err(format!(
                                "mismatched close tag: expected </{}>, got </{}>",
                                el.name(),
                                name
                            ));
                        }
                        self.attach(el, events);
                    }
                    None => match &self.root_name {
                        Some(root) if *root == name => {
                            self.ended = true;
                            events.push_back(StreamEvent::StreamEnd(name));
                        }
                        _ => return Err(format!("unexpected close tag </{}>", name)),
                    },
                }
                Ok(())
            }
        }
    }

    /// Attach a completed element to its parent, or emit it at depth 1.
    fn attach(&mut self, el: Element, events: &mut VecDeque<StreamEvent>) {
        match self.stack.last_mut() {
            Some(parent) => parent.append_child(el),
            None => events.push_back(StreamEvent::Element(el)),
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

enum Scan {
    /// The markup is not complete yet; wait for more bytes
    NeedMore,
    /// Markup consumed without producing a token (prolog, comment)
    Skip(usize),
    /// A complete tag, and the position just past it
    Token(Tag, usize),
    /// The stream is not well-formed
    Malformed(String),
}

enum Tag {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn find_seq(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decode a character-data run.
fn take_text(raw: &[u8]) -> Result<String, String> {
    let s = std::str::from_utf8(raw).map_err(|_| "invalid UTF-8 in character data".to_string())?;
    unescape(s)
}

/// Parse the inside of a tag (between `<` and `>`).
fn parse_tag(inner: &[u8]) -> Result<Tag, String> {
    let s = std::str::from_utf8(inner).map_err(|_| "invalid UTF-8 in tag".to_string())?;

    if let Some(name) = s.strip_prefix('/') {
        let name = name.trim();
        if name.is_empty() || !is_name(name) {
            return Err(format!("bad close tag name: {:?}", name));
        }
        return Ok(Tag::Close(name.to_string()));
    }

    let (s, self_closing) = match s.strip_suffix('/') {
        Some(stripped) => (stripped, true),
        None => (s, false),
    };

    let name_end = s
        .find(|c: char| c.is_whitespace())
        .unwrap_or(s.len());
    let name = &s[..name_end];
    if name.is_empty() || !is_name(name) {
        return Err(format!("bad tag name: {:?}", name));
    }

    let mut attrs = Vec::new();
    let rest = &s[name_end..];
    let mut cursor = rest;
    loop {
        cursor = cursor.trim_start();
        if cursor.is_empty() {
            break;
        }
        let eq = cursor
            .find('=')
            .ok_or_else(|| "attribute without value".to_string())?;
        let attr_name = cursor[..eq].trim_end();
        if attr_name.is_empty() || !is_name(attr_name) {
            return Err(format!("bad attribute name: {:?}", attr_name));
        }
        let after_eq = cursor[eq + 1..].trim_start();
        let quote = after_eq
            .chars()
            .next()
            .ok_or_else(|| "attribute without value".to_string())?;
        if quote != '\'' && quote != '"' {
            return Err("unquoted attribute value".to_string());
        }
        let value_body = &after_eq[1..];
        let close = value_body
            .find(quote)
            .ok_or_else(|| "unterminated attribute value".to_string())?;
        let value = unescape(&value_body[..close])?;
        attrs.push((attr_name.to_string(), value));
        cursor = &value_body[close + 1..];
    }

    Ok(Tag::Open {
        name: name.to_string(),
        attrs,
        self_closing,
    })
}

/// Accept XML name characters, including the `prefix:name` form.
fn is_name(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'))
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// Decode the five predefined entities and numeric character references.
fn unescape(s: &str) -> Result<String, String> {
    if !s.contains('&') {
        return Ok(s.to_string());
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let semi = tail
            .find(';')
            .filter(|&i| i <= 10)
            .ok_or_else(|| "unterminated entity reference".to_string())?;
        let entity = &tail[..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "apos" => out.push('\''),
            "quot" => out.push('"'),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                let c = code
                    .and_then(char::from_u32)
                    .ok_or_else(|| format!("unknown entity: &{};", entity))?;
                out.push(c);
            }
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
