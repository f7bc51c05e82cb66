//! Incremental detection of in-band document tags.
//!
//! Models write long-form documents inline as
//! `<doc type="prd" name="Launch plan"> ... </doc>`. The text arrives in network
//! sized chunks, so a marker may be split anywhere, including inside an
//! attribute value. [`TagStreamParser`] holds back only the smallest tail that
//! could still turn into a marker; everything else is released immediately,
//! either as visible text or as captured document content.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter};

use crate::notification::NotificationType;

/// Longest opening marker we are willing to wait for before treating the
/// fragment as ordinary prose.
pub const MAX_TAG_LEN: usize = 512;

const CANONICAL_TAG: &str = "doc";
/// Older spellings, rewritten to `doc` before detection.
const LEGACY_TAGS: &[&str] = &["document", "artifact"];

lazy_static! {
    static ref ATTRIBUTE: Regex =
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentType {
    Prd,
    Implementation,
    Research,
    Specification,
    Design,
    Notes,
}

impl DocumentType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prd" | "requirements" => Some(DocumentType::Prd),
            "implementation" | "implementation_plan" => Some(DocumentType::Implementation),
            "research" => Some(DocumentType::Research),
            "specification" | "spec" => Some(DocumentType::Specification),
            "design" => Some(DocumentType::Design),
            "notes" => Some(DocumentType::Notes),
            _ => None,
        }
    }

    /// Channel that carries this document's streaming notifications.
    pub fn notification_type(&self) -> NotificationType {
        match self {
            DocumentType::Prd => NotificationType::Prd,
            DocumentType::Implementation => NotificationType::Implementation,
            DocumentType::Design => NotificationType::Design,
            _ => NotificationType::FileStream,
        }
    }
}

/// A document captured from the stream, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedDocument {
    pub id: String,
    pub doc_type: DocumentType,
    pub name: String,
    pub content: String,
    /// The stream ended before the closing marker arrived.
    pub force_closed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    /// Text meant for the reader.
    Text(String),
    /// An opening marker was recognised; later chunks belong to this document.
    DocumentStarted {
        id: String,
        doc_type: DocumentType,
        name: String,
    },
    DocumentChunk {
        id: String,
        doc_type: DocumentType,
        name: String,
        chunk: String,
    },
    DocumentCompleted(CapturedDocument),
}

#[derive(Debug)]
struct OpenDocument {
    id: String,
    doc_type: DocumentType,
    name: String,
    content: String,
}

#[derive(Debug, Default)]
enum Mode {
    #[default]
    Passthrough,
    Capturing(OpenDocument),
}

#[derive(Debug, PartialEq)]
enum Marker {
    /// The fragment may still become a marker once more text arrives.
    Incomplete,
    NotATag,
    Open { len: usize, attributes: String },
    Close { len: usize },
}

#[derive(Debug, Default)]
pub struct TagStreamParser {
    buffer: String,
    mode: Mode,
}

impl TagStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.mode, Mode::Capturing(_))
    }

    /// Type and name of the document currently being captured.
    pub fn current_document(&self) -> Option<(DocumentType, &str)> {
        match &self.mode {
            Mode::Capturing(doc) => Some((doc.doc_type, doc.name.as_str())),
            Mode::Passthrough => None,
        }
    }

    /// Feed the next chunk of model output.
    pub fn process(&mut self, chunk: &str) -> Vec<TagEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        loop {
            let progressed = match self.mode {
                Mode::Passthrough => self.scan_passthrough(&mut events),
                Mode::Capturing(_) => self.scan_capture(&mut events),
            };
            if !progressed {
                break;
            }
        }
        coalesce_text(events)
    }

    /// Release whatever is still held at the end of the stream. An open document
    /// is closed and emitted with everything captured so far.
    pub fn flush(&mut self) -> Vec<TagEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();

        match std::mem::take(&mut self.mode) {
            Mode::Passthrough => {
                if is_unterminated_tag(&rest) {
                    tracing::warn!(fragment = %rest, "dropping unterminated document marker");
                } else if !rest.is_empty() {
                    events.push(TagEvent::Text(rest));
                }
            }
            Mode::Capturing(mut doc) => {
                if rest.starts_with("</") {
                    tracing::warn!(fragment = %rest, "dropping partial closing marker");
                } else if !rest.is_empty() {
                    doc.content.push_str(&rest);
                    events.push(TagEvent::DocumentChunk {
                        id: doc.id.clone(),
                        doc_type: doc.doc_type,
                        name: doc.name.clone(),
                        chunk: rest,
                    });
                }
                tracing::warn!(
                    document = %doc.name,
                    doc_type = doc.doc_type.as_ref(),
                    "stream ended inside a document, closing it"
                );
                events.push(TagEvent::DocumentCompleted(CapturedDocument {
                    id: doc.id,
                    doc_type: doc.doc_type,
                    name: doc.name,
                    content: doc.content,
                    force_closed: true,
                }));
            }
        }
        events
    }

    /// Returns true when a marker was consumed and scanning should continue.
    fn scan_passthrough(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let mut search_from = 0;
        loop {
            let Some(offset) = self.buffer[search_from..].find('<') else {
                let text = std::mem::take(&mut self.buffer);
                push_text(events, text);
                return false;
            };
            let start = search_from + offset;

            match classify(&self.buffer[start..], false) {
                Marker::NotATag => search_from = start + 1,
                Marker::Incomplete => {
                    let text: String = self.buffer.drain(..start).collect();
                    push_text(events, text);
                    return false;
                }
                Marker::Close { len } => {
                    let text: String = self.buffer.drain(..start).collect();
                    push_text(events, text);
                    self.buffer.drain(..len);
                    tracing::warn!("stripping closing document marker with no open document");
                    return true;
                }
                Marker::Open { len, attributes } => {
                    let text: String = self.buffer.drain(..start).collect();
                    push_text(events, text);
                    self.buffer.drain(..len);
                    self.open_document(&attributes, events);
                    return true;
                }
            }
        }
    }

    fn scan_capture(&mut self, events: &mut Vec<TagEvent>) -> bool {
        let mut search_from = 0;
        loop {
            let Some(offset) = self.buffer[search_from..].find('<') else {
                let chunk = std::mem::take(&mut self.buffer);
                self.capture(chunk, events);
                return false;
            };
            let start = search_from + offset;

            match classify(&self.buffer[start..], true) {
                Marker::Incomplete => {
                    let chunk: String = self.buffer.drain(..start).collect();
                    self.capture(chunk, events);
                    return false;
                }
                Marker::Close { len } => {
                    let chunk: String = self.buffer.drain(..start).collect();
                    self.capture(chunk, events);
                    self.buffer.drain(..len);
                    if let Mode::Capturing(doc) = std::mem::take(&mut self.mode) {
                        events.push(TagEvent::DocumentCompleted(CapturedDocument {
                            id: doc.id,
                            doc_type: doc.doc_type,
                            name: doc.name,
                            content: doc.content,
                            force_closed: false,
                        }));
                    }
                    return true;
                }
                // Nested opening markers are document content.
                Marker::NotATag | Marker::Open { .. } => search_from = start + 1,
            }
        }
    }

    fn capture(&mut self, chunk: String, events: &mut Vec<TagEvent>) {
        if chunk.is_empty() {
            return;
        }
        if let Mode::Capturing(doc) = &mut self.mode {
            doc.content.push_str(&chunk);
            events.push(TagEvent::DocumentChunk {
                id: doc.id.clone(),
                doc_type: doc.doc_type,
                name: doc.name.clone(),
                chunk,
            });
        }
    }

    fn open_document(&mut self, attributes: &str, events: &mut Vec<TagEvent>) {
        let (doc_type, name) = parse_attributes(attributes);
        let Some(doc_type) = doc_type.as_deref().and_then(DocumentType::parse) else {
            tracing::warn!(
                doc_type = doc_type.as_deref().unwrap_or(""),
                "stripping document marker with unknown type"
            );
            return;
        };
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Untitled {}", doc_type.as_ref()));
        let id = uuid::Uuid::new_v4().to_string();

        events.push(TagEvent::DocumentStarted {
            id: id.clone(),
            doc_type,
            name: name.clone(),
        });
        self.mode = Mode::Capturing(OpenDocument {
            id,
            doc_type,
            name,
            content: String::new(),
        });
    }
}

/// Rewrite a tag name to its canonical spelling, if it is one we recognise.
fn canonical_tag_name(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    if lower == CANONICAL_TAG || LEGACY_TAGS.contains(&lower.as_str()) {
        Some(CANONICAL_TAG)
    } else {
        None
    }
}

fn could_become_tag_name(prefix: &str) -> bool {
    let lower = prefix.to_ascii_lowercase();
    std::iter::once(CANONICAL_TAG)
        .chain(LEGACY_TAGS.iter().copied())
        .any(|name| name.starts_with(&lower))
}

/// Decide what the text starting at a `<` is. `closing_only` ignores opening
/// markers, which is what we want while capturing a document.
fn classify(rest: &str, closing_only: bool) -> Marker {
    let after_lt = &rest[1..];
    if after_lt.is_empty() {
        return Marker::Incomplete;
    }

    let closing = after_lt.starts_with('/');
    if closing_only && !closing {
        return Marker::NotATag;
    }
    let body = if closing { &after_lt[1..] } else { after_lt };

    let name_len = body
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(body.len());
    let name = &body[..name_len];

    if name_len == body.len() {
        return if could_become_tag_name(name) {
            Marker::Incomplete
        } else {
            Marker::NotATag
        };
    }
    if canonical_tag_name(name).is_none() {
        return Marker::NotATag;
    }
    let after_name = &body[name_len..];
    let name_end = rest.len() - after_name.len();

    if closing {
        let trimmed = after_name.trim_start();
        if trimmed.is_empty() {
            return if rest.len() < MAX_TAG_LEN {
                Marker::Incomplete
            } else {
                Marker::NotATag
            };
        }
        return if trimmed.starts_with('>') {
            Marker::Close {
                len: rest.len() - trimmed.len() + 1,
            }
        } else {
            Marker::NotATag
        };
    }

    match after_name.chars().next() {
        Some(c) if c.is_whitespace() || c == '>' => {}
        _ => return Marker::NotATag,
    }

    match find_tag_end(after_name) {
        Some(gt) => Marker::Open {
            len: name_end + gt + 1,
            attributes: after_name[..gt].to_string(),
        },
        None if rest.len() < MAX_TAG_LEN => Marker::Incomplete,
        None => Marker::NotATag,
    }
}

/// Byte offset of the `>` ending a tag, skipping over quoted attribute values.
fn find_tag_end(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Returns the `type` and `name` attributes, accepting the legacy `kind` and
/// `title` spellings.
fn parse_attributes(source: &str) -> (Option<String>, Option<String>) {
    let mut doc_type = None;
    let mut name = None;
    for capture in ATTRIBUTE.captures_iter(source) {
        let value = capture
            .get(2)
            .or_else(|| capture.get(3))
            .map(|m| m.as_str().to_string());
        match capture[1].to_ascii_lowercase().as_str() {
            "type" | "kind" => doc_type = doc_type.or(value),
            "name" | "title" => name = name.or(value),
            _ => {}
        }
    }
    (doc_type, name)
}

/// True for a held fragment that already names a document tag but never closed
/// it, e.g. `<doc type="prd" na`. Short prefixes like `<do` are plain text.
fn is_unterminated_tag(fragment: &str) -> bool {
    let Some(body) = fragment.strip_prefix('<') else {
        return false;
    };
    let body = body.strip_prefix('/').unwrap_or(body);
    let name_len = body
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(body.len());
    name_len < body.len() && canonical_tag_name(&body[..name_len]).is_some()
}

fn push_text(events: &mut Vec<TagEvent>, text: String) {
    if !text.is_empty() {
        events.push(TagEvent::Text(text));
    }
}

fn coalesce_text(events: Vec<TagEvent>) -> Vec<TagEvent> {
    let mut merged: Vec<TagEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let TagEvent::Text(next) = &event {
            if let Some(TagEvent::Text(previous)) = merged.last_mut() {
                previous.push_str(next);
                continue;
            }
        }
        merged.push(event);
    }
    merged
}
