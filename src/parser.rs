//! MIME parsing of fetched messages.
//!
//! Wraps [`mailparse`] and flattens the MIME tree into a [`ParsedMessage`]:
//! inline text and HTML parts become the body, everything else becomes an
//! [`Attachment`] in encounter order.

use crate::config::ParserOptions;
use chrono::{DateTime, Utc};
use mailparse::body::Body;
use mailparse::{DispositionType, MailHeaderMap, MailParseError, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{trace, warn};

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:https?://|mailto:)[^\s<>"']+[^\s<>"'.,;:!?)\]]"#).expect("valid regex"));

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").expect("valid regex"));

static SCRIPT_OR_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b.*?</(?:script|style)\s*>").expect("valid regex"));

static LINE_BREAK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</(?:p|div|tr|li|h[1-6])\s*>").expect("valid regex"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static EXCESS_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// One header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name as it appeared in the message.
    pub name: String,
    /// Decoded header value.
    pub value: String,
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// First value of header `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values of header `name`, in message order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Iterates over all headers in message order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    /// Number of header lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// How an attachment was presented in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Displayed inline (e.g. embedded images, calendar invites).
    Inline,
    /// Explicit `Content-Disposition: attachment`.
    Attachment,
}

/// A non-body MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name from `Content-Disposition` or the `name` content type parameter.
    pub filename: Option<String>,
    /// MIME type, lowercased.
    pub content_type: String,
    /// Presentation hint.
    pub disposition: Disposition,
    /// `Content-ID` without angle brackets.
    pub content_id: Option<String>,
    /// Decoded content.
    pub content: Vec<u8>,
}

impl Attachment {
    /// Content length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Textual bodies of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    /// HTML body.
    pub html: Option<String>,
    /// Plain text body.
    pub text: Option<String>,
    /// The plain text body rendered as HTML.
    pub text_as_html: Option<String>,
}

/// A fully parsed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    /// All top-level headers.
    pub headers: Headers,
    /// `Subject` header.
    pub subject: Option<String>,
    /// `From` header.
    pub from: Option<String>,
    /// `To` header.
    pub to: Option<String>,
    /// `Cc` header.
    pub cc: Option<String>,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Plain text body rendered as HTML.
    pub text_as_html: Option<String>,
    /// Attachments in encounter order.
    pub attachments: Vec<Arc<Attachment>>,
}

impl ParsedMessage {
    /// Copies out the textual bodies.
    #[must_use]
    pub fn body(&self) -> MessageBody {
        MessageBody {
            html: self.html.clone(),
            text: self.text.clone(),
            text_as_html: self.text_as_html.clone(),
        }
    }
}

#[derive(Default)]
struct Parts {
    text: Vec<String>,
    html: Vec<String>,
    attachments: Vec<Arc<Attachment>>,
}

/// Parses a raw RFC 5322 message.
///
/// # Errors
///
/// Returns an error if the header or MIME structure cannot be parsed. A part
/// whose transfer encoding does not decode is kept with its encoded bytes.
pub fn parse_message(raw: &[u8], options: &ParserOptions) -> Result<ParsedMessage, MailParseError> {
    let parsed = mailparse::parse_mail(raw)?;

    let mut parts = Parts::default();
    collect_parts(&parsed, &mut parts);

    let html = (!parts.html.is_empty()).then(|| parts.html.join("<br/>"));
    let mut text = (!parts.text.is_empty()).then(|| parts.text.join("\n"));
    if text.is_none() && !options.skip_html_to_text {
        text = html.as_deref().map(html_to_text);
    }
    let text_as_html = if options.skip_text_to_html {
        None
    } else {
        text.as_deref().map(text_to_html)
    };

    let headers = Headers(
        parsed
            .headers
            .iter()
            .map(|h| Header {
                name: h.get_key(),
                value: h.get_value(),
            })
            .collect(),
    );

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|timestamp| DateTime::<Utc>::from_timestamp(timestamp, 0));

    trace!(
        headers = headers.len(),
        attachments = parts.attachments.len(),
        has_text = text.is_some(),
        has_html = html.is_some(),
        "Parsed message"
    );

    Ok(ParsedMessage {
        subject: parsed.headers.get_first_value("Subject"),
        from: parsed.headers.get_first_value("From"),
        to: parsed.headers.get_first_value("To"),
        cc: parsed.headers.get_first_value("Cc"),
        message_id: parsed.headers.get_first_value("Message-ID"),
        date,
        headers,
        text,
        html,
        text_as_html,
        attachments: parts.attachments,
    })
}

/// Walks the MIME tree depth-first, sorting leaves into bodies and attachments.
fn collect_parts(part: &ParsedMail<'_>, parts: &mut Parts) {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if mimetype.starts_with("multipart/") {
        for subpart in &part.subparts {
            collect_parts(subpart, parts);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let explicit_attachment = matches!(disposition.disposition, DispositionType::Attachment);
    let inline_body = !explicit_attachment && filename.is_none();

    match mimetype.as_str() {
        "text/plain" if inline_body => parts.text.push(decoded_text(part)),
        "text/html" if inline_body => parts.html.push(decoded_text(part)),
        _ => {
            let content_id = part
                .headers
                .get_first_value("Content-ID")
                .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string());

            parts.attachments.push(Arc::new(Attachment {
                filename,
                content_type: mimetype,
                disposition: if explicit_attachment {
                    Disposition::Attachment
                } else {
                    Disposition::Inline
                },
                content_id,
                content: decoded_bytes(part),
            }));
        }
    }
}

/// Bytes of a part as they appear in the message, before transfer decoding.
fn encoded_bytes<'a>(part: &'a ParsedMail<'_>) -> &'a [u8] {
    match part.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw(),
        Body::Binary(body) => body.get_raw(),
    }
}

fn decoded_text(part: &ParsedMail<'_>) -> String {
    part.get_body().unwrap_or_else(|e| {
        warn!(error = %e, mimetype = %part.ctype.mimetype, "Undecodable text part, keeping encoded form");
        String::from_utf8_lossy(encoded_bytes(part)).into_owned()
    })
}

fn decoded_bytes(part: &ParsedMail<'_>) -> Vec<u8> {
    part.get_body_raw().unwrap_or_else(|e| {
        warn!(error = %e, mimetype = %part.ctype.mimetype, "Undecodable attachment, keeping encoded bytes");
        encoded_bytes(part).to_vec()
    })
}

/// Renders plain text as HTML: escaped, links made clickable, paragraphs wrapped.
#[must_use]
pub fn text_to_html(text: &str) -> String {
    let mut html = String::with_capacity(text.len() + 16);

    for paragraph in PARAGRAPH_BREAK.split(text.trim()) {
        if paragraph.trim().is_empty() {
            continue;
        }
        html.push_str("<p>");
        html.push_str(&linkify(paragraph).replace("\r\n", "\n").replace('\n', "<br/>"));
        html.push_str("</p>");
    }

    html
}

fn linkify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for url in URL.find_iter(text) {
        out.push_str(&escape_html(&text[last..url.start()]));
        let escaped = escape_html(url.as_str());
        let _ = write!(out, r#"<a href="{escaped}">{escaped}</a>"#);
        last = url.end();
    }
    out.push_str(&escape_html(&text[last..]));

    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reduces HTML to readable plain text.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_OR_STYLE.replace_all(html, "");
    let text = LINE_BREAK_TAG.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    EXCESS_BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}
