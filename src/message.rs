//! Message parsing and content digests
//!
//! Parses RFC822 messages using `mailparse`, walks MIME parts to collect
//! decoded text bodies, and computes a stable content digest over normalized
//! raw bytes. Also handles the two multi-message framings: mbox files
//! (`From ` separator lines) and maildir-style directories.

use std::fs;
use std::path::{Path, PathBuf};

use mailparse::{MailHeader, ParsedMail};
use md5::{Digest as _, Md5};

use crate::errors::{ProbeError, ProbeResult};

/// Stable 16-byte content digest of a message
///
/// MD5 over the raw bytes with CRLF normalized to LF and trailing whitespace
/// stripped per line, so the digest is identical across OS line-ending
/// conventions. Used to make training idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageDigest([u8; 16]);

impl MessageDigest {
    /// Compute the digest of raw message bytes
    pub fn of(raw: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(normalize_raw(raw));
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering, as used in the export format
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex rendering back into a digest
    ///
    /// # Errors
    ///
    /// Returns `StoreCorrupt` when the input is not 32 hex digits, since the
    /// only callers are dump importers.
    pub fn from_hex(raw: &str) -> ProbeResult<Self> {
        let bytes = hex::decode(raw.trim())
            .map_err(|e| ProbeError::StoreCorrupt(format!("bad digest '{raw}': {e}")))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ProbeError::StoreCorrupt(format!("bad digest length in '{raw}'")))?;
        Ok(Self(bytes))
    }
}

/// One message header field, order and duplicates preserved
#[derive(Debug, Clone)]
pub struct HeaderField {
    /// Field name as it appeared
    pub name: String,
    /// Unfolded, decoded field value
    pub value: String,
}

/// One decoded MIME leaf part
///
/// Non-text parts carry an empty `text` but keep their content type so the
/// tokenizer can still emit content-type terms for them.
#[derive(Debug, Clone)]
pub struct BodyPart {
    /// Lowercased MIME type, e.g. `text/plain`
    pub content_type: String,
    /// Lowercased charset parameter, if one was declared
    pub charset: Option<String>,
    /// Decoded text for `text/*` parts, empty otherwise
    pub text: String,
}

impl BodyPart {
    /// Whether this part holds HTML markup
    pub fn is_html(&self) -> bool {
        self.content_type == "text/html"
    }
}

/// Parsed message: ordered headers, decoded body parts, content digest
///
/// Lifetime is one classification or training call.
#[derive(Debug, Clone)]
pub struct Message {
    headers: Vec<HeaderField>,
    body_parts: Vec<BodyPart>,
    raw_digest: MessageDigest,
}

impl Message {
    /// Parse raw message bytes
    ///
    /// Best-effort: transfer encodings (`7bit`, `8bit`, `quoted-printable`,
    /// `base64`) and charsets are decoded by `mailparse`, with invalid
    /// sequences replaced. Non-text parts become stub parts.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` only when no headers are found and the
    /// body is empty.
    pub fn parse(raw: &[u8]) -> ProbeResult<Self> {
        let (headers, body_parts) = match mailparse::parse_mail(raw) {
            Ok(parsed) => {
                let headers = to_fields(&parsed.headers);
                let mut parts = Vec::new();
                collect_parts(&parsed, &mut parts);
                (headers, parts)
            }
            // Headerless or damaged input: treat the whole input as one
            // plain-text body and let the tokenizer cope.
            Err(_) => (
                Vec::new(),
                vec![BodyPart {
                    content_type: "text/plain".to_owned(),
                    charset: None,
                    text: String::from_utf8_lossy(raw).into_owned(),
                }],
            ),
        };

        if headers.is_empty() && body_parts.iter().all(|p| p.text.trim().is_empty()) {
            return Err(ProbeError::malformed("no headers and empty body"));
        }

        Ok(Self {
            headers,
            body_parts,
            raw_digest: MessageDigest::of(raw),
        })
    }

    /// All headers in original order
    pub fn headers(&self) -> &[HeaderField] {
        &self.headers
    }

    /// First value of the named header, case-insensitive
    pub fn header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.header_values(name).next()
    }

    /// All values of the named header in order, case-insensitive
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Decoded body parts in MIME order
    pub fn body_parts(&self) -> &[BodyPart] {
        &self.body_parts
    }

    /// Content digest of the normalized raw bytes
    pub fn digest(&self) -> MessageDigest {
        self.raw_digest
    }
}

/// Convert mailparse headers into owned fields
fn to_fields(headers: &[MailHeader<'_>]) -> Vec<HeaderField> {
    headers
        .iter()
        .map(|h| HeaderField {
            name: h.get_key(),
            value: h.get_value(),
        })
        .collect()
}

/// Walk the MIME part tree depth-first, collecting leaves
///
/// Every `text/*` leaf is decoded to UTF-8 text; other leaves become stub
/// parts with their content type retained.
fn collect_parts(part: &ParsedMail<'_>, out: &mut Vec<BodyPart>) {
    if part.subparts.is_empty() {
        let content_type = part.ctype.mimetype.to_ascii_lowercase();
        let charset = match part.ctype.charset.trim() {
            "" => None,
            cs => Some(cs.to_ascii_lowercase()),
        };
        let text = if content_type.starts_with("text/") {
            part.get_body().unwrap_or_default()
        } else {
            String::new()
        };
        out.push(BodyPart {
            content_type,
            charset,
            text,
        });
        return;
    }
    for sub in &part.subparts {
        collect_parts(sub, out);
    }
}

/// Normalize raw bytes for digesting
///
/// CRLF becomes LF, trailing whitespace is stripped from every line, and
/// trailing blank lines are dropped, so the digest is stable across OS
/// line-ending and trailing-whitespace differences.
fn normalize_raw(raw: &[u8]) -> Vec<u8> {
    let mut lines: Vec<&[u8]> = raw
        .split(|&b| b == b'\n')
        .map(|line| {
            let end = line
                .iter()
                .rposition(|&b| b != b' ' && b != b'\t' && b != b'\r')
                .map_or(0, |i| i + 1);
            &line[..end]
        })
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join(&b'\n')
}

/// Whether raw bytes look like an mbox file
pub fn is_mbox(raw: &[u8]) -> bool {
    raw.starts_with(b"From ")
}

/// Split an mbox byte stream into individual messages
///
/// Lines beginning with `From ` at byte offset 0 delimit messages and are
/// not part of them; `>From ` escaping is reversed on parse.
pub fn split_mbox(raw: &[u8]) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;

    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b"From ") {
            if let Some(done) = current.take() {
                messages.push(done);
            }
            current = Some(Vec::new());
            continue;
        }
        let Some(buf) = current.as_mut() else {
            // Garbage before the first separator is not a message.
            continue;
        };
        if line.starts_with(b">From ") {
            buf.extend_from_slice(&line[1..]);
        } else {
            buf.extend_from_slice(line);
        }
    }
    if let Some(done) = current.take() {
        messages.push(done);
    }
    messages
}

/// Read every message behind a path
///
/// A directory is treated as a maildir-style layout (each regular file is
/// one message; `cur` and `new` subdirectories are honored, dotfiles are
/// skipped). A file starting with `From ` is split as mbox; any other file
/// is a single message.
///
/// # Errors
///
/// Returns `Io` when the path cannot be read.
pub fn read_messages(path: &Path) -> ProbeResult<Vec<Vec<u8>>> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        return read_maildir(path);
    }
    let raw = fs::read(path)?;
    if is_mbox(&raw) {
        Ok(split_mbox(&raw))
    } else {
        Ok(vec![raw])
    }
}

/// Read a maildir-style directory
fn read_maildir(dir: &Path) -> ProbeResult<Vec<Vec<u8>>> {
    let mut files: Vec<PathBuf> = Vec::new();
    collect_regular_files(dir, &mut files)?;
    for sub in ["cur", "new"] {
        let sub = dir.join(sub);
        if sub.is_dir() {
            collect_regular_files(&sub, &mut files)?;
        }
    }
    files.sort();

    let mut messages = Vec::with_capacity(files.len());
    for file in files {
        messages.push(fs::read(&file)?);
    }
    Ok(messages)
}

/// Collect non-hidden regular files directly inside `dir`, unsorted
fn collect_regular_files(dir: &Path, out: &mut Vec<PathBuf>) -> ProbeResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Message, MessageDigest, is_mbox, split_mbox};

    const SIMPLE: &[u8] = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\n\r\nHello there\r\n";

    #[test]
    fn parses_simple_plain_text_message() {
        let msg = Message::parse(SIMPLE).expect("parse should succeed");
        assert_eq!(msg.header("subject"), Some("Hi"));
        assert_eq!(msg.header("SUBJECT"), Some("Hi"));
        assert_eq!(msg.body_parts().len(), 1);
        assert_eq!(msg.body_parts()[0].text.trim(), "Hello there");
    }

    #[test]
    fn preserves_duplicate_headers_in_order() {
        let raw = b"Received: from a.example.com\r\nReceived: from b.example.com\r\nSubject: x\r\n\r\nbody\r\n";
        let msg = Message::parse(raw).expect("parse should succeed");
        let received: Vec<&str> = msg.header_values("received").collect();
        assert_eq!(received, vec!["from a.example.com", "from b.example.com"]);
    }

    #[test]
    fn walks_multipart_collecting_text_and_stub_parts() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: multipart/mixed; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain words\r\n",
            "--xyz\r\n",
            "Content-Type: image/png\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "aGVsbG8=\r\n",
            "--xyz--\r\n",
        )
        .as_bytes();
        let msg = Message::parse(raw).expect("parse should succeed");
        assert_eq!(msg.body_parts().len(), 2);
        assert_eq!(msg.body_parts()[0].content_type, "text/plain");
        assert_eq!(msg.body_parts()[0].charset.as_deref(), Some("utf-8"));
        assert_eq!(msg.body_parts()[0].text.trim(), "plain words");
        assert_eq!(msg.body_parts()[1].content_type, "image/png");
        assert!(msg.body_parts()[1].text.is_empty());
    }

    #[test]
    fn decodes_quoted_printable_bodies() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "caf=C3=A9 deal\r\n",
        )
        .as_bytes();
        let msg = Message::parse(raw).expect("parse should succeed");
        assert_eq!(msg.body_parts()[0].text.trim(), "café deal");
    }

    #[test]
    fn rejects_empty_input_only() {
        assert!(Message::parse(b"").is_err());
        assert!(Message::parse(b"not a header\njust text\n").is_ok());
    }

    #[test]
    fn digest_is_stable_across_line_endings_and_trailing_space() {
        let unix = MessageDigest::of(b"Subject: x\nBody line\n");
        let dos = MessageDigest::of(b"Subject: x\r\nBody line\r\n");
        let padded = MessageDigest::of(b"Subject: x  \nBody line\t\n\n");
        let no_final_newline = MessageDigest::of(b"Subject: x\nBody line");
        assert_eq!(unix, dos);
        assert_eq!(unix, padded);
        assert_eq!(unix, no_final_newline);

        let changed = MessageDigest::of(b"Subject: y\nBody line\n");
        assert_ne!(unix, changed);
    }

    #[test]
    fn digest_hex_round_trips() {
        let digest = MessageDigest::of(b"Subject: x\n\nhello\n");
        let parsed = MessageDigest::from_hex(&digest.to_hex()).expect("hex round-trip");
        assert_eq!(digest, parsed);
        assert!(MessageDigest::from_hex("abc123").is_err());
    }

    mod properties {
        use proptest::prelude::*;

        use crate::message::MessageDigest;

        proptest! {
            #[test]
            fn digest_ignores_line_endings_and_trailing_whitespace(
                lines in prop::collection::vec("[a-zA-Z0-9 .:]{0,30}", 1..10),
                crlf in any::<bool>(),
                pad in 0_usize..3,
            ) {
                let plain: String = lines
                    .iter()
                    .map(|line| format!("{}\n", line.trim_end()))
                    .collect();
                let ending = if crlf { "\r\n" } else { "\n" };
                let mangled: String = lines
                    .iter()
                    .map(|line| format!("{}{}{ending}", line.trim_end(), " ".repeat(pad)))
                    .collect();
                prop_assert_eq!(
                    MessageDigest::of(plain.as_bytes()),
                    MessageDigest::of(mangled.as_bytes())
                );
            }
        }
    }

    #[test]
    fn splits_mbox_and_reverses_from_escaping() {
        let mbox = concat!(
            "From alice Mon Jan  1 00:00:00 2026\n",
            "From: alice@example.com\n",
            "Subject: one\n",
            "\n",
            ">From the beginning\n",
            "From bob Mon Jan  1 00:01:00 2026\n",
            "From: bob@example.com\n",
            "Subject: two\n",
            "\n",
            "second body\n",
        )
        .as_bytes();
        assert!(is_mbox(mbox));
        let messages = split_mbox(mbox);
        assert_eq!(messages.len(), 2);
        let first = String::from_utf8(messages[0].clone()).expect("utf8");
        assert!(first.contains("Subject: one"));
        assert!(first.contains("\nFrom the beginning\n"));
        let second = String::from_utf8(messages[1].clone()).expect("utf8");
        assert!(second.contains("Subject: two"));
    }
}
