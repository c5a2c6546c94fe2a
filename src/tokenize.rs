//! Message tokenization
//!
//! Turns a parsed [`Message`] into an ordered, finite, non-restartable
//! stream of prefixed terms: the unit of evidence for the scorer. Header
//! tokens come first, then body tokens in reading order so phrase windows
//! are deterministic. Each emission counts once per message; the scorer
//! collapses duplicates.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::config::ProbeConfig;
use crate::message::{BodyPart, Message};

/// Maximum byte length of a full `prefix/lexeme` term
pub const MAX_TERM_BYTES: usize = 90;

/// Sentinel lexeme substituted for runs of non-ASCII bytes
pub const NON_ASCII_LEXEME: &str = "nonascii";

/// Address headers split into local part and host labels
const ADDRESS_HEADERS: [(&str, &str); 4] = [
    ("from", "h.from"),
    ("to", "h.to"),
    ("cc", "h.cc"),
    ("reply-to", "h.replyto"),
];

/// Bounded whitelist of other headers worth tokenizing
const HEADER_WHITELIST: [&str; 8] = [
    "x-mailer",
    "user-agent",
    "list-id",
    "precedence",
    "x-priority",
    "organization",
    "sender",
    "errors-to",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("static regex"));

static BODY_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w$%€£']+(?:[.\-][\w$%€£']+)*").expect("static regex")
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"'()\[\]]+"#).expect("static regex"));

static BRACKET_IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,3}(?:\.\d{1,3}){3})\]").expect("static regex"));

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9][A-Za-z0-9-]*(?:\.[A-Za-z0-9][A-Za-z0-9-]*)+").expect("static regex")
});

static HTML_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));

static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*/?\s*([a-z][a-z0-9]*)[^>]*>").expect("static regex"));

static ATTR_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:href|src)\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("static regex")
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6}|[A-Za-z]{1,10});").expect("static regex")
});

/// A prefixed, normalized term: the unit of evidence
///
/// Stored as the full `prefix/lexeme` string, at most [`MAX_TERM_BYTES`]
/// bytes. Construction filters out empty lexemes and oversized terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term(String);

impl Term {
    /// Build a term from a provenance prefix and a lexeme
    ///
    /// Returns `None` for empty lexemes and for terms whose full rendering
    /// exceeds [`MAX_TERM_BYTES`].
    pub fn new(prefix: &str, lexeme: &str) -> Option<Self> {
        if lexeme.is_empty() || prefix.len() + 1 + lexeme.len() > MAX_TERM_BYTES {
            return None;
        }
        Some(Self(format!("{prefix}/{lexeme}")))
    }

    /// The full `prefix/lexeme` rendering
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the underlying string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finite, non-restartable stream of terms from one message
///
/// Consumers needing a second pass must materialize into a buffer.
#[derive(Debug)]
pub struct TokenStream {
    inner: std::vec::IntoIter<Term>,
}

impl Iterator for TokenStream {
    type Item = Term;

    fn next(&mut self) -> Option<Term> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Tokenize one message under the given configuration
pub fn tokenize(message: &Message, config: &ProbeConfig) -> TokenStream {
    let mut emitter = Emitter {
        config,
        out: Vec::new(),
    };
    emitter.headers(message);
    if !config.ignore_body {
        for part in message.body_parts() {
            emitter.body_part(part);
        }
    }
    TokenStream {
        inner: emitter.out.into_iter(),
    }
}

/// Accumulates terms while applying the shared filters
struct Emitter<'a> {
    config: &'a ProbeConfig,
    out: Vec<Term>,
}

impl Emitter<'_> {
    fn emit(&mut self, prefix: &str, lexeme: &str) {
        if let Some(term) = Term::new(prefix, lexeme) {
            self.out.push(term);
        }
    }

    /// Collapse runs of non-ASCII characters to the sentinel lexeme
    fn fold<'s>(&self, value: &'s str) -> Cow<'s, str> {
        if !self.config.replace_non_ascii || value.is_ascii() {
            return Cow::Borrowed(value);
        }
        let mut out = String::with_capacity(value.len());
        let mut in_run = false;
        for ch in value.chars() {
            if ch.is_ascii() {
                out.push(ch);
                in_run = false;
            } else if !in_run {
                out.push(' ');
                out.push_str(NON_ASCII_LEXEME);
                out.push(' ');
                in_run = true;
            }
        }
        Cow::Owned(out)
    }

    /// Emit one token per `\w+` run in a header value
    fn emit_words(&mut self, prefix: &str, value: &str, lowercase: bool) {
        let value = self.fold(value);
        for word in WORD_RE.find_iter(&value) {
            if lowercase {
                self.emit(prefix, &word.as_str().to_lowercase());
            } else {
                self.emit(prefix, word.as_str());
            }
        }
    }

    /// Header pass: dispatch each header field by name, order preserved
    fn headers(&mut self, message: &Message) {
        for field in message.headers() {
            let name = field.name.to_ascii_lowercase();
            match name.as_str() {
                "subject" => self.emit_words("h.subj", &field.value, false),
                "received" => self.received(&field.value),
                "content-type" => self.content_type_value(&field.value),
                "message-id" => self.message_id(&field.value),
                _ => {
                    if let Some((_, prefix)) =
                        ADDRESS_HEADERS.iter().find(|(h, _)| *h == name.as_str())
                    {
                        self.addresses(prefix, &field.value);
                    } else if HEADER_WHITELIST.contains(&name.as_str()) {
                        let prefix = format!("h.{name}");
                        self.emit_words(&prefix, &field.value, true);
                    }
                }
            }
        }
        // Content types of the decoded parts count as header evidence too,
        // so stub attachments still contribute their type.
        for part in message.body_parts() {
            self.emit("h.ctype", &part.content_type);
            if let Some(charset) = &part.charset {
                self.emit("h.ctype", charset);
            }
        }
    }

    /// Split an address header into local parts and dotted host labels
    fn addresses(&mut self, prefix: &str, value: &str) {
        let host_prefix = format!("{prefix}.host");
        let value = self.fold(value);
        let addrs: Vec<String> = match mailparse::addrparse(&value) {
            Ok(list) => list
                .iter()
                .flat_map(|addr| match addr {
                    mailparse::MailAddr::Single(info) => vec![info.addr.clone()],
                    mailparse::MailAddr::Group(group) => {
                        group.addrs.iter().map(|a| a.addr.clone()).collect()
                    }
                })
                .collect(),
            // Damaged address lists still usually contain a recognizable
            // local@host somewhere.
            Err(_) => HOST_RE
                .find_iter(&value)
                .map(|m| m.as_str().to_owned())
                .collect(),
        };
        for addr in addrs {
            let addr = addr.trim().to_lowercase();
            match addr.split_once('@') {
                Some((local, host)) => {
                    self.emit(prefix, local);
                    self.host_labels(&host_prefix, host);
                }
                None => self.host_labels(&host_prefix, &addr),
            }
        }
    }

    /// Emit a host whole plus each dotted label
    fn host_labels(&mut self, prefix: &str, host: &str) {
        let host = host.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if host.is_empty() {
            return;
        }
        self.emit(prefix, host);
        if host.contains('.') {
            for label in host.split('.').filter(|l| !l.is_empty()) {
                self.emit(prefix, label);
            }
        }
    }

    /// Received chain: hostnames plus bracketed IP literals
    fn received(&mut self, value: &str) {
        let value = self.fold(value);
        for caps in BRACKET_IP_RE.captures_iter(&value) {
            let ip = &caps[1];
            self.emit("h.rcvd", ip);
            let octets: Vec<&str> = ip.split('.').take(3).collect();
            self.emit("h.rcvd.ip24", &octets.join("."));
        }
        let without_ips = BRACKET_IP_RE.replace_all(&value, " ");
        for host in HOST_RE.find_iter(&without_ips) {
            self.emit("h.rcvd", &host.as_str().to_lowercase());
        }
    }

    /// Content-Type header: the media type and any charset parameter
    fn content_type_value(&mut self, value: &str) {
        let value = value.to_ascii_lowercase();
        let mut pieces = value.split(';');
        if let Some(mime) = pieces.next() {
            self.emit("h.ctype", mime.trim());
        }
        for param in pieces {
            if let Some(charset) = param.trim().strip_prefix("charset=") {
                self.emit("h.ctype", charset.trim_matches('"'));
            }
        }
    }

    /// Message-ID: only the host part carries signal
    fn message_id(&mut self, value: &str) {
        if let Some((_, host)) = value.split_once('@') {
            let host = host.trim_end_matches('>').trim();
            self.host_labels("h.message-id", &host.to_lowercase());
        }
    }

    /// Body pass for one MIME part: tags, URLs, words, phrases
    ///
    /// Phrase windows never cross part boundaries.
    fn body_part(&mut self, part: &BodyPart) {
        if part.text.is_empty() {
            return;
        }
        let text = if part.is_html() {
            let stripped = HTML_COMMENT_RE.replace_all(&part.text, " ");
            for caps in HTML_TAG_RE.captures_iter(&stripped) {
                self.emit("html.tag", &caps[1].to_lowercase());
            }
            for caps in ATTR_URL_RE.captures_iter(&stripped) {
                let target = caps[1].trim_matches(['"', '\'']).to_owned();
                self.url(&target);
            }
            let text = HTML_TAG_RE.replace_all(&stripped, " ").into_owned();
            decode_entities(&text)
        } else {
            part.text.clone()
        };

        for url in URL_RE.find_iter(&text) {
            self.url(url.as_str());
        }
        // URLs already produced their own tokens; drop them from the prose.
        let text = URL_RE.replace_all(&text, " ");
        let text = self.fold(&text);

        let mut part_words: Vec<String> = Vec::new();
        for word in BODY_WORD_RE.find_iter(&text) {
            let word = word.as_str();
            if !keep_body_word(word) {
                continue;
            }
            let word = word.to_lowercase();
            self.emit("body", &word);
            part_words.push(word);
        }

        let window = self.config.phrase_length;
        if window >= 2 && part_words.len() >= window {
            for chunk in part_words.windows(window) {
                self.emit("phrase", &chunk.join("_"));
            }
        }
    }

    /// URL: host (whole, lowercased) and the first path segment
    fn url(&mut self, url: &str) {
        let url = url.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '>']);
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => rest,
            Some(_) => return,
            None => return,
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host).to_lowercase();
        if !host.is_empty() {
            self.emit("url.host", &host);
        }
        if let Some(path) = path {
            let first = path
                .split(['/', '?', '#'])
                .find(|segment| !segment.is_empty());
            if let Some(segment) = first {
                self.emit("url.path", &segment.to_lowercase());
            }
        }
    }
}

/// Body word filter: at least two letters, or a money/percent signal
fn keep_body_word(word: &str) -> bool {
    let letters = word.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 2 || word.chars().any(|c| matches!(c, '$' | '%' | '€' | '£'))
}

/// Resolve HTML entities, named and numeric
///
/// Unknown named entities are left alone; out-of-range numeric references
/// vanish.
fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &Captures<'_>| -> String {
            let entity = &caps[1];
            if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                return u32::from_str_radix(hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_default();
            }
            if let Some(dec) = entity.strip_prefix('#') {
                return dec
                    .parse::<u32>()
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_default();
            }
            match entity.to_ascii_lowercase().as_str() {
                "amp" => "&".to_owned(),
                "lt" => "<".to_owned(),
                "gt" => ">".to_owned(),
                "quot" => "\"".to_owned(),
                "apos" => "'".to_owned(),
                "nbsp" => " ".to_owned(),
                _ => caps[0].to_owned(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::{Term, tokenize};
    use crate::config::ProbeConfig;
    use crate::message::Message;

    fn terms_of(raw: &[u8], config: &ProbeConfig) -> Vec<String> {
        let message = Message::parse(raw).expect("parse should succeed");
        tokenize(&message, config)
            .map(|t| t.into_string())
            .collect()
    }

    #[test]
    fn subject_words_preserve_case() {
        let terms = terms_of(
            b"Subject: FREE Money now\r\n\r\nbody text\r\n",
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"h.subj/FREE".to_owned()));
        assert!(terms.contains(&"h.subj/Money".to_owned()));
        assert!(terms.contains(&"h.subj/now".to_owned()));
    }

    #[test]
    fn addresses_split_into_local_part_and_host_labels() {
        let terms = terms_of(
            b"From: Alice Smith <alice@mail.example.com>\r\n\r\nhello world\r\n",
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"h.from/alice".to_owned()));
        assert!(terms.contains(&"h.from.host/mail.example.com".to_owned()));
        assert!(terms.contains(&"h.from.host/mail".to_owned()));
        assert!(terms.contains(&"h.from.host/example".to_owned()));
        assert!(terms.contains(&"h.from.host/com".to_owned()));
    }

    #[test]
    fn received_chain_emits_hosts_and_ip_prefixes() {
        let raw = concat!(
            "Received: from relay.spam.example ([203.0.113.7]) by mx.example.com\r\n",
            "Subject: x\r\n",
            "\r\n",
            "body words\r\n",
        )
        .as_bytes();
        let terms = terms_of(raw, &ProbeConfig::default());
        assert!(terms.contains(&"h.rcvd/relay.spam.example".to_owned()));
        assert!(terms.contains(&"h.rcvd/mx.example.com".to_owned()));
        assert!(terms.contains(&"h.rcvd/203.0.113.7".to_owned()));
        assert!(terms.contains(&"h.rcvd.ip24/203.0.113".to_owned()));
    }

    #[test]
    fn body_words_keep_currency_and_filter_short_words() {
        let terms = terms_of(
            b"Subject: x\r\n\r\nWin $99 now at 100% off, I am in\r\n",
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"body/win".to_owned()));
        assert!(terms.contains(&"body/$99".to_owned()));
        assert!(terms.contains(&"body/100%".to_owned()));
        assert!(terms.contains(&"body/now".to_owned()));
        // "I" and "am" and "in" have fewer than two letters or are kept:
        // "am" and "in" have exactly two letters and stay; "I" is dropped.
        assert!(terms.contains(&"body/am".to_owned()));
        assert!(!terms.contains(&"body/i".to_owned()));
    }

    #[test]
    fn phrases_slide_by_one_and_stay_inside_parts() {
        let terms = terms_of(
            b"Subject: x\r\n\r\none two three\r\n",
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"phrase/one_two".to_owned()));
        assert!(terms.contains(&"phrase/two_three".to_owned()));
        assert!(!terms.contains(&"phrase/three_one".to_owned()));
    }

    #[test]
    fn html_parts_emit_tags_urls_and_entity_decoded_words() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><a href=\"http://click.example.net/offer/x?id=1\">Click&nbsp;here</a>",
            "<!-- hidden --> Save &amp; win</body></html>\r\n",
        )
        .as_bytes();
        let terms = terms_of(raw, &ProbeConfig::default());
        assert!(terms.contains(&"html.tag/html".to_owned()));
        assert!(terms.contains(&"html.tag/a".to_owned()));
        assert!(terms.contains(&"url.host/click.example.net".to_owned()));
        assert!(terms.contains(&"url.path/offer".to_owned()));
        assert!(terms.contains(&"body/click".to_owned()));
        assert!(terms.contains(&"body/here".to_owned()));
        assert!(terms.contains(&"body/save".to_owned()));
        assert!(terms.contains(&"body/win".to_owned()));
        assert!(!terms.contains(&"body/hidden".to_owned()));
        assert!(!terms.contains(&"body/href".to_owned()));
    }

    #[test]
    fn urls_in_plain_text_yield_host_and_first_path_segment() {
        let terms = terms_of(
            b"Subject: x\r\n\r\nvisit https://WWW.Example.COM/buy/now today.\r\n",
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"url.host/www.example.com".to_owned()));
        assert!(terms.contains(&"url.path/buy".to_owned()));
        assert!(terms.contains(&"body/visit".to_owned()));
        assert!(terms.contains(&"body/today".to_owned()));
    }

    #[test]
    fn ignore_body_suppresses_body_derived_tokens() {
        let mut config = ProbeConfig::default();
        config.ignore_body = true;
        let raw = concat!(
            "Subject: Offer\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<b>big deal</b> http://x.example.org/a\r\n",
        )
        .as_bytes();
        let terms = terms_of(raw, &config);
        assert!(terms.contains(&"h.subj/Offer".to_owned()));
        assert!(terms.contains(&"h.ctype/text/html".to_owned()));
        assert!(!terms.iter().any(|t| t.starts_with("body/")));
        assert!(!terms.iter().any(|t| t.starts_with("html.")));
        assert!(!terms.iter().any(|t| t.starts_with("url.")));
        assert!(!terms.iter().any(|t| t.starts_with("phrase/")));
    }

    #[test]
    fn non_ascii_runs_collapse_to_sentinel() {
        let terms = terms_of(
            "Subject: gros bisous\r\n\r\nhôtel économique\r\n".as_bytes(),
            &ProbeConfig::default(),
        );
        assert!(terms.contains(&"body/nonascii".to_owned()));
        // The ASCII remnants around the runs still tokenize.
        assert!(terms.contains(&"body/conomique".to_owned()));
    }

    #[test]
    fn non_ascii_words_survive_when_replacement_is_off() {
        let mut config = ProbeConfig::default();
        config.replace_non_ascii = false;
        let terms = terms_of(
            "Subject: x\r\n\r\nhôtel économique\r\n".as_bytes(),
            &config,
        );
        assert!(terms.contains(&"body/hôtel".to_owned()));
        assert!(terms.contains(&"body/économique".to_owned()));
    }

    #[test]
    fn oversized_and_empty_terms_are_discarded() {
        assert!(Term::new("body", "").is_none());
        let long = "x".repeat(90);
        assert!(Term::new("body", &long).is_none());
        let fits = "x".repeat(85);
        assert!(Term::new("body", &fits).is_some());
    }

    #[test]
    fn header_tokens_precede_body_tokens() {
        let terms = terms_of(
            b"Subject: greetings\r\n\r\nearthling visitor\r\n",
            &ProbeConfig::default(),
        );
        let subj = terms
            .iter()
            .position(|t| t == "h.subj/greetings")
            .expect("subject token present");
        let body = terms
            .iter()
            .position(|t| t == "body/earthling")
            .expect("body token present");
        assert!(subj < body);
    }
}
