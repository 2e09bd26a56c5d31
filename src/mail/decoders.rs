//! Message Decoder: header words, sender, date and body text of one raw
//! message, normalized to UTF-8.
//!
//! Charset guessing is a heuristic. The first probe that decodes without
//! error wins, which is not a guarantee the text is what the sender meant.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;
use log::debug;
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::domain::email::{DecodeField, DecodeWarning, DecodedMessage, MessageRecord, RawMessage};
use crate::error::{ExportError, Result};

pub const DEFAULT_PROBES: &[&str] = &["utf-8", "gb18030", "windows-1252"];

const HTML_WRAP_WIDTH: usize = 1000;

/// Encoded words are frequently sent without their trailing `=` padding.
const WORD_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One step of the fallback list: attempt a decode, report success or failure.
pub trait CharsetProbe: Send + Sync {
    fn label(&self) -> &str;
    fn try_decode(&self, bytes: &[u8]) -> Option<String>;
}

/// Probe backed by an `encoding_rs` encoding. Never substitutes U+FFFD.
pub struct EncodingProbe {
    encoding: &'static Encoding,
}

impl EncodingProbe {
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(|encoding| Self { encoding })
    }
}

impl CharsetProbe for EncodingProbe {
    fn label(&self) -> &str {
        self.encoding.name()
    }

    fn try_decode(&self, bytes: &[u8]) -> Option<String> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|s| s.into_owned())
    }
}

/// Ordered list of probes tried for undeclared or broken charsets.
pub struct ProbeList {
    probes: Vec<Box<dyn CharsetProbe>>,
}

impl Default for ProbeList {
    fn default() -> Self {
        Self {
            probes: DEFAULT_PROBES
                .iter()
                .filter_map(|l| EncodingProbe::for_label(l))
                .map(|p| Box::new(p) as Box<dyn CharsetProbe>)
                .collect(),
        }
    }
}

impl ProbeList {
    pub fn new(probes: Vec<Box<dyn CharsetProbe>>) -> Self {
        Self { probes }
    }

    /// Builds the list from charset labels, rejecting labels nobody knows.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let mut probes: Vec<Box<dyn CharsetProbe>> = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            let probe = EncodingProbe::for_label(label).ok_or_else(|| {
                ExportError::InvalidConfig(format!("unknown charset '{label}' in probe list"))
            })?;
            probes.push(Box::new(probe));
        }
        if probes.is_empty() {
            return Err(ExportError::InvalidConfig("charset probe list is empty".into()));
        }
        Ok(Self { probes })
    }

    pub fn labels(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.label()).collect()
    }

    /// First probe that accepts `bytes`, with its label.
    pub fn probe(&self, bytes: &[u8]) -> Option<(String, &str)> {
        self.probes
            .iter()
            .find_map(|p| p.try_decode(bytes).map(|s| (s, p.label())))
    }

    /// Probes, then falls back to lossy UTF-8. The flag is false when no
    /// probe accepted the input.
    pub fn decode(&self, bytes: &[u8]) -> (String, bool) {
        match self.probe(bytes) {
            Some((s, _)) => (s, true),
            None => (String::from_utf8_lossy(bytes).into_owned(), false),
        }
    }

    /// Decodes with a declared charset, using the probes when the label is
    /// unknown or the bytes are invalid under it.
    pub fn decode_declared(&self, label: Option<&str>, bytes: &[u8]) -> (String, bool) {
        // A part labelled ASCII that carries 8-bit bytes is mislabelled.
        let mislabelled_ascii = label.is_some_and(|l| {
            matches!(l.trim().to_ascii_lowercase().as_str(), "us-ascii" | "ascii")
        }) && !bytes.is_ascii();
        if let Some(label) = label
            && !mislabelled_ascii
            && let Some(probe) = EncodingProbe::for_label(label)
        {
            if let Some(s) = probe.try_decode(bytes) {
                return (s, true);
            }
            debug!("bytes are not valid {label}; probing");
        }
        self.decode(bytes)
    }
}

/// Decodes RFC 2047 encoded words in a raw header value. Bytes outside
/// encoded words go through the probe list. The flag is false when some
/// part could only be decoded lossily.
pub fn decode_header_value(raw: &[u8], probes: &ProbeList) -> (String, bool) {
    let raw = unfold(raw);
    let mut out = String::new();
    let mut clean = true;
    // Adjacent words in one charset may split a multibyte character.
    let mut pending: Option<(String, Vec<u8>)> = None;
    let mut rest: &[u8] = &raw;

    let flush = |pending: &mut Option<(String, Vec<u8>)>, out: &mut String, clean: &mut bool| {
        if let Some((charset, bytes)) = pending.take() {
            let (s, ok) = probes.decode_declared(Some(&charset), &bytes);
            *clean &= ok;
            out.push_str(&s);
        }
    };

    while !rest.is_empty() {
        let Some(start) = find(rest, b"=?") else {
            break;
        };
        let Some((charset, payload, len)) = parse_encoded_word(&rest[start..]) else {
            // Not a well-formed word; keep "=?" as text and move on.
            flush(&mut pending, &mut out, &mut clean);
            let (s, ok) = probes.decode(&rest[..start + 2]);
            clean &= ok;
            out.push_str(&s);
            rest = &rest[start + 2..];
            continue;
        };

        let gap = &rest[..start];
        let gap_is_space = gap.iter().all(|b| *b == b' ' || *b == b'\t');
        if !(gap_is_space && pending.is_some()) {
            flush(&mut pending, &mut out, &mut clean);
            let (s, ok) = probes.decode(gap);
            clean &= ok;
            out.push_str(&s);
        }

        let same_charset = matches!(&pending, Some((c, _)) if c.eq_ignore_ascii_case(&charset));
        if same_charset {
            if let Some((_, bytes)) = pending.as_mut() {
                bytes.extend(payload);
            }
        } else {
            flush(&mut pending, &mut out, &mut clean);
            pending = Some((charset, payload));
        }
        rest = &rest[start + len..];
    }

    flush(&mut pending, &mut out, &mut clean);
    let (s, ok) = probes.decode(rest);
    out.push_str(&s);
    (out.trim().to_string(), clean && ok)
}

fn unfold(raw: &[u8]) -> Vec<u8> {
    raw.iter().copied().filter(|b| *b != b'\r' && *b != b'\n').collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses `=?charset?enc?text?=` at the start of `input`; returns the
/// charset, decoded payload bytes and the word length.
fn parse_encoded_word(input: &[u8]) -> Option<(String, Vec<u8>, usize)> {
    let inner = input.strip_prefix(b"=?")?;
    let q1 = inner.iter().position(|b| *b == b'?')?;
    let charset = std::str::from_utf8(&inner[..q1]).ok()?;
    // RFC 2231 language suffix: charset*lang
    let charset = charset.split('*').next().unwrap_or(charset);
    if charset.is_empty() {
        return None;
    }

    let after_charset = &inner[q1 + 1..];
    let (&enc, after_enc) = after_charset.split_first()?;
    let after_enc = after_enc.strip_prefix(b"?")?;
    let end = find(after_enc, b"?=")?;
    let text = &after_enc[..end];
    if text.iter().any(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let payload = match enc.to_ascii_uppercase() {
        b'B' => WORD_B64.decode(text).ok()?,
        b'Q' => decode_q(text),
        _ => return None,
    };
    let len = 2 + q1 + 1 + 2 + end + 2;
    Some((charset.to_string(), payload, len))
}

fn decode_q(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        match text[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < text.len() => {
                let hex = std::str::from_utf8(&text[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// `Name <addr>` when a display name exists, the bare address otherwise.
pub fn render_sender(decoded: &str, probes: &ProbeList) -> Option<String> {
    let list = mailparse::addrparse(decoded).ok()?;
    let first = list.iter().next()?;
    let single = match first {
        MailAddr::Single(info) => info.clone(),
        MailAddr::Group(group) => group.addrs.first()?.clone(),
    };
    let name = single
        .display_name
        .map(|n| decode_header_value(n.as_bytes(), probes).0)
        .map(|n| n.trim_matches('"').trim().to_string())
        .filter(|n| !n.is_empty());
    let addr = single.addr.trim().to_string();
    match (name, addr.is_empty()) {
        (Some(name), false) => Some(format!("{name} <{addr}>")),
        (Some(name), true) => Some(name),
        (None, false) => Some(addr),
        (None, true) => None,
    }
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    mailparse::dateparse(value)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

/// Depth-first search for the first non-attachment part of type `mime`.
fn find_part<'a, 'b>(part: &'b ParsedMail<'a>, mime: &str) -> Option<&'b ParsedMail<'a>> {
    if is_attachment(part) {
        return None;
    }
    if part.subparts.is_empty() {
        return part
            .ctype
            .mimetype
            .eq_ignore_ascii_case(mime)
            .then_some(part);
    }
    part.subparts.iter().find_map(|sp| find_part(sp, mime))
}

/// Fallback when html2text cannot render the document.
fn strip_html_minimal(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn normalize_body(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Turns raw FETCH results into records. Never fails: problems become
/// placeholder fields plus warnings.
pub struct MessageDecoder {
    probes: ProbeList,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(ProbeList::default())
    }
}

impl MessageDecoder {
    pub fn new(probes: ProbeList) -> Self {
        Self { probes }
    }

    pub fn probes(&self) -> &ProbeList {
        &self.probes
    }

    pub fn decode(&self, raw: &RawMessage) -> DecodedMessage {
        let mut record = MessageRecord::placeholder(raw.uid);
        let mut warnings = Vec::new();
        let mut warn = |field: DecodeField, detail: String| {
            warnings.push(DecodeWarning {
                uid: raw.uid,
                field,
                detail,
            });
        };

        let Some(bytes) = raw.body.as_deref() else {
            record.received_at = raw.internal_date;
            warn(DecodeField::Message, "server returned no message data".into());
            return DecodedMessage { record, warnings };
        };

        let parsed = match mailparse::parse_mail(bytes) {
            Ok(p) => p,
            Err(e) => {
                record.received_at = raw.internal_date;
                warn(DecodeField::Message, format!("unparseable message: {e}"));
                return DecodedMessage { record, warnings };
            }
        };

        // Date
        let date_header = parsed.headers.get_first_value("Date");
        match date_header.as_deref().and_then(parse_date) {
            Some(dt) => record.received_at = Some(dt),
            None => {
                record.received_at = raw.internal_date;
                let detail = match (&date_header, raw.internal_date.is_some()) {
                    (Some(d), true) => format!("unparseable Date '{d}'; using INTERNALDATE"),
                    (None, true) => "no Date header; using INTERNALDATE".to_string(),
                    (_, false) => "no usable date".to_string(),
                };
                warn(DecodeField::Date, detail);
            }
        }

        // Subject
        if let Some(h) = parsed.headers.get_first_header("Subject") {
            let (subject, clean) = decode_header_value(h.get_value_raw(), &self.probes);
            if !clean {
                warn(DecodeField::Subject, "subject decoded lossily".into());
            }
            if !subject.is_empty() {
                record.subject = subject;
            }
        }

        // Sender
        match parsed.headers.get_first_header("From") {
            Some(h) => {
                let (text, _) = self.probes.decode(&unfold(h.get_value_raw()));
                match render_sender(&text, &self.probes) {
                    Some(sender) => record.sender = sender,
                    None => {
                        let (fallback, _) = decode_header_value(h.get_value_raw(), &self.probes);
                        if !fallback.is_empty() {
                            record.sender = fallback;
                        }
                        warn(DecodeField::Sender, format!("unparseable From '{}'", text.trim()));
                    }
                }
            }
            None => warn(DecodeField::Sender, "no From header".into()),
        }

        // Body
        match self.body_text(&parsed) {
            Ok(Some((text, clean))) => {
                if !clean {
                    warn(DecodeField::Body, "body decoded lossily".into());
                }
                record.body_text = text;
            }
            Ok(None) => debug!("UID {}: no text part", raw.uid),
            Err(detail) => warn(DecodeField::Body, detail),
        }

        DecodedMessage { record, warnings }
    }

    /// Plain text preferred, then visible text of the HTML part. The flag
    /// is false when the text could only be decoded lossily.
    fn body_text(
        &self,
        parsed: &ParsedMail<'_>,
    ) -> std::result::Result<Option<(String, bool)>, String> {
        if let Some(part) = find_part(parsed, "text/plain") {
            let (text, clean) = self.part_text(part)?;
            return Ok(Some((normalize_body(&text), clean)));
        }

        if let Some(part) = find_part(parsed, "text/html") {
            let (html, clean) = self.part_text(part)?;
            let text = html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH)
                .unwrap_or_else(|_| strip_html_minimal(&html));
            return Ok(Some((normalize_body(&text), clean)));
        }

        Ok(None)
    }

    fn part_text(&self, part: &ParsedMail<'_>) -> std::result::Result<(String, bool), String> {
        let bytes = part
            .get_body_raw()
            .map_err(|e| format!("cannot decode transfer encoding: {e}"))?;
        let declared = part.ctype.params.get("charset").map(String::as_str);
        Ok(self.probes.decode_declared(declared, &bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(uid: u32, bytes: &[u8]) -> RawMessage {
        RawMessage {
            uid,
            body: Some(bytes.to_vec()),
            internal_date: None,
        }
    }

    #[test]
    fn declared_charset_header() {
        let probes = ProbeList::default();
        let (s, clean) = decode_header_value(b"=?UTF-8?B?5rWL6K+V?=", &probes);
        assert_eq!(s, "测试");
        assert!(clean);

        let (s, _) = decode_header_value(b"=?iso-8859-1?Q?Caf=E9_au_lait?=", &probes);
        assert_eq!(s, "Café au lait");
    }

    #[test]
    fn gbk_word_split_across_encoded_words() {
        // "你好" in GBK is C4 E3 BA C3; split after the third byte.
        let probes = ProbeList::default();
        let (s, clean) = decode_header_value(b"=?GBK?Q?=C4=E3=BA?= =?GBK?Q?=C3?=", &probes);
        assert_eq!(s, "你好");
        assert!(clean);
    }

    #[test]
    fn undeclared_bytes_fall_back_to_probe() {
        // "中文" in GB18030, not valid UTF-8.
        let probes = ProbeList::default();
        let (s, clean) = decode_header_value(&[0xD6, 0xD0, 0xCE, 0xC4], &probes);
        assert_eq!(s, "中文");
        assert!(clean);
        assert_eq!(probes.probe(&[0xD6, 0xD0, 0xCE, 0xC4]).unwrap().1, "gb18030");
    }

    #[test]
    fn unknown_declared_charset_uses_probes() {
        let probes = ProbeList::default();
        let (s, _) = decode_header_value(b"=?x-unknown?Q?plain?=", &probes);
        assert_eq!(s, "plain");
    }

    #[test]
    fn mixed_text_and_words() {
        let probes = ProbeList::default();
        let (s, _) = decode_header_value(b"Re: =?UTF-8?Q?h=C3=A9llo?= world", &probes);
        assert_eq!(s, "Re: héllo world");
    }

    #[test]
    fn malformed_word_kept_as_text() {
        let probes = ProbeList::default();
        let (s, _) = decode_header_value(b"price =?broken", &probes);
        assert_eq!(s, "price =?broken");
    }

    #[test]
    fn probe_list_rejects_unknown_labels() {
        assert!(ProbeList::from_labels(&["utf-8", "no-such-charset"]).is_err());
        let list = ProbeList::from_labels(&["latin1"]).unwrap();
        assert_eq!(list.labels(), vec!["windows-1252"]);
    }

    #[test]
    fn decodes_simple_message() {
        let msg = b"From: =?UTF-8?B?5byg5LiJ?= <zhang@example.com>\r\n\
Subject: Hello\r\n\
Date: Tue, 06 Feb 2024 09:30:00 +0800\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Body line\r\n";
        let decoded = MessageDecoder::default().decode(&raw(7, msg));
        assert!(!decoded.has_warnings(), "{:?}", decoded.warnings);
        let r = decoded.record;
        assert_eq!(r.sender, "张三 <zhang@example.com>");
        assert_eq!(r.subject, "Hello");
        assert_eq!(r.body_text, "Body line");
        assert_eq!(r.timestamp(), "2024-02-06 01:30:00");
    }

    #[test]
    fn bare_address_sender() {
        let msg = b"From: bob@example.com\r\nSubject: x\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\nhi";
        let r = MessageDecoder::default().decode(&raw(1, msg)).record;
        assert_eq!(r.sender, "bob@example.com");
    }

    #[test]
    fn prefers_plain_over_html_and_skips_attachments() {
        let msg = b"From: a@example.com\r\n\
Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
attached notes\r\n\
--b1\r\n\
Content-Type: multipart/alternative; boundary=\"b2\"\r\n\
\r\n\
--b2\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html version</p>\r\n\
--b2\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain version\r\n\
--b2--\r\n\
--b1--\r\n";
        let r = MessageDecoder::default().decode(&raw(2, msg)).record;
        assert_eq!(r.body_text, "plain version");
        assert_eq!(r.subject, "(no subject)");
    }

    #[test]
    fn html_only_body_is_rendered_as_text() {
        let msg = b"From: a@example.com\r\n\
Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello <b>there</b></p></body></html>\r\n";
        let r = MessageDecoder::default().decode(&raw(3, msg)).record;
        assert!(r.body_text.contains("Hello"));
        assert!(r.body_text.contains("there"));
        assert!(!r.body_text.contains("<p>"));
    }

    #[test]
    fn no_text_part_gives_empty_body() {
        let msg = b"From: a@example.com\r\n\
Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n";
        let decoded = MessageDecoder::default().decode(&raw(4, msg));
        assert_eq!(decoded.record.body_text, "");
        assert!(!decoded.has_warnings());
    }

    #[test]
    fn gb18030_body_without_charset() {
        let mut msg = b"From: a@example.com\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\n".to_vec();
        msg.extend_from_slice(&[0xD6, 0xD0, 0xCE, 0xC4]);
        let r = MessageDecoder::default().decode(&raw(5, &msg)).record;
        assert_eq!(r.body_text, "中文");
    }

    #[test]
    fn bad_date_falls_back_to_internal_date() {
        let internal = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let msg = b"From: a@example.com\r\nDate: sometime last week\r\n\r\nbody";
        let decoded = MessageDecoder::default().decode(&RawMessage {
            uid: 9,
            body: Some(msg.to_vec()),
            internal_date: Some(internal),
        });
        assert_eq!(decoded.record.received_at, Some(internal));
        assert!(
            decoded
                .warnings
                .iter()
                .any(|w| w.field == DecodeField::Date)
        );
    }

    #[test]
    fn missing_body_gives_placeholder_with_warning() {
        let decoded = MessageDecoder::default().decode(&RawMessage {
            uid: 11,
            body: None,
            internal_date: None,
        });
        assert_eq!(decoded.record, MessageRecord::placeholder(11));
        assert!(decoded.has_warnings());
    }

    #[test]
    fn undecodable_body_is_kept_lossily_with_warning() {
        let probes = ProbeList::from_labels(&["utf-8"]).unwrap();
        let msg = b"From: a@example.com\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\nHello caf\xe9 world";
        let decoded = MessageDecoder::new(probes).decode(&raw(12, msg));
        assert_eq!(decoded.record.body_text, "Hello caf\u{FFFD} world");
        let body_warnings: Vec<_> = decoded
            .warnings
            .iter()
            .filter(|w| w.field == DecodeField::Body)
            .collect();
        assert_eq!(body_warnings.len(), 1);
    }

    #[test]
    fn undecodable_html_body_warns() {
        let probes = ProbeList::from_labels(&["utf-8"]).unwrap();
        let msg = b"From: a@example.com\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
Content-Type: text/html\r\n\r\n<p>caf\xe9</p>";
        let decoded = MessageDecoder::new(probes).decode(&raw(13, msg));
        assert!(decoded.record.body_text.starts_with("caf"));
        assert!(
            decoded
                .warnings
                .iter()
                .any(|w| w.field == DecodeField::Body)
        );
    }
}
