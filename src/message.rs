//! SIP message codec: parses a raw UDP datagram into a structured
//! message and serializes responses back to bytes. Does not interpret
//! request/response semantics -- that's `engine::SipEngine`'s job.
//!
//! Headers are modeled as a canonicalizing, order-preserving map
//! rather than exposing byte ranges into the raw datagram to callers
//! (the teacher crate's `TextRange`/zero-copy approach was built for a
//! different workload -- a border controller rewriting every message
//! in place -- and is dropped here in favor of the owned structured
//! value the state machines need).

use std::fmt;

use strum_macros::{Display, EnumString};

use crate::error::CodecError;

/// SIP methods this server understands. An unrecognized token still
/// parses (as `Unknown`) so the codec never rejects a message the
/// engine simply has no handler for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    #[strum(default)]
    Unknown(String),
}

/// The start line of a parsed message: either a request line or a
/// status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, request_uri: String, version: String },
    Response { version: String, status: u16, reason: String },
}

/// Header order used by the serializer for the headers this server
/// actually emits (SPEC_FULL §4.1). Anything not in this list is
/// emitted afterward in first-seen order.
const CANONICAL_ORDER: &[&str] = &[
    "via",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "allow",
    "accept",
    "expires",
    "content-type",
    "content-length",
];

fn canonical_display_name(lower: &str) -> String {
    match lower {
        "via" => "Via".to_string(),
        "from" => "From".to_string(),
        "to" => "To".to_string(),
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "contact" => "Contact".to_string(),
        "allow" => "Allow".to_string(),
        "accept" => "Accept".to_string(),
        "expires" => "Expires".to_string(),
        "content-type" => "Content-Type".to_string(),
        "content-length" => "Content-Length".to_string(),
        "max-forwards" => "Max-Forwards".to_string(),
        other => other
            .split('-')
            .map(|segment| {
                let mut chars = segment.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// A parsed SIP message: start line, canonicalizing header map, and
/// an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    /// `(lowercase name, display name, values in arrival order)` in
    /// first-seen header order.
    headers: Vec<(String, String, Vec<String>)>,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn new_request(method: Method, request_uri: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Request {
                method,
                request_uri: request_uri.into(),
                version: "SIP/2.0".to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn new_response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Response {
                version: "SIP/2.0".to_string(),
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// First value of a header, case-insensitive, or `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(|s| s.as_str())
    }

    /// All values of a header in arrival order, case-insensitive.
    pub fn header_values(&self, name: &str) -> &[String] {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _, _)| *key == lower)
            .map(|(_, _, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Append a header value, rejecting CRLF-injection attempts the
    /// same way the teacher's `validation::sanitize_header_value` does.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), CodecError> {
        let value = value.into();
        if value.contains('\r') || value.contains('\n') {
            return Err(CodecError::HeaderInjection(value));
        }
        let lower = name.to_ascii_lowercase();
        if let Some(entry) = self.headers.iter_mut().find(|(key, _, _)| *key == lower) {
            entry.2.push(value);
        } else {
            self.headers.push((lower.clone(), canonical_display_name(&lower), vec![value]));
        }
        Ok(())
    }

    /// Replace all values of a header with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), CodecError> {
        let lower = name.to_ascii_lowercase();
        self.headers.retain(|(key, _, _)| *key != lower);
        self.add_header(name, value)
    }

    /// Copy every value of `name` from `other` onto `self`, in order.
    /// Used to echo `Via`, `From`, `To`, `Call-ID`, `CSeq` onto a
    /// response (SPEC_FULL §4.4.5).
    pub fn echo_header_from(&mut self, other: &SipMessage, name: &str) {
        for value in other.header_values(name).to_vec() {
            // echoed values come from an already-parsed message, so
            // they cannot contain CR/LF; the error path is unreachable.
            let _ = self.add_header(name, value);
        }
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Parse a raw UDP datagram. Tolerant of lone-LF line endings and
    /// header folding; rejects only genuinely malformed input.
    pub fn parse(datagram: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(datagram)
            .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;

        // Split into header block and body at the first blank line,
        // tolerating CRLF or LF terminators.
        let (header_block, body) = split_header_block(text);

        let mut lines = header_block.lines();
        let start = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => {
                    return Err(CodecError::MalformedStartLine("empty datagram".to_string()))
                }
            }
        };

        let start_line = parse_start_line(start)?;

        let mut headers: Vec<(String, String, Vec<String>)> = Vec::new();
        let mut line_no = 1usize;
        for line in lines {
            line_no += 1;
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation line.
                let continuation = line.trim();
                if let Some((_, _, values)) = headers.last_mut() {
                    if let Some(last) = values.last_mut() {
                        last.push(' ');
                        last.push_str(continuation);
                        continue;
                    }
                }
                return Err(CodecError::MalformedHeader {
                    line: line_no,
                    text: line.to_string(),
                });
            }
            let colon = line.find(':').ok_or_else(|| CodecError::MalformedHeader {
                line: line_no,
                text: line.to_string(),
            })?;
            let name = line[..colon].trim();
            if name.is_empty() {
                return Err(CodecError::MalformedHeader { line: line_no, text: line.to_string() });
            }
            let value = line[colon + 1..].trim().to_string();
            let lower = name.to_ascii_lowercase();
            if let Some(entry) = headers.iter_mut().find(|(key, _, _)| *key == lower) {
                entry.2.push(value);
            } else {
                headers.push((lower.clone(), canonical_display_name(&lower), vec![value]));
            }
        }

        Ok(SipMessage { start_line, headers, body: body.as_bytes().to_vec() })
    }

    /// Serialize to CRLF-delimited bytes, with `Content-Length`
    /// always recomputed from the body (SPEC_FULL §4.1).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start_line {
            StartLine::Request { method, request_uri, version } => {
                out.push_str(&format!("{} {} {}\r\n", method, request_uri, version));
            }
            StartLine::Response { version, status, reason } => {
                out.push_str(&format!("{} {} {}\r\n", version, status, reason));
            }
        }

        let mut emitted: Vec<bool> = vec![false; self.headers.len()];
        for &canonical in CANONICAL_ORDER {
            if canonical == "content-length" {
                continue; // computed below, emitted right after this block
            }
            if let Some(idx) = self.headers.iter().position(|(key, _, _)| key == canonical) {
                emitted[idx] = true;
                let (_, display, values) = &self.headers[idx];
                for value in values {
                    out.push_str(&format!("{}: {}\r\n", display, value));
                }
            }
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        for (idx, (key, display, values)) in self.headers.iter().enumerate() {
            if emitted[idx] || key == "content-length" {
                continue;
            }
            for value in values {
                out.push_str(&format!("{}: {}\r\n", display, value));
            }
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn split_header_block(text: &str) -> (&str, &str) {
    if let Some(idx) = text.find("\r\n\r\n") {
        return (&text[..idx], &text[idx + 4..]);
    }
    if let Some(idx) = text.find("\n\n") {
        return (&text[..idx], &text[idx + 2..]);
    }
    (text, "")
}

fn parse_start_line(line: &str) -> Result<StartLine, CodecError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(CodecError::MalformedStartLine(line.to_string()));
    }
    if tokens[0].eq_ignore_ascii_case("SIP/2.0") {
        let status: u16 = tokens[1]
            .parse()
            .map_err(|_| CodecError::MalformedStartLine(line.to_string()))?;
        let reason = tokens[2..].join(" ");
        Ok(StartLine::Response { version: tokens[0].to_string(), status, reason })
    } else {
        let method = tokens[0].parse::<Method>().unwrap_or(Method::Unknown(tokens[0].to_string()));
        Ok(StartLine::Request {
            method,
            request_uri: tokens[1].to_string(),
            version: tokens[2].to_string(),
        })
    }
}

/// Extract the user-part of a `sip:`/`sips:` URI embedded in a header
/// value, e.g. `"Alice" <sip:[email protected]>;tag=x` -> `"200"`.
/// Mirrors the original `re.search(r'sip:([^@]+)@', header)` behavior.
pub fn extract_uri_user(header_value: &str) -> Option<String> {
    let lower = header_value.to_ascii_lowercase();
    let scheme_at = lower.find("sip:").or_else(|| lower.find("sips:"))?;
    let after_scheme = &header_value[scheme_at..];
    let colon = after_scheme.find(':')?;
    let rest = &after_scheme[colon + 1..];
    let at = rest.find('@')?;
    let user = &rest[..at];
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.serialize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:server SIP/2.0\r\nFrom: <sip:[email protected]>\r\nTo: <sip:[email protected]>\r\nCall-ID: a@b\r\nCSeq: 1 REGISTER\r\nContact: <sip:[email protected]:5060>\r\n\r\n";

    #[test]
    fn parses_register_request_line_and_headers() {
        let msg = SipMessage::parse(REGISTER.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(&Method::Register));
        assert_eq!(msg.header("call-id"), Some("a@b"));
        assert_eq!(msg.header("Call-ID"), Some("a@b"));
        assert_eq!(msg.header("cseq"), Some("1 REGISTER"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn tolerates_lone_lf() {
        let raw = REGISTER.replace("\r\n", "\n");
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(&Method::Register));
    }

    #[test]
    fn folds_continuation_lines() {
        let raw = "OPTIONS sip:server SIP/2.0\r\nSubject: long\r\n value\r\nCall-ID: x\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.header("subject"), Some("long value"));
    }

    #[test]
    fn duplicate_headers_preserve_order() {
        let raw = "OPTIONS sip:server SIP/2.0\r\nVia: one\r\nVia: two\r\nCall-ID: x\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.header_values("via"), &["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn rejects_short_start_line() {
        let err = SipMessage::parse(b"garbage").unwrap_err();
        assert!(matches!(err, CodecError::MalformedStartLine(_)));
    }

    #[test]
    fn serialize_orders_known_headers_and_sets_content_length() {
        let mut msg = SipMessage::new_response(200, "OK");
        msg.add_header("Content-Length", "999").unwrap(); // must be overridden
        msg.add_header("X-Custom", "z").unwrap();
        msg.add_header("Call-ID", "a@b").unwrap();
        msg.add_header("Via", "SIP/2.0/UDP h").unwrap();
        let out = String::from_utf8(msg.serialize()).unwrap();
        let via_pos = out.find("Via:").unwrap();
        let call_id_pos = out.find("Call-ID:").unwrap();
        let custom_pos = out.find("X-Custom:").unwrap();
        let len_pos = out.find("Content-Length:").unwrap();
        assert!(via_pos < call_id_pos);
        assert!(call_id_pos < len_pos);
        assert!(len_pos < custom_pos);
        assert!(out.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn round_trip_preserves_semantic_content() {
        let original = SipMessage::parse(REGISTER.as_bytes()).unwrap();
        let reparsed = SipMessage::parse(&original.serialize()).unwrap();
        assert_eq!(original.header("call-id"), reparsed.header("call-id"));
        assert_eq!(original.header("cseq"), reparsed.header("cseq"));
        assert_eq!(original.method(), reparsed.method());
    }

    #[test]
    fn extracts_uri_user_part() {
        assert_eq!(extract_uri_user("<sip:[email protected]>"), Some("200".to_string()));
        assert_eq!(extract_uri_user("Alice <sip:[email protected]>;tag=1"), Some("alice".to_string()));
        assert_eq!(extract_uri_user("not a uri"), None);
    }

    #[test]
    fn add_header_rejects_crlf_injection() {
        let mut msg = SipMessage::new_response(200, "OK");
        let err = msg.add_header("X-Evil", "a\r\nEvil: true").unwrap_err();
        assert!(matches!(err, CodecError::HeaderInjection(_)));
    }
}
