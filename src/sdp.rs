//! Minimal SDP (Session Description Protocol) handling for INVITE
//! bodies, adapted from the teacher crate's `sdp::SessionDescription`
//! but trimmed to exactly the lines SPEC_FULL §4.4.4 cares about:
//! `v=`, `o=`, `c=`, `m=`, and `a=rtpmap:`. Everything else is
//! ignored. Parsing never fails -- at worst it produces an offer with
//! no codecs, which only affects the audit record, never the INVITE
//! itself.

/// The handful of SDP fields the engine needs out of an INVITE body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpOffer {
    pub version: Option<String>,
    pub origin: Option<String>,
    pub connection: Option<String>,
    pub media: Option<String>,
    pub codecs: Vec<String>,
}

impl SdpOffer {
    /// Parse the handful of recognized lines out of an SDP body.
    /// Absent/garbled input yields a mostly-empty offer, never an
    /// error (SPEC_FULL §4.4.4).
    pub fn parse(body: &str) -> Self {
        let mut offer = SdpOffer::default();
        for line in body.lines() {
            if let Some(rest) = line.strip_prefix("v=") {
                offer.version = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("o=") {
                offer.origin = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("c=") {
                offer.connection = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("m=") {
                offer.media = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                offer.codecs.push(rest.trim().to_string());
            }
        }
        offer
    }

    /// Codec list for the audit record: the parsed `a=rtpmap:` values,
    /// or `PCMU, PCMA` if no `m=` line was present at all
    /// (SPEC_FULL §4.4.4).
    pub fn audit_codec_list(&self) -> String {
        if self.media.is_none() {
            "PCMU, PCMA".to_string()
        } else if self.codecs.is_empty() {
            String::new()
        } else {
            self.codecs.join(", ")
        }
    }
}

/// Build the fixed SDP answer body this engine always sends for an
/// accepted INVITE (SPEC_FULL §6), anchored at `bind_addr`.
pub fn build_answer(bind_addr: &str) -> String {
    format!(
        "v=0\r\no=engine 123456 654321 IN IP4 {addr}\r\ns=VoIP Call\r\nc=IN IP4 {addr}\r\nt=0 0\r\nm=audio 8000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        addr = bind_addr
    )
}

/// The codec negotiated by this engine for every accepted call
/// (SPEC_FULL §3: `negotiated_codec` is always `PCMU/8000`).
pub const NEGOTIATED_CODEC: &str = "PCMU/8000";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_lines_and_ignores_others() {
        let body = "v=0\r\no=VoIPDemo 1 1 IN IP4 192.168.100.1\r\ns=VoIP Call\r\nc=IN IP4 192.168.100.1\r\nt=0 0\r\nm=audio 8000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        let offer = SdpOffer::parse(body);
        assert_eq!(offer.version.as_deref(), Some("0"));
        assert_eq!(offer.media.as_deref(), Some("audio 8000 RTP/AVP 0"));
        assert_eq!(offer.codecs, vec!["0 PCMU/8000".to_string()]);
    }

    #[test]
    fn missing_media_line_defaults_codec_list() {
        let offer = SdpOffer::parse("v=0\r\n");
        assert_eq!(offer.audit_codec_list(), "PCMU, PCMA");
    }

    #[test]
    fn empty_body_never_fails() {
        let offer = SdpOffer::parse("");
        assert!(offer.codecs.is_empty());
    }

    #[test]
    fn answer_contains_required_lines() {
        let answer = build_answer("192.168.100.1");
        assert!(answer.contains("m=audio 8000 RTP/AVP 0"));
        assert!(answer.contains("a=rtpmap:0 PCMU/8000"));
    }
}
