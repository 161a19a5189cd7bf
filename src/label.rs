//! Wire label format
//!
//! ```text
//! chunk-label := session "-" seq "-" payload "-" checksum
//! done-label  := session "-DONE"
//! ```
//!
//! Example: `K7QXZA-0003-NBSWY3DPEB3W64TMMQ-BRT.exfil.example.com`
//!
//! Labels are case-insensitive on the wire (resolvers may randomise case);
//! [`LabelCodec::parse`] normalises to upper case before validating.

use crate::checksum;
use crate::codec;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum total QNAME length
pub const MAX_QNAME_LEN: usize = 253;

/// Highest sequence number representable in the 4-digit field
pub const MAX_SEQUENCE: u16 = 9999;

/// Width of the zero-padded sequence field
pub const SEQUENCE_WIDTH: usize = 4;

/// Sequence field of the completion marker
pub const DONE_TOKEN: &str = "DONE";

const DELIMITER: char = '-';

/// A structurally valid chunk label (checksum not yet verified)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    pub session_id: String,
    pub sequence: u16,
    pub payload: String,
    pub checksum: String,
}

impl ParsedChunk {
    /// Recompute the payload digest and compare with the transmitted one
    pub fn checksum_ok(&self) -> bool {
        checksum::verify(&self.payload, &self.checksum)
    }
}

/// A parsed inbound label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Chunk(ParsedChunk),
    Done { session_id: String },
}

impl Label {
    pub fn session_id(&self) -> &str {
        match self {
            Label::Chunk(chunk) => &chunk.session_id,
            Label::Done { session_id } => session_id,
        }
    }
}

/// Errors building an outbound label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label is {len} characters, maximum is {max}; reduce chunk_size")]
    LabelTooLong { len: usize, max: usize },

    #[error("sequence {0} exceeds 9999")]
    SequenceOutOfRange(usize),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("payload is not base32")]
    InvalidPayload,
}

/// Structural violations in an inbound label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty label")]
    Empty,

    #[error("label is {0} characters, maximum is 63")]
    TooLong(usize),

    #[error("expected 4 fields (or 2 for completion), found {0}")]
    FieldCount(usize),

    #[error("bad session id '{0}'")]
    SessionId(String),

    #[error("bad sequence field '{0}'")]
    Sequence(String),

    #[error("bad payload field '{0}'")]
    Payload(String),

    #[error("bad checksum field '{0}'")]
    Checksum(String),

    #[error("query name '{0}' is outside the tunnel domain")]
    ForeignDomain(String),
}

/// Formats and parses labels for a fixed session-id/checksum geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelCodec {
    session_id_length: usize,
    checksum_length: usize,
}

impl Default for LabelCodec {
    fn default() -> Self {
        Self::new(6, checksum::DEFAULT_LENGTH)
    }
}

impl LabelCodec {
    pub fn new(session_id_length: usize, checksum_length: usize) -> Self {
        Self {
            session_id_length,
            checksum_length,
        }
    }

    pub fn session_id_length(&self) -> usize {
        self.session_id_length
    }

    pub fn checksum_length(&self) -> usize {
        self.checksum_length
    }

    /// Characters a chunk label spends on everything but the payload
    pub fn overhead(&self) -> usize {
        self.session_id_length + 1 + SEQUENCE_WIDTH + 1 + 1 + self.checksum_length
    }

    /// Largest payload that still fits in one label
    pub fn max_payload_len(&self) -> usize {
        MAX_LABEL_LEN.saturating_sub(self.overhead())
    }

    /// Build `<session>-<seq:04>-<payload>-<checksum>`
    pub fn format(
        &self,
        session_id: &str,
        sequence: usize,
        payload: &str,
    ) -> Result<String, LabelError> {
        self.check_session_id(session_id)
            .map_err(|_| LabelError::InvalidSessionId(session_id.to_string()))?;
        if sequence > MAX_SEQUENCE as usize {
            return Err(LabelError::SequenceOutOfRange(sequence));
        }
        if !codec::is_base32(payload) {
            return Err(LabelError::InvalidPayload);
        }

        let len = self.overhead() + payload.len();
        if len > MAX_LABEL_LEN {
            return Err(LabelError::LabelTooLong {
                len,
                max: MAX_LABEL_LEN,
            });
        }

        let payload = payload.to_ascii_uppercase();
        let digest = checksum::checksum(&payload, self.checksum_length);
        Ok(format!(
            "{}{d}{:0width$}{d}{}{d}{}",
            session_id.to_ascii_uppercase(),
            sequence,
            payload,
            digest,
            d = DELIMITER,
            width = SEQUENCE_WIDTH,
        ))
    }

    /// Build the completion marker `<session>-DONE`
    pub fn format_done(&self, session_id: &str) -> Result<String, LabelError> {
        self.check_session_id(session_id)
            .map_err(|_| LabelError::InvalidSessionId(session_id.to_string()))?;
        Ok(format!(
            "{}{}{}",
            session_id.to_ascii_uppercase(),
            DELIMITER,
            DONE_TOKEN
        ))
    }

    /// Parse a single label (no domain suffix)
    pub fn parse(&self, label: &str) -> Result<Label, ParseError> {
        if label.is_empty() {
            return Err(ParseError::Empty);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ParseError::TooLong(label.len()));
        }

        let label = label.to_ascii_uppercase();
        let fields: Vec<&str> = label.split(DELIMITER).collect();

        match fields.as_slice() {
            [session, done] if *done == DONE_TOKEN => {
                self.check_session_id(session)?;
                Ok(Label::Done {
                    session_id: session.to_string(),
                })
            }
            [session, seq, payload, digest] => {
                self.check_session_id(session)?;
                let sequence = parse_sequence(seq)?;

                if payload.is_empty() || !codec::is_base32(payload) {
                    return Err(ParseError::Payload(payload.to_string()));
                }
                if digest.len() != self.checksum_length || !codec::is_base32(digest) {
                    return Err(ParseError::Checksum(digest.to_string()));
                }

                Ok(Label::Chunk(ParsedChunk {
                    session_id: session.to_string(),
                    sequence,
                    payload: payload.to_string(),
                    checksum: digest.to_string(),
                }))
            }
            other => Err(ParseError::FieldCount(other.len())),
        }
    }

    fn check_session_id(&self, session_id: &str) -> Result<(), ParseError> {
        if session_id.len() != self.session_id_length || !codec::is_base32(session_id) {
            return Err(ParseError::SessionId(session_id.to_string()));
        }
        Ok(())
    }
}

fn parse_sequence(field: &str) -> Result<u16, ParseError> {
    if field.len() != SEQUENCE_WIDTH || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Sequence(field.to_string()));
    }
    field
        .parse::<u16>()
        .ok()
        .filter(|seq| *seq <= MAX_SEQUENCE)
        .ok_or_else(|| ParseError::Sequence(field.to_string()))
}

/// Full query name `<label>.<domain>`
pub fn query_name(label: &str, domain: &str) -> String {
    let domain = domain.trim_matches('.');
    if domain.is_empty() {
        label.to_string()
    } else {
        format!("{}.{}", label, domain)
    }
}

/// Extract the tunnel label from a query name
///
/// With a configured domain the name must be exactly one label under it.
/// Without one, the left-most label is taken.
pub fn strip_domain<'a>(qname: &'a str, domain: Option<&str>) -> Result<&'a str, ParseError> {
    let qname = qname.trim_end_matches('.');
    let foreign = || ParseError::ForeignDomain(qname.to_string());

    match domain.map(|d| d.trim_matches('.')).filter(|d| !d.is_empty()) {
        Some(domain) => {
            if qname.len() <= domain.len() + 1 || !qname.is_char_boundary(qname.len() - domain.len()) {
                return Err(foreign());
            }
            let split = qname.len() - domain.len();
            let (head, tail) = qname.split_at(split);
            if !tail.eq_ignore_ascii_case(domain) || !head.ends_with('.') {
                return Err(foreign());
            }
            let label = &head[..head.len() - 1];
            if label.contains('.') {
                return Err(foreign());
            }
            Ok(label)
        }
        None => qname.split('.').next().filter(|l| !l.is_empty()).ok_or(ParseError::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> LabelCodec {
        LabelCodec::default()
    }

    #[test]
    fn test_format_chunk_label() {
        let label = codec().format("AAAAAA", 7, "NBSWY3DPEB3W64TMMQ").unwrap();
        let digest = checksum::checksum("NBSWY3DPEB3W64TMMQ", 3);
        assert_eq!(label, format!("AAAAAA-0007-NBSWY3DPEB3W64TMMQ-{}", digest));
    }

    #[test]
    fn test_format_rejects_long_label() {
        let payload = "A".repeat(50);
        let err = codec().format("AAAAAA", 0, &payload).unwrap_err();
        assert_eq!(err, LabelError::LabelTooLong { len: 66, max: 63 });

        // 47 characters is the largest payload for 6/3 geometry
        assert_eq!(codec().max_payload_len(), 47);
        assert!(codec().format("AAAAAA", 0, &"A".repeat(47)).is_ok());
    }

    #[test]
    fn test_format_rejects_bad_inputs() {
        assert!(matches!(
            codec().format("AAA", 0, "MY"),
            Err(LabelError::InvalidSessionId(_))
        ));
        assert_eq!(
            codec().format("AAAAAA", 10_000, "MY"),
            Err(LabelError::SequenceOutOfRange(10_000))
        );
        assert_eq!(
            codec().format("AAAAAA", 0, "MY=="),
            Err(LabelError::InvalidPayload)
        );
    }

    #[test]
    fn test_parse_chunk_label() {
        let label = codec().format("K7QXZA", 42, "MZXW6").unwrap();
        match codec().parse(&label).unwrap() {
            Label::Chunk(chunk) => {
                assert_eq!(chunk.session_id, "K7QXZA");
                assert_eq!(chunk.sequence, 42);
                assert_eq!(chunk.payload, "MZXW6");
                assert!(chunk.checksum_ok());
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let label = codec().format("K7QXZA", 1, "MZXW6").unwrap();
        let parsed = codec().parse(&label.to_lowercase()).unwrap();
        assert_eq!(parsed, codec().parse(&label).unwrap());
    }

    #[test]
    fn test_done_label() {
        let label = codec().format_done("K7QXZA").unwrap();
        assert_eq!(label, "K7QXZA-DONE");
        assert_eq!(
            codec().parse("k7qxza-done").unwrap(),
            Label::Done {
                session_id: "K7QXZA".to_string()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let c = codec();
        assert_eq!(c.parse(""), Err(ParseError::Empty));
        assert!(matches!(c.parse("www"), Err(ParseError::FieldCount(1))));
        assert!(matches!(c.parse("AAAAAA-0001-MY"), Err(ParseError::FieldCount(3))));
        assert!(matches!(c.parse("AAAAA-0001-MY-AAA"), Err(ParseError::SessionId(_))));
        assert!(matches!(c.parse("AAAAA1-0001-MY-AAA"), Err(ParseError::SessionId(_))));
        assert!(matches!(c.parse("AAAAAA-001-MY-AAA"), Err(ParseError::Sequence(_))));
        assert!(matches!(c.parse("AAAAAA-00X1-MY-AAA"), Err(ParseError::Sequence(_))));
        assert!(matches!(c.parse("AAAAAA-0001--AAA"), Err(ParseError::Payload(_))));
        assert!(matches!(c.parse("AAAAAA-0001-M0-AAA"), Err(ParseError::Payload(_))));
        assert!(matches!(c.parse("AAAAAA-0001-MY-AA"), Err(ParseError::Checksum(_))));
        assert!(matches!(c.parse("AAAAAA-0001-MY-A1A"), Err(ParseError::Checksum(_))));
        assert!(matches!(c.parse("AAAAAA-DONE-MY-AAA"), Err(ParseError::Sequence(_))));
        assert!(matches!(c.parse(&"A".repeat(64)), Err(ParseError::TooLong(64))));
    }

    #[test]
    fn test_query_name() {
        assert_eq!(query_name("AAAAAA-DONE", "x.example.com."), "AAAAAA-DONE.x.example.com");
        assert_eq!(query_name("AAAAAA-DONE", ""), "AAAAAA-DONE");
    }

    #[test]
    fn test_strip_domain() {
        assert_eq!(
            strip_domain("AAAAAA-DONE.x.example.com.", Some("x.example.com")),
            Ok("AAAAAA-DONE")
        );
        assert_eq!(
            strip_domain("aaaaaa-done.X.EXAMPLE.COM", Some("x.example.com")),
            Ok("aaaaaa-done")
        );
        assert!(strip_domain("AAAAAA-DONE.other.com", Some("x.example.com")).is_err());
        assert!(strip_domain("a.b.x.example.com", Some("x.example.com")).is_err());
        assert!(strip_domain("x.example.com", Some("x.example.com")).is_err());
        assert!(strip_domain("AAAAAA-DONEx.example.com", Some("x.example.com")).is_err());
        assert_eq!(strip_domain("first.second.com", None), Ok("first"));
    }
}
