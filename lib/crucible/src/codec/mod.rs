use bytes::BytesMut;
use std::error::Error;
use std::fmt;

pub mod http;

/// Raised when a peer sends bytes that cannot form a valid message of the
/// protocol. The framework's recovery policy is to close the offending
/// connection; other connections are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    detail: String,
}

impl ProtocolViolation {
    pub fn new<S: Into<String>>(detail: S) -> ProtocolViolation {
        ProtocolViolation {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.detail)
    }
}

impl Error for ProtocolViolation {}

/// Translation between a raw byte stream and typed protocol messages.
///
/// The decoder half is stateful: `decode` consumes as many input bytes as
/// form complete messages and retains the unconsumed remainder internally,
/// so callers may split a stream into arbitrary chunks. The encoder half is
/// stateless by construction (an associated function with no receiver).
///
/// Round-trip law: `decode(encode(m))` yields exactly one message equal to
/// `m` modulo the codec's documented canonicalisations.
pub trait Codec: Send + 'static {
    type In: Send + 'static;
    type Out;

    /// Appends zero or more fully-decoded messages to `out`.
    fn decode(&mut self, input: &[u8], out: &mut Vec<Self::In>) -> Result<(), ProtocolViolation>;

    /// Signals end-of-stream. A codec may emit one final message, or report
    /// a violation for a stream truncated mid-message. The default treats
    /// end-of-stream as always clean.
    fn eof(&mut self) -> Result<Option<Self::In>, ProtocolViolation> {
        Ok(None)
    }

    /// Serialises `message` onto `dst`.
    fn encode(message: &Self::Out, dst: &mut BytesMut);
}
