//! Error taxonomy shared by signaling, media and orchestration.

use thiserror::Error;

/// Convenience alias used throughout the library crates.
pub type CallResult<T> = Result<T, CallError>;

/// Every failure a call can surface.
///
/// Receive loops recover `MalformedMessage` locally (count and drop).
/// `CodecFallback` is informational: the caller logs it and keeps going with
/// the substitute codec. The remaining variants end the operation that
/// produced them and are expected to reach the orchestrator.
#[derive(Debug, Error)]
pub enum CallError {
    // ---
    /// Unparsable SIP, SDP or RTP input.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A 401/407 challenge without the parameters needed to answer it.
    #[error("malformed auth challenge: {0}")]
    MalformedChallenge(String),

    /// The server challenged the authenticated retry as well.
    #[error("unauthorized: credentials rejected after digest retry")]
    Unauthorized,

    /// No response within the bounded wait.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The call was abandoned locally before it was answered.
    #[error("cancelled before answer")]
    Cancelled,

    /// Final SIP error response (>= 400, not an auth challenge).
    #[error("rejected with {code} {reason}")]
    ProtocolFailure { code: u16, reason: String },

    /// Preferred codec failed and a substitute was used.
    #[error("codec fallback: {0}")]
    CodecFallback(String),

    /// Operation attempted on a dialog or bridge that cannot serve it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bind/send/receive failure from the operating system.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

impl CallError {
    // ---
    /// Returns `true` for outcomes that must end the call.
    pub fn is_terminal(&self) -> bool {
        // ---
        !matches!(
            self,
            CallError::MalformedMessage(_) | CallError::CodecFallback(_)
        )
    }

    /// SIP status code carried by a protocol failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        // ---
        match self {
            CallError::ProtocolFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}
