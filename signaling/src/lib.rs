//! SIP signaling for the call bridge.
//!
//! This crate provides Digest authentication, SDP offer/answer handling,
//! the SIP message model, the per-call dialog state machine and the
//! [`SipEngine`] that registers the account and places calls over UDP.

pub mod dialog;
pub mod digest;
pub mod engine;
pub mod message;
pub mod sdp;

pub use dialog::{Dialog, DialogState};
pub use digest::{build_authorization, AuthChallenge, AuthHeaderValue, ChallengeKind};
pub use engine::SipEngine;
pub use message::{MethodKind, SipMessage, SipRequest, SipResponse};
pub use sdp::SdpSession;
