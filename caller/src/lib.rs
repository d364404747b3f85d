//! Outbound call placement for the SIP/RTP AI bridge.
//!
//! This crate wires the [`signaling::SipEngine`] and the
//! [`media::MediaBridge`] together for one call at a time, bridging the
//! caller's audio to an [`AiAudioChannel`].

pub mod ai;
pub mod orchestrator;
pub mod public_ip;

pub use ai::{AiAudioChannel, AudioCallback, ScriptedChannel};
pub use orchestrator::{CallOrchestrator, CallSummary, EndReason};
pub use public_ip::PublicIpDiscovery;
