//! RTP media for the SIP call bridge.
//!
//! This crate provides the Codec Engine (G.711, G.722, resampling, AGC),
//! the jitter buffer, RTP socket handling and the [`MediaBridge`] that
//! moves audio between a call and the AI audio channel.

pub mod bridge;
pub mod codec;
pub mod jitter_buffer;
pub mod nat;
pub mod network;
pub mod stats;

pub use bridge::{AudioSink, MediaBridge, MediaBridgeConfig};
pub use codec::PayloadCodec;
pub use nat::{ManualForwarding, PortForwarder, Protocol};
pub use stats::MediaStatsSnapshot;
