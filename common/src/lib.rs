//! Shared building blocks for the SIP/RTP call bridge.
//!
//! This crate provides the RTP packet structure, the PCM frame type that
//! crosses the AI channel boundary, the error taxonomy, configuration
//! structs, and the observability setup used by every other member.

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod observability;
pub mod rtp;

pub use audio::AudioFrame;
pub use cli::ColorWhen;
pub use config::{CallSettings, DeviceSettings, MediaSettings, Settings, SipSettings};
pub use error::{CallError, CallResult};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use rtp::RtpPacket;
