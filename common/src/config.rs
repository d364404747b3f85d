//! Runtime configuration.
//!
//! One `Settings` value is built by the binary (from CLI flags and
//! environment variables) and passed by reference into the transaction
//! engine, media bridge and orchestrator constructors.

use anyhow::{bail, Result};
use std::net::IpAddr;
use std::time::Duration;

/// Complete configuration for one process.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    // ---
    pub sip: SipSettings,
    pub device: DeviceSettings,
    pub media: MediaSettings,
    pub call: CallSettings,
}

/// SIP account and transaction timing.
#[derive(Debug, Clone)]
pub struct SipSettings {
    // ---
    /// SIP registrar/proxy host name or address
    pub server: String,

    /// SIP server port
    pub port: u16,

    pub username: String,
    pub password: String,

    /// Display name used in the `From` header
    pub account_label: Option<String>,

    /// Local SIP bind port (0 selects an ephemeral port)
    pub local_port: u16,

    /// Bounded wait for each request's first response
    pub request_timeout: Duration,

    /// How long an outbound call may stay unanswered
    pub answer_timeout: Duration,

    /// Registration lifetime advertised in `Expires`
    pub register_expires: u32,
}

impl Default for SipSettings {
    fn default() -> Self {
        // ---
        Self {
            server: String::new(),
            port: 5060,
            username: String::new(),
            password: String::new(),
            account_label: None,
            local_port: 5060,
            request_timeout: Duration::from_secs(5),
            answer_timeout: Duration::from_secs(60),
            register_expires: 3600,
        }
    }
}

impl SipSettings {
    // ---
    /// Display name for the `From` header.
    pub fn display_name(&self) -> &str {
        // ---
        self.account_label
            .as_deref()
            .filter(|label| !label.is_empty())
            .unwrap_or("AI Agent")
    }
}

/// Desk-phone identity presented to the SIP trunk.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    // ---
    pub model: String,
    pub firmware: String,
    pub mac_address: String,

    /// Overrides the generated User-Agent when set
    pub custom_user_agent: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        // ---
        Self {
            model: "SIP-T46S".into(),
            firmware: "66.85.0.5".into(),
            mac_address: "00:1a:2b:3c:4d:5e".into(),
            custom_user_agent: None,
        }
    }
}

impl DeviceSettings {
    // ---
    /// User-Agent header value.
    pub fn user_agent(&self) -> String {
        // ---
        match &self.custom_user_agent {
            Some(custom) if !custom.is_empty() => custom.clone(),
            _ => format!("Yealink {} {} ~{}", self.model, self.firmware, self.mac_address),
        }
    }
}

/// RTP bridge tuning.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    // ---
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,

    /// Try the fixed range before falling back to an ephemeral port
    pub use_fixed_rtp_port: bool,

    /// Packets held before playout starts (5 x 20 ms = 100 ms)
    pub jitter_depth_packets: usize,

    /// Hard bound on buffered packets
    pub jitter_max_packets: usize,

    /// Call is considered dead after this long without inbound RTP
    pub silence_timeout: Duration,

    /// Outbound packet duration
    pub packet_duration: Duration,

    /// Decoded frames queued for the AI sink before the oldest is dropped
    pub sink_queue_frames: usize,

    /// Rate expected by the AI channel for caller audio
    pub ai_input_rate: u32,

    /// Rate of audio produced by the AI channel
    pub ai_output_rate: u32,

    /// Normalise inbound G.711 loudness before forwarding
    pub enable_agc: bool,
}

impl Default for MediaSettings {
    fn default() -> Self {
        // ---
        Self {
            rtp_port_min: 10000,
            rtp_port_max: 10100,
            use_fixed_rtp_port: true,
            jitter_depth_packets: 5,
            jitter_max_packets: 50,
            silence_timeout: Duration::from_secs(120),
            packet_duration: Duration::from_millis(10),
            sink_queue_frames: 64,
            ai_input_rate: 16000,
            ai_output_rate: 24000,
            enable_agc: true,
        }
    }
}

/// Call supervision and NAT hints.
#[derive(Debug, Clone)]
pub struct CallSettings {
    // ---
    /// Connected calls are hung up after this long
    pub max_call_duration: Duration,

    /// Wait allowed for the BYE response during teardown
    pub hangup_wait: Duration,

    /// Statically configured public address
    pub public_ip: Option<IpAddr>,

    /// Look up the public address over HTTP when none is configured
    pub discover_public_ip: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        // ---
        Self {
            max_call_duration: Duration::from_secs(300),
            hangup_wait: Duration::from_secs(2),
            public_ip: None,
            discover_public_ip: false,
        }
    }
}

impl Settings {
    // ---
    /// Checks the settings for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - SIP server, username or password is empty
    /// - RTP port range is inverted
    /// - MAC address is not 12 hex digits
    /// - packet duration is outside 10..=20 ms
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.sip.server.trim().is_empty() {
            bail!("SIP server is required");
        }
        if self.sip.username.is_empty() || self.sip.password.is_empty() {
            bail!("SIP username and password are required");
        }
        if self.media.rtp_port_min > self.media.rtp_port_max {
            bail!(
                "RTP port range is inverted: {}-{}",
                self.media.rtp_port_min,
                self.media.rtp_port_max
            );
        }

        let mac: String = self
            .device
            .mac_address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid MAC address: {}", self.device.mac_address);
        }

        let ms = self.media.packet_duration.as_millis();
        if !(10..=20).contains(&ms) {
            bail!("packet duration must be 10-20ms, got {}ms", ms);
        }

        Ok(())
    }
}
