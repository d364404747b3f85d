//! Session Description Protocol bodies carried in INVITE and 200 OK.
//!
//! Parsing is lenient: lines that do not parse are skipped. Only the first
//! `m=audio` section is read.

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Session name advertised in offers.
pub const SESSION_NAME: &str = "Yealink SIP Session";

/// Payload types offered, in preference order.
pub const OFFERED_PAYLOAD_TYPES: [u8; 4] = [18, 0, 8, 101];

/// Telephone-event payload type in our offer.
pub const TELEPHONE_EVENT_PT: u8 = 101;

/// One `a=rtpmap` entry, or a static mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
}

/// The audio media section of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMedia {
    pub port: u16,

    /// Payload types in `m=` line order
    pub payload_types: Vec<u8>,

    /// Media-level `c=` address, if any
    pub connection: Option<IpAddr>,

    /// `a=rtcp:` port, if any
    pub rtcp_port: Option<u16>,

    /// Mapping for each payload type that has one
    pub codecs: Vec<RtpMap>,
}

/// A parsed SDP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub session_name: Option<String>,

    /// Session-level `c=` address
    pub connection: Option<IpAddr>,

    pub audio: AudioMedia,
}

impl SdpSession {
    // ---
    /// Where to send RTP: media-level address first, then session-level.
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        // ---
        let ip = self.audio.connection.or(self.connection)?;
        if self.audio.port == 0 {
            return None;
        }
        Some(SocketAddr::new(ip, self.audio.port))
    }

    /// Codec name for a payload type in this session.
    pub fn codec_for(&self, payload_type: u8) -> Option<&RtpMap> {
        self.audio
            .codecs
            .iter()
            .find(|m| m.payload_type == payload_type)
    }
}

/// RFC 3551 static assignments we recognise.
fn static_mapping(payload_type: u8) -> Option<RtpMap> {
    // ---
    let (codec, clock_rate) = match payload_type {
        0 => ("PCMU", 8000),
        8 => ("PCMA", 8000),
        9 => ("G722", 8000),
        18 => ("G729", 8000),
        _ => return None,
    };
    Some(RtpMap {
        payload_type,
        codec: codec.to_string(),
        clock_rate,
    })
}

fn parse_connection(value: &str) -> Option<IpAddr> {
    // ---
    // c=IN IP4 1.2.3.4
    let mut parts = value.split_whitespace();
    if parts.next()? != "IN" {
        return None;
    }
    let _addr_type = parts.next()?;
    let addr = parts.next()?;
    // Multicast TTL suffix (addr/ttl) is ignored
    addr.split('/').next()?.parse().ok()
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    // ---
    // a=rtpmap:0 PCMU/8000[/channels]
    let (pt, encoding) = value.split_once(char::is_whitespace)?;
    let mut fields = encoding.trim().split('/');
    let codec = fields.next()?.to_string();
    let clock_rate = fields.next()?.parse().ok()?;
    Some(RtpMap {
        payload_type: pt.trim().parse().ok()?,
        codec,
        clock_rate,
    })
}

/// Parses an SDP body.
///
/// Returns `None` when the body has no usable `m=audio` line.
pub fn parse(body: &str) -> Option<SdpSession> {
    // ---
    let mut session_name = None;
    let mut session_connection = None;
    let mut audio: Option<AudioMedia> = None;
    let mut rtpmaps = Vec::new();
    // Inside a media section other than the first audio one
    let mut skipping = false;

    for raw in body.lines() {
        let line = raw.trim();
        let Some((kind, value)) = line.split_once('=') else {
            continue;
        };

        match kind {
            "s" if audio.is_none() => session_name = Some(value.to_string()),
            "c" => {
                let Some(ip) = parse_connection(value) else {
                    continue;
                };
                match audio.as_mut() {
                    Some(media) if !skipping => media.connection = Some(ip),
                    Some(_) => {}
                    None => session_connection = Some(ip),
                }
            }
            "m" => {
                if audio.is_some() {
                    skipping = true;
                    continue;
                }
                let mut fields = value.split_whitespace();
                if fields.next() != Some("audio") {
                    skipping = true;
                    continue;
                }
                let Some(port) = fields.next().and_then(|p| p.split('/').next()?.parse().ok())
                else {
                    continue;
                };
                let _proto = fields.next();
                let payload_types = fields.filter_map(|pt| pt.parse().ok()).collect();
                skipping = false;
                audio = Some(AudioMedia {
                    port,
                    payload_types,
                    connection: None,
                    rtcp_port: None,
                    codecs: Vec::new(),
                });
            }
            "a" if !skipping => {
                if let Some(map) = value.strip_prefix("rtpmap:").and_then(parse_rtpmap) {
                    rtpmaps.push(map);
                } else if let Some(rtcp) = value.strip_prefix("rtcp:") {
                    if let Some(media) = audio.as_mut() {
                        media.rtcp_port = rtcp
                            .split_whitespace()
                            .next()
                            .and_then(|p| p.parse().ok());
                    }
                }
            }
            _ => {}
        }
    }

    let mut audio = audio?;
    audio.codecs = audio
        .payload_types
        .iter()
        .filter_map(|pt| {
            rtpmaps
                .iter()
                .find(|m| m.payload_type == *pt)
                .cloned()
                .or_else(|| static_mapping(*pt))
        })
        .collect();

    Some(SdpSession {
        session_name,
        connection: session_connection,
        audio,
    })
}

/// Builds our offer for `ip:port`.
///
/// Offers G.729, PCMU, PCMA and telephone-event. Lines end in CRLF.
pub fn build_offer(ip: IpAddr, port: u16) -> String {
    // ---
    let session_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    build_offer_with_id(ip, port, session_id)
}

fn build_offer_with_id(ip: IpAddr, port: u16, session_id: u64) -> String {
    // ---
    let pts = OFFERED_PAYLOAD_TYPES
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    let lines = [
        "v=0".to_string(),
        format!("o=- {session_id} {session_id} IN IP4 {ip}"),
        format!("s={SESSION_NAME}"),
        format!("c=IN IP4 {ip}"),
        "t=0 0".to_string(),
        format!("m=audio {port} RTP/AVP {pts}"),
        "a=rtpmap:18 G729/8000".to_string(),
        "a=rtpmap:0 PCMU/8000".to_string(),
        "a=rtpmap:8 PCMA/8000".to_string(),
        format!("a=rtpmap:{TELEPHONE_EVENT_PT} telephone-event/8000"),
        format!("a=fmtp:{TELEPHONE_EVENT_PT} 0-15"),
        "a=sendrecv".to_string(),
    ];

    let mut body = lines.join("\r\n");
    body.push_str("\r\n");
    body
}
