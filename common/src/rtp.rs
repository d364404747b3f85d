//! RTP packet structure and serialization.
//!
//! Implements the RFC 3550 fixed header. Outbound packets never carry CSRC
//! identifiers or header extensions; inbound packets may, and parsing skips
//! over them so the payload slice is always the media bytes.

use crate::error::{CallError, CallResult};

/// RTP packet version 2 (as per RFC 3550)
const RTP_VERSION: u8 = 2;

/// Size of the fixed header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet for telephony audio.
///
/// # Protocol Details
///
/// - Version: Always 2 (RFC 3550)
/// - Payload Type: negotiated through SDP (0 PCMU, 8 PCMA, 9 G.722, ...)
/// - Sequence: Increments by 1 for each packet, wraps at 65535
/// - Timestamp: Advances by the number of samples at the RTP clock rate
/// - SSRC: Synchronization source identifier (random per stream)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    // ---
    /// Marker bit (first packet of a talk spurt)
    pub marker: bool,

    /// 7-bit payload type
    pub payload_type: u8,

    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in clock-rate units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// Contributing sources, only ever populated by parsing
    pub csrc: Vec<u32>,

    /// Encoded audio payload
    pub payload: Vec<u8>,
}

impl RtpPacket {
    // ---
    /// Creates a new RTP packet with the given parameters.
    ///
    /// # Arguments
    ///
    /// * `payload_type` - Negotiated payload type (7 bits)
    /// * `sequence` - Packet sequence number
    /// * `timestamp` - RTP timestamp (in clock-rate units)
    /// * `ssrc` - Synchronization source identifier
    /// * `payload` - Encoded audio data
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        // ---
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            payload,
        }
    }

    /// Returns the packet with the marker bit set.
    pub fn with_marker(mut self, marker: bool) -> Self {
        // ---
        self.marker = marker;
        self
    }

    /// Serializes the RTP packet into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           payload...                          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let csrc_count = self.csrc.len().min(15);
        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + csrc_count * 4 + self.payload.len());

        // Byte 0: V(2) | P(1) | X(1) | CC(4)
        buf.push((RTP_VERSION << 6) | csrc_count as u8);

        // Byte 1: M(1) | PT(7)
        let marker = if self.marker { 0x80 } else { 0x00 };
        buf.push(marker | (self.payload_type & 0x7F));

        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());

        for csrc in self.csrc.iter().take(csrc_count) {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }

        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserializes an RTP packet from wire format.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes received from network
    ///
    /// # Errors
    ///
    /// Returns `CallError::MalformedMessage` if:
    /// - Packet is smaller than the fixed header (12 bytes)
    /// - RTP version is not 2
    /// - CSRC list, header extension or padding run past the datagram
    pub fn deserialize(data: &[u8]) -> CallResult<Self> {
        // ---
        if data.len() < RTP_HEADER_LEN {
            return Err(malformed(format!("packet too small: {} bytes", data.len())));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(malformed(format!("invalid RTP version: {}", version)));
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(malformed(format!("truncated CSRC list ({} entries)", csrc_count)));
        }
        let csrc = data[offset..offset + csrc_count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset += csrc_count * 4;

        if has_extension {
            if data.len() < offset + 4 {
                return Err(malformed("truncated header extension".into()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(malformed("header extension exceeds packet".into()));
            }
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(malformed(format!("invalid padding length {}", pad)));
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            payload: data[offset..end].to_vec(),
        })
    }
}

fn malformed(reason: String) -> CallError {
    // ---
    CallError::MalformedMessage(reason)
}
