//! UDP socket handling for RTP.
//!
//! Binding prefers a fixed port range so firewall and NAT rules can be
//! written ahead of time, then falls back to an OS-assigned port.

use sipbridge_common::CallResult;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Largest datagram the receive loop reads.
pub const MAX_DATAGRAM: usize = 2048;

/// Binds the RTP socket.
///
/// Even ports in `fixed_range` are tried in order first (RTP takes the even
/// port, RTCP the odd one above it). When the range is `None` or exhausted,
/// an ephemeral port is used.
///
/// # Arguments
///
/// * `bind_ip` - Local interface address
/// * `fixed_range` - Preferred ports, if any
///
/// # Errors
///
/// Returns `CallError::Socket` if even the ephemeral bind fails.
pub async fn bind_rtp_socket(
    bind_ip: IpAddr,
    fixed_range: Option<RangeInclusive<u16>>,
) -> CallResult<UdpSocket> {
    // ---
    if let Some(range) = fixed_range {
        let first = range.start().saturating_add(range.start() % 2);
        for port in (first..=*range.end()).step_by(2) {
            match UdpSocket::bind(SocketAddr::new(bind_ip, port)).await {
                Ok(socket) => {
                    info!("RTP socket bound to {}:{}", bind_ip, port);
                    return Ok(socket);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("RTP port {} in use", port);
                }
                Err(e) => {
                    warn!("RTP bind on {}:{} failed: {}", bind_ip, port, e);
                    break;
                }
            }
        }
        warn!(
            "No free RTP port in {}-{}, falling back to an ephemeral port",
            range.start(),
            range.end()
        );
    }

    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    info!("RTP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Receives one datagram, giving up after `wait`.
///
/// Returns `Ok(None)` on timeout so callers can poll a shutdown flag.
///
/// # Errors
///
/// Returns the socket error for anything other than a timeout.
pub async fn recv_with_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    wait: Duration,
) -> io::Result<Option<(usize, SocketAddr)>> {
    // ---
    match tokio::time::timeout(wait, socket.recv_from(buf)).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// Errors after which the receive loop keeps going.
///
/// ICMP port-unreachable from an earlier send surfaces on some platforms as
/// a reset or refused error on the next receive.
pub fn is_transient(err: &io::Error) -> bool {
    // ---
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
