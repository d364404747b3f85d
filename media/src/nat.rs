//! Port forwarding seam for NAT traversal.
//!
//! Opening router ports (UPnP or otherwise) is a collaborator concern. The
//! bridge asks once when it binds and releases on stop; a forwarder that
//! cannot help must return `false` quickly and never block call setup.

use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Best-effort port forwarder.
pub trait PortForwarder: Send + Sync {
    /// Requests a mapping for `port`. Returns `true` if one is now in place.
    fn forward(&self, port: u16, protocol: Protocol) -> bool;

    /// Releases a mapping created by `forward`.
    fn remove(&self, port: u16, protocol: Protocol);
}

/// Forwarder used when no automatic mapping is available.
///
/// It only tells the operator which port to open by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualForwarding;

impl PortForwarder for ManualForwarding {
    // ---
    fn forward(&self, port: u16, protocol: Protocol) -> bool {
        // ---
        info!(
            "No automatic port forwarding; forward {} port {} to this host manually if behind NAT",
            protocol, port
        );
        false
    }

    fn remove(&self, _port: u16, _protocol: Protocol) {}
}
