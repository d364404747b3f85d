//! Call orchestration: one outbound call from dial to teardown.
//!
//! ```text
//! start bridge -> dial (CANCEL on shutdown) -> apply answer SDP -> wire AI channel
//!     -> wait for: remote BYE | RTP silence | max duration | AI done | shutdown
//!     -> hangup -> stop bridge -> close AI channel
//! ```

use crate::ai::AiAudioChannel;
use media::{ManualForwarding, MediaBridge, MediaBridgeConfig, MediaStatsSnapshot, PortForwarder};
use signaling::{Dialog, SipEngine};
use sipbridge_common::{AudioFrame, CallResult, MetricsContext, Settings};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Why a connected call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The far end sent BYE or CANCEL
    RemoteHangup,

    /// The AI channel finished speaking
    LocalHangup,

    /// No RTP from the caller for the silence window
    SilenceTimeout,

    /// Connected longer than the configured maximum
    MaxDuration,

    /// Shutdown requested by the operator
    Cancelled,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let text = match self {
            Self::RemoteHangup => "remote hangup",
            Self::LocalHangup => "local hangup",
            Self::SilenceTimeout => "silence timeout",
            Self::MaxDuration => "max duration",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Outcome of a call that connected.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: String,
    pub target: String,

    /// Time spent connected
    pub duration: Duration,

    pub reason: EndReason,
    pub media: MediaStatsSnapshot,
}

impl fmt::Display for CallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(
            f,
            "call {} to {} lasted {:.1}s ({}), {} packets in, {} out",
            self.call_id,
            self.target,
            self.duration.as_secs_f64(),
            self.reason,
            self.media.packets_received,
            self.media.packets_sent
        )
    }
}

/// Places calls through a shared engine, one bridge per call.
pub struct CallOrchestrator {
    // ---
    settings: Settings,
    engine: Arc<SipEngine>,
    metrics: Option<MetricsContext>,
    forwarder: Arc<dyn PortForwarder>,
}

impl CallOrchestrator {
    // ---
    pub fn new(settings: Settings, engine: Arc<SipEngine>, metrics: Option<MetricsContext>) -> Self {
        // ---
        Self {
            settings,
            engine,
            metrics,
            forwarder: Arc::new(ManualForwarding),
        }
    }

    /// Uses `forwarder` to open RTP ports on the NAT.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn PortForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Calls `target`, bridges it to `ai` and returns once the call is over.
    ///
    /// # Arguments
    ///
    /// * `target` - Number or SIP URI to dial
    /// * `ai` - Conversation channel for the call
    /// * `shutdown` - Resolves when the operator wants the call ended
    ///
    /// # Errors
    ///
    /// Returns the bridge or dial failure when the call never connects, and
    /// `CallError::Cancelled` when `shutdown` resolves before the answer. Once
    /// connected, every ending is reported through [`CallSummary::reason`].
    pub async fn place_call<F>(
        &self,
        target: &str,
        ai: Arc<dyn AiAudioChannel>,
        shutdown: F,
    ) -> CallResult<CallSummary>
    where
        F: Future<Output = ()>,
    {
        // ---
        let bridge = Arc::new(MediaBridge::with_observers(
            MediaBridgeConfig::from(&self.settings.media),
            self.metrics.clone(),
            Arc::clone(&self.forwarder),
        ));
        let rtp_port = bridge.start(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await?;

        // Shutdown while ringing cancels the INVITE
        tokio::pin!(shutdown);
        let dialog = match self.engine.dial_until(target, rtp_port, &mut shutdown).await {
            Ok(dialog) => dialog,
            Err(e) => {
                bridge.stop();
                return Err(e);
            }
        };

        self.apply_answer(&dialog, &bridge);

        // Caller audio -> AI
        let to_ai = Arc::clone(&ai);
        bridge.set_decoded_audio_sink(Arc::new(move |frame: AudioFrame| to_ai.send(frame)));

        // AI -> caller, paced by the bridge
        let (speech_tx, speech_rx) = mpsc::unbounded_channel::<AudioFrame>();
        ai.on_audio(Arc::new(move |frame: AudioFrame| {
            let _ = speech_tx.send(frame);
        }));
        let mut pump = tokio::spawn(pump_speech(Arc::clone(&bridge), speech_rx));

        let reason = tokio::select! {
            _ = dialog.terminated() => EndReason::RemoteHangup,
            _ = bridge.wait_for_silence() => EndReason::SilenceTimeout,
            _ = tokio::time::sleep(self.settings.call.max_call_duration) => EndReason::MaxDuration,
            _ = &mut pump => EndReason::LocalHangup,
            _ = &mut shutdown => EndReason::Cancelled,
        };
        info!("Call {} ending: {}", dialog.call_id(), reason);

        pump.abort();
        self.engine.hangup(&dialog).await;
        bridge.stop();
        ai.close();

        let summary = CallSummary {
            call_id: dialog.call_id().to_string(),
            target: dialog.target().to_string(),
            duration: dialog.connected_duration(),
            reason,
            media: bridge.stats(),
        };
        info!("{}", summary);
        Ok(summary)
    }

    /// Points the bridge at the negotiated media.
    fn apply_answer(&self, dialog: &Dialog, bridge: &MediaBridge) {
        // ---
        let Some(answer) = dialog.remote_sdp() else {
            warn!("Call {} connected without SDP; waiting to learn the endpoint", dialog.call_id());
            return;
        };

        match answer.audio_endpoint() {
            Some(endpoint) => bridge.set_remote_endpoint(endpoint),
            None => warn!("Answer SDP has no usable audio address"),
        }
        bridge.set_negotiated_payload_types(&answer.audio.payload_types);
    }
}

/// Forwards AI speech to the bridge until the channel closes.
async fn pump_speech(bridge: Arc<MediaBridge>, mut speech: mpsc::UnboundedReceiver<AudioFrame>) {
    // ---
    while let Some(frame) = speech.recv().await {
        if let Err(e) = bridge.send_ai_audio(frame).await {
            warn!("Dropping AI audio: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_summary_display() {
        // ---
        let summary = CallSummary {
            call_id: "call-1".into(),
            target: "1001".into(),
            duration: Duration::from_millis(12_340),
            reason: EndReason::SilenceTimeout,
            media: MediaStatsSnapshot::default(),
        };
        assert_eq!(
            summary.to_string(),
            "call call-1 to 1001 lasted 12.3s (silence timeout), 0 packets in, 0 out"
        );
    }
}
