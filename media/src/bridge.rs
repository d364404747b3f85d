//! RTP Media Bridge.
//!
//! Captures caller audio from RTP and injects AI audio back into the call.
//! The bridge is not a relay: nothing received is ever sent back out, so the
//! only outbound traffic is what [`MediaBridge::send_ai_audio`] produces.
//!
//! Three tasks run per started bridge:
//!
//! - the receive loop, which learns the remote endpoint, filters and
//!   reorders packets, and decodes them;
//! - the delivery task, which hands decoded frames to the registered sink
//!   from a bounded queue (oldest frames are dropped when the sink lags);
//! - a stats logger.

use crate::codec::{self, Decoder, Encoder, PayloadCodec};
use crate::jitter_buffer::{InsertOutcome, JitterBuffer, JitterBufferConfig};
use crate::nat::{ManualForwarding, PortForwarder, Protocol};
use crate::network::{bind_rtp_socket, is_transient, recv_with_timeout, MAX_DATAGRAM};
use crate::stats::{MediaStats, MediaStatsSnapshot, STATS_LOG_INTERVAL};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use sipbridge_common::observability::drop_reason;
use sipbridge_common::{
    AudioFrame, CallError, CallResult, MediaSettings, MetricsContext, RtpPacket,
};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Receive poll interval; bounds how long shutdown takes to be noticed.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Silence sent ahead of the first outbound chunk.
const PRIMING_SILENCE: Duration = Duration::from_millis(100);

/// Consumer of decoded caller audio.
pub type AudioSink = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Media bridge configuration.
#[derive(Debug, Clone)]
pub struct MediaBridgeConfig {
    // ---
    /// Ports tried before an ephemeral one
    pub port_range: Option<RangeInclusive<u16>>,

    pub jitter: JitterBufferConfig,

    /// Inbound silence after which the call is considered dead
    pub silence_timeout: Duration,

    /// Outbound packet duration (10-20 ms)
    pub packet_duration: Duration,

    /// Decoded frames queued for the sink
    pub sink_queue_frames: usize,

    /// Rate delivered to the sink
    pub ai_input_rate: u32,

    pub enable_agc: bool,
}

impl Default for MediaBridgeConfig {
    fn default() -> Self {
        Self::from(&MediaSettings::default())
    }
}

impl From<&MediaSettings> for MediaBridgeConfig {
    fn from(settings: &MediaSettings) -> Self {
        // ---
        Self {
            port_range: settings
                .use_fixed_rtp_port
                .then(|| settings.rtp_port_min..=settings.rtp_port_max),
            jitter: JitterBufferConfig {
                depth_packets: settings.jitter_depth_packets,
                max_packets: settings.jitter_max_packets,
            },
            silence_timeout: settings.silence_timeout,
            packet_duration: settings.packet_duration,
            sink_queue_frames: settings.sink_queue_frames,
            ai_input_rate: settings.ai_input_rate,
            enable_agc: settings.enable_agc,
        }
    }
}

/// Codecs agreed with the remote side.
#[derive(Debug, Clone)]
struct Negotiated {
    /// Inbound payload types accepted; empty accepts every supported codec
    accepted: Vec<PayloadCodec>,
    outbound: PayloadCodec,
}

/// Sequencing state of the outbound stream.
struct OutboundStream {
    encoder: Encoder,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,

    /// Silence has been sent ahead of the first chunk
    primed: bool,

    /// At least one packet went out; the first carries the marker bit
    sent_any: bool,

    /// When the next packet is due; paces across `send_ai_audio` calls
    next_send: Option<tokio::time::Instant>,
}

impl OutboundStream {
    // ---
    fn new() -> Self {
        // ---
        Self {
            encoder: Encoder::new(),
            sequence: rand::random(),
            timestamp: rand::random(),
            ssrc: rand::random(),
            primed: false,
            sent_any: false,
            next_send: None,
        }
    }
}

struct Inner {
    // ---
    config: MediaBridgeConfig,
    socket: ArcSwapOption<UdpSocket>,

    /// From negotiated SDP
    remote: ArcSwapOption<SocketAddr>,

    /// Source of the first inbound packet; fixed once set
    learned: ArcSwapOption<SocketAddr>,

    negotiated: RwLock<Negotiated>,
    sink: RwLock<Option<AudioSink>>,
    frames: broadcast::Sender<AudioFrame>,
    outbound: tokio::sync::Mutex<OutboundStream>,

    shutdown: AtomicBool,

    /// Millis since `epoch` of the last accepted inbound packet
    last_rx_ms: AtomicU64,
    epoch: Instant,

    /// Port handed to the forwarder, 0 when none
    forwarded_port: AtomicU16,

    stats: MediaStats,
    metrics: Option<MetricsContext>,
    forwarder: Arc<dyn PortForwarder>,
}

/// Bidirectional RTP endpoint for one call.
///
/// # Example
///
/// ```no_run
/// use media::{MediaBridge, MediaBridgeConfig};
/// use sipbridge_common::AudioFrame;
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
///
/// # async fn demo() -> sipbridge_common::CallResult<()> {
/// let bridge = MediaBridge::new(MediaBridgeConfig::default());
/// let port = bridge.start(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await?;
/// // ... offer `port` in SDP, then once answered:
/// bridge.set_remote_endpoint("203.0.113.7:40000".parse().expect("address"));
/// bridge.set_decoded_audio_sink(Arc::new(|frame: AudioFrame| println!("{} bytes", frame.data.len())));
/// bridge.stop();
/// # Ok(())
/// # }
/// ```
pub struct MediaBridge {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaBridge {
    // ---
    /// Creates a stopped bridge with manual port forwarding and no metrics.
    pub fn new(config: MediaBridgeConfig) -> Self {
        Self::with_observers(config, None, Arc::new(ManualForwarding))
    }

    /// Creates a stopped bridge.
    ///
    /// # Arguments
    ///
    /// * `config` - Bridge tuning
    /// * `metrics` - Prometheus handles to update, if any
    /// * `forwarder` - NAT port forwarder consulted on start and stop
    pub fn with_observers(
        config: MediaBridgeConfig,
        metrics: Option<MetricsContext>,
        forwarder: Arc<dyn PortForwarder>,
    ) -> Self {
        // ---
        let (frames, _) = broadcast::channel(config.sink_queue_frames.max(1));
        let inner = Inner {
            config,
            socket: ArcSwapOption::empty(),
            remote: ArcSwapOption::empty(),
            learned: ArcSwapOption::empty(),
            negotiated: RwLock::new(Negotiated {
                accepted: Vec::new(),
                outbound: PayloadCodec::Pcma,
            }),
            sink: RwLock::new(None),
            frames,
            outbound: tokio::sync::Mutex::new(OutboundStream::new()),
            shutdown: AtomicBool::new(false),
            last_rx_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            forwarded_port: AtomicU16::new(0),
            stats: MediaStats::new(),
            metrics,
            forwarder,
        };

        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the RTP socket and spawns the receive, delivery and stats tasks.
    ///
    /// Returns the bound port, to be offered in SDP.
    ///
    /// # Errors
    ///
    /// - `CallError::InvalidState` if the bridge was already started
    /// - `CallError::Socket` if no port could be bound
    pub async fn start(&self, bind_ip: IpAddr) -> CallResult<u16> {
        // ---
        if self.inner.socket.load().is_some() || self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(CallError::InvalidState(
                "media bridge already started".into(),
            ));
        }

        let socket = Arc::new(bind_rtp_socket(bind_ip, self.inner.config.port_range.clone()).await?);
        let port = socket.local_addr()?.port();
        self.inner.socket.store(Some(Arc::clone(&socket)));
        self.inner.touch();

        if self.inner.forwarder.forward(port, Protocol::Udp) {
            info!("Forwarded UDP port {} for RTP", port);
            self.inner.forwarded_port.store(port, Ordering::SeqCst);
        }

        // Subscribe before the receive loop can publish anything
        let frames_rx = self.inner.frames.subscribe();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(receive_loop(Arc::clone(&self.inner), socket)));
        tasks.push(tokio::spawn(deliver_frames(Arc::clone(&self.inner), frames_rx)));
        tasks.push(tokio::spawn(log_stats(Arc::clone(&self.inner))));

        info!("Media bridge listening on port {}", port);
        Ok(port)
    }

    /// Sets the negotiated remote media address.
    ///
    /// Until a packet has been received, outbound audio goes here.
    pub fn set_remote_endpoint(&self, addr: SocketAddr) {
        // ---
        info!("Remote RTP endpoint set to {}", addr);
        self.inner.remote.store(Some(Arc::new(addr)));
    }

    /// Restricts inbound payload types and picks the outbound codec.
    ///
    /// # Arguments
    ///
    /// * `payload_types` - Payload types from the remote answer, in its order
    pub fn set_negotiated_payload_types(&self, payload_types: &[u8]) {
        // ---
        let accepted: Vec<PayloadCodec> = payload_types
            .iter()
            .filter_map(|&pt| PayloadCodec::from_payload_type(pt))
            .collect();
        let outbound = PayloadCodec::negotiate(payload_types);
        info!(
            "Negotiated codecs {:?}, sending {}",
            accepted, outbound
        );
        *self.inner.negotiated.write() = Negotiated { accepted, outbound };
    }

    /// Registers the consumer of decoded caller audio.
    ///
    /// The sink runs on the delivery task, never on the receive loop.
    pub fn set_decoded_audio_sink(&self, sink: AudioSink) {
        // ---
        *self.inner.sink.write() = Some(sink);
    }

    /// Encodes and sends one chunk of AI audio, paced in real time.
    ///
    /// The chunk is resampled to the outbound codec's rate, encoded, split
    /// into `packet_duration` packets and sent one per packet interval. The
    /// first chunk of the stream is preceded by 100 ms of silence. Pacing is
    /// kept per stream, so back-to-back chunks never burst. Concurrent
    /// callers are serialised.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if the bridge is not running or no
    /// remote endpoint is known. Individual send failures are logged and
    /// counted, not returned.
    pub async fn send_ai_audio(&self, frame: AudioFrame) -> CallResult<()> {
        // ---
        let inner = &self.inner;
        let socket = inner
            .socket
            .load_full()
            .ok_or_else(|| CallError::InvalidState("media bridge not running".into()))?;
        let target = inner
            .outbound_target()
            .ok_or_else(|| CallError::InvalidState("no remote RTP endpoint".into()))?;

        if frame.is_empty() {
            return Ok(());
        }

        let mut stream = inner.outbound.lock().await;
        let codec = inner.negotiated.read().outbound;
        let ptime_ms = inner.config.packet_duration.as_millis().clamp(10, 20) as u32;
        let ptime = Duration::from_millis(ptime_ms as u64);

        let started = Instant::now();
        let encoded = stream.encoder.encode(codec, &frame.samples(), frame.sample_rate);
        if let Some(m) = &inner.metrics {
            m.encode_seconds.observe(started.elapsed().as_secs_f64());
        }
        if encoded.fell_back {
            inner.stats.codec_fallbacks.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &inner.metrics {
                m.codec_fallbacks_total.inc();
            }
        }

        let packet_bytes = encoded.codec.bytes_per_packet(ptime_ms);
        let mut payloads: Vec<Vec<u8>> = Vec::new();

        if !stream.primed {
            let silence_packets = (PRIMING_SILENCE.as_millis() as u32 / ptime_ms) as usize;
            let silence = silence_payload(&mut stream.encoder, encoded.codec, packet_bytes);
            payloads.extend(std::iter::repeat(silence).take(silence_packets));
            stream.primed = true;
            debug!(
                "Priming RTP path to {} with {} ms of silence",
                target,
                PRIMING_SILENCE.as_millis()
            );
        }

        for chunk in encoded.payload.chunks(packet_bytes) {
            let mut payload = chunk.to_vec();
            if let Some(fill) = encoded.codec.silence_byte() {
                payload.resize(packet_bytes, fill);
            }
            payloads.push(payload);
        }

        let mut marker = !stream.sent_any;
        for payload in payloads {
            // A stream that fell behind (the AI paused) restarts from now
            let now = tokio::time::Instant::now();
            let due = match stream.next_send {
                Some(due) if due > now => due,
                _ => now,
            };
            tokio::time::sleep_until(due).await;
            stream.next_send = Some(due + ptime);

            let ticks = payload.len() as u32;
            let packet = RtpPacket::new(
                encoded.codec.payload_type(),
                stream.sequence,
                stream.timestamp,
                stream.ssrc,
                payload,
            )
            .with_marker(marker);
            marker = false;

            match socket.send_to(&packet.serialize(), target).await {
                Ok(_) => {
                    inner.stats.record_sent(packet.payload.len());
                    if let Some(m) = &inner.metrics {
                        m.rtp_packets_sent_total.inc();
                        m.rtp_bytes_sent_total.inc_by(packet.payload.len() as u64);
                    }
                }
                Err(e) => {
                    warn!("Failed to send RTP packet to {}: {}", target, e);
                }
            }

            stream.sequence = stream.sequence.wrapping_add(1);
            stream.timestamp = stream.timestamp.wrapping_add(ticks);
            stream.sent_any = true;
        }

        Ok(())
    }

    /// Resolves once no packet has arrived for the configured silence window.
    ///
    /// The window counts from `start` until the first packet arrives.
    pub async fn wait_for_silence(&self) {
        // ---
        let window = self.inner.config.silence_timeout;
        loop {
            let idle = self.idle_for();
            if idle >= window {
                warn!("No RTP received for {:?}", idle);
                return;
            }
            tokio::time::sleep(window - idle).await;
        }
    }

    /// Time since the last accepted inbound packet.
    pub fn idle_for(&self) -> Duration {
        // ---
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        let last = self.inner.last_rx_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    /// Stops all tasks, closes the socket and clears endpoint state.
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        // ---
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let port = self.inner.forwarded_port.swap(0, Ordering::SeqCst);
        if port != 0 {
            self.inner.forwarder.remove(port, Protocol::Udp);
        }

        self.inner.socket.store(None);
        self.inner.learned.store(None);
        self.inner.remote.store(None);

        self.inner.stats.log();
        info!("Media bridge stopped");
    }

    pub fn is_running(&self) -> bool {
        // ---
        self.inner.socket.load().is_some() && !self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> Option<u16> {
        // ---
        self.inner
            .socket
            .load()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.inner.remote.load().as_deref().copied()
    }

    /// Endpoint learned from the first inbound packet.
    pub fn learned_endpoint(&self) -> Option<SocketAddr> {
        self.inner.learned.load().as_deref().copied()
    }

    /// Codec used for outbound audio.
    pub fn outbound_codec(&self) -> PayloadCodec {
        self.inner.negotiated.read().outbound
    }

    pub fn stats(&self) -> MediaStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One packet of silence in `codec`.
fn silence_payload(encoder: &mut Encoder, codec: PayloadCodec, packet_bytes: usize) -> Vec<u8> {
    // ---
    match codec.silence_byte() {
        Some(fill) => vec![fill; packet_bytes],
        None => {
            // G.722 packs two 16 kHz samples per byte
            let zeros = vec![0i16; packet_bytes * 2];
            encoder
                .encode_native(codec, &zeros)
                .unwrap_or_else(|_| vec![0; packet_bytes])
        }
    }
}

impl Inner {
    // ---
    fn touch(&self) {
        // ---
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_rx_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Learned endpoint if any, else the negotiated one.
    fn outbound_target(&self) -> Option<SocketAddr> {
        // ---
        self.learned
            .load()
            .as_deref()
            .copied()
            .or_else(|| self.remote.load().as_deref().copied())
    }

    /// Accepts `src` if it is the learned or negotiated endpoint, learning
    /// it when nothing has been learned yet.
    fn accept_source(&self, src: SocketAddr) -> bool {
        // ---
        match self.learned.load().as_deref() {
            Some(learned) if *learned == src => return true,
            Some(_) => {}
            None => {
                info!("Learned remote RTP endpoint {}", src);
                self.learned.store(Some(Arc::new(src)));
                return true;
            }
        }
        self.remote.load().as_deref() == Some(&src)
    }

    fn drop_packet(&self, reason: &str) {
        // ---
        if reason == drop_reason::UNKNOWN_SOURCE {
            self.stats.unknown_source.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(m) = &self.metrics {
            m.record_drop(reason);
        }
    }

    /// Filters, parses and buffers one datagram, then plays out whatever the
    /// jitter buffer releases.
    fn handle_datagram(
        &self,
        data: &[u8],
        src: SocketAddr,
        jitter: &mut JitterBuffer,
        decoder: &mut Decoder,
    ) {
        // ---
        if !self.accept_source(src) {
            trace!("Ignoring RTP from unknown source {}", src);
            self.drop_packet(drop_reason::UNKNOWN_SOURCE);
            return;
        }

        let packet = match RtpPacket::deserialize(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropped invalid RTP from {}: {}", src, e);
                self.drop_packet(drop_reason::MALFORMED);
                return;
            }
        };

        let codec = PayloadCodec::from_payload_type(packet.payload_type).filter(|c| {
            let negotiated = self.negotiated.read();
            negotiated.accepted.is_empty() || negotiated.accepted.contains(c)
        });
        if codec.is_none() {
            trace!("Dropped RTP with payload type {}", packet.payload_type);
            self.drop_packet(drop_reason::PAYLOAD_TYPE);
            return;
        }

        self.touch();
        self.stats.record_received(packet.sequence, packet.payload.len());
        if let Some(m) = &self.metrics {
            m.rtp_packets_received_total.inc();
            m.rtp_bytes_received_total.inc_by(packet.payload.len() as u64);
        }

        if jitter.insert(packet) == InsertOutcome::Late {
            self.stats.packets_late.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.rtp_packets_late_total.inc();
            }
        }

        while let Some(ready) = jitter.pop_ready() {
            self.play_out(ready, decoder);
        }
        if let Some(m) = &self.metrics {
            m.jitter_buffer_occupancy_packets.set(jitter.len() as i64);
        }
    }

    /// Decodes one packet and queues it for the sink.
    fn play_out(&self, packet: RtpPacket, decoder: &mut Decoder) {
        // ---
        let Some(codec) = PayloadCodec::from_payload_type(packet.payload_type) else {
            return;
        };

        let started = Instant::now();
        let mut pcm = decoder.decode(codec, &packet.payload);
        if self.config.enable_agc && codec != PayloadCodec::G722 {
            codec::apply_agc(&mut pcm);
        }
        let pcm = codec::resample(&pcm, codec.sample_rate(), self.config.ai_input_rate);
        if let Some(m) = &self.metrics {
            m.decode_seconds.observe(started.elapsed().as_secs_f64());
        }

        // No receiver only means nobody is listening yet
        let _ = self
            .frames
            .send(AudioFrame::from_samples(self.config.ai_input_rate, &pcm));
    }
}

async fn receive_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    // ---
    let mut jitter = JitterBuffer::new(inner.config.jitter.clone());
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    // Buffered audio is released once arrivals pause for a full window
    let idle_flush = inner.config.packet_duration * inner.config.jitter.depth_packets.max(1) as u32;

    debug!("RTP receive loop started");
    while !inner.shutdown.load(Ordering::SeqCst) {
        let poll = if jitter.is_empty() { RECV_POLL } else { idle_flush };
        match recv_with_timeout(&socket, &mut buf, poll).await {
            Ok(Some((len, src))) => {
                inner.handle_datagram(&buf[..len], src, &mut jitter, &mut decoder);
            }
            Ok(None) => {
                for packet in jitter.flush_idle(Instant::now(), idle_flush) {
                    inner.play_out(packet, &mut decoder);
                }
                if let Some(m) = &inner.metrics {
                    m.jitter_buffer_occupancy_packets.set(jitter.len() as i64);
                }
            }
            Err(e) if is_transient(&e) => {
                debug!("Transient RTP receive error: {}", e);
            }
            Err(e) => {
                error!("RTP receive loop failed: {}", e);
                break;
            }
        }
    }
    debug!("RTP receive loop exited");
}

async fn deliver_frames(inner: Arc<Inner>, mut frames: broadcast::Receiver<AudioFrame>) {
    // ---
    loop {
        match frames.recv().await {
            Ok(frame) => {
                let sink = inner.sink.read().clone();
                if let Some(sink) = sink {
                    sink(frame);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Audio sink lagging, dropped {} frames", skipped);
                inner.stats.sink_dropped.fetch_add(skipped, Ordering::Relaxed);
                if let Some(m) = &inner.metrics {
                    m.sink_frames_dropped_total.inc_by(skipped);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_stats(inner: Arc<Inner>) {
    // ---
    let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        inner.stats.log();
    }
}
