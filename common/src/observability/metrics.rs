//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per process. Handles are cheap clones of the same
//! underlying collectors, so the SIP engine, every media bridge and the
//! orchestrator can each hold one.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

/// Reason label values for `rtp_packets_dropped_total`.
pub mod drop_reason {
    pub const MALFORMED: &str = "malformed";
    pub const PAYLOAD_TYPE: &str = "payload_type";
    pub const UNKNOWN_SOURCE: &str = "unknown_source";
    pub const DECODE: &str = "decode";
}

/// Prometheus registry and metric handles for signaling and media.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Signaling
    pub sip_requests_sent_total: IntCounter,
    pub sip_responses_received_total: IntCounter,
    pub sip_auth_challenges_total: IntCounter,
    pub calls_started_total: IntCounter,
    pub calls_connected_total: IntCounter,
    pub calls_failed_total: IntCounter,
    pub active_calls: IntGauge,

    // Media
    pub rtp_packets_sent_total: IntCounter,
    pub rtp_packets_received_total: IntCounter,
    pub rtp_bytes_sent_total: IntCounter,
    pub rtp_bytes_received_total: IntCounter,
    pub rtp_packets_dropped_total: IntCounterVec,
    pub rtp_packets_late_total: IntCounter,
    pub sink_frames_dropped_total: IntCounter,
    pub codec_fallbacks_total: IntCounter,
    pub jitter_buffer_occupancy_packets: IntGauge,

    // Latency (seconds)
    pub encode_seconds: Histogram,
    pub decode_seconds: Histogram,
    pub call_setup_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("sip_bridge".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| IntCounter::with_opts(Opts::new(name, help));
        let gauge = |name: &str, help: &str| IntGauge::with_opts(Opts::new(name, help));

        let ctx = Self {
            registry,
            sip_requests_sent_total: counter("sip_requests_sent_total", "SIP requests transmitted")?,
            sip_responses_received_total: counter(
                "sip_responses_received_total",
                "SIP responses received",
            )?,
            sip_auth_challenges_total: counter(
                "sip_auth_challenges_total",
                "401/407 digest challenges answered",
            )?,
            calls_started_total: counter("calls_started_total", "Outbound calls attempted")?,
            calls_connected_total: counter("calls_connected_total", "Calls that reached CONNECTED")?,
            calls_failed_total: counter("calls_failed_total", "Calls that ended in FAILED")?,
            active_calls: gauge("active_calls", "Calls currently in progress")?,
            rtp_packets_sent_total: counter("rtp_packets_sent_total", "RTP packets sent")?,
            rtp_packets_received_total: counter(
                "rtp_packets_received_total",
                "RTP packets received",
            )?,
            rtp_bytes_sent_total: counter("rtp_bytes_sent_total", "RTP payload bytes sent")?,
            rtp_bytes_received_total: counter(
                "rtp_bytes_received_total",
                "RTP payload bytes received",
            )?,
            rtp_packets_dropped_total: IntCounterVec::new(
                Opts::new("rtp_packets_dropped_total", "Inbound RTP packets discarded"),
                &["reason"],
            )?,
            rtp_packets_late_total: counter(
                "rtp_packets_late_total",
                "RTP packets that arrived behind the playout point",
            )?,
            sink_frames_dropped_total: counter(
                "sink_frames_dropped_total",
                "Decoded frames discarded because the AI sink fell behind",
            )?,
            codec_fallbacks_total: counter(
                "codec_fallbacks_total",
                "Encodes that fell back to A-law",
            )?,
            jitter_buffer_occupancy_packets: gauge(
                "jitter_buffer_occupancy_packets",
                "Current jitter buffer occupancy in packets",
            )?,
            encode_seconds: Histogram::with_opts(
                HistogramOpts::new("encode_seconds", "Outbound encode duration in seconds")
                    .buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01]),
            )?,
            decode_seconds: Histogram::with_opts(
                HistogramOpts::new("decode_seconds", "Inbound decode duration in seconds")
                    .buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01]),
            )?,
            call_setup_seconds: Histogram::with_opts(
                HistogramOpts::new("call_setup_seconds", "INVITE to CONNECTED in seconds")
                    .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
            )?,
        };

        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(ctx.sip_requests_sent_total.clone()),
            Box::new(ctx.sip_responses_received_total.clone()),
            Box::new(ctx.sip_auth_challenges_total.clone()),
            Box::new(ctx.calls_started_total.clone()),
            Box::new(ctx.calls_connected_total.clone()),
            Box::new(ctx.calls_failed_total.clone()),
            Box::new(ctx.active_calls.clone()),
            Box::new(ctx.rtp_packets_sent_total.clone()),
            Box::new(ctx.rtp_packets_received_total.clone()),
            Box::new(ctx.rtp_bytes_sent_total.clone()),
            Box::new(ctx.rtp_bytes_received_total.clone()),
            Box::new(ctx.rtp_packets_dropped_total.clone()),
            Box::new(ctx.rtp_packets_late_total.clone()),
            Box::new(ctx.sink_frames_dropped_total.clone()),
            Box::new(ctx.codec_fallbacks_total.clone()),
            Box::new(ctx.jitter_buffer_occupancy_packets.clone()),
            Box::new(ctx.encode_seconds.clone()),
            Box::new(ctx.decode_seconds.clone()),
            Box::new(ctx.call_setup_seconds.clone()),
        ];
        for collector in collectors {
            ctx.registry.register(collector)?;
        }

        Ok(ctx)
    }

    /// Counts one dropped inbound packet under `reason`.
    pub fn record_drop(&self, reason: &str) {
        // ---
        self.rtp_packets_dropped_total.with_label_values(&[reason]).inc();
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server for `GET /metrics` and `GET /healthz`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { Ok::<_, hyper::Error>(route(req, &registry)) }
                    }))
                }
            });

            let server = Server::try_bind(&cfg.bind)?.serve(make_svc);
            info!("Serving metrics on http://{}/metrics", cfg.bind);
            server.await?;
            Ok::<(), anyhow::Error>(())
        })
    }
}

fn route(req: Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                return plain(StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}"));
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        (&Method::GET, "/healthz") => plain(StatusCode::OK, "ok".into()),
        _ => plain(StatusCode::NOT_FOUND, "not found".into()),
    }
}

fn plain(status: StatusCode, body: String) -> Response<Body> {
    // ---
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.rtp_packets_received_total.inc();
        assert!(!ctx.gather().is_empty());
    }

    #[test]
    fn drop_reasons_are_labelled() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.record_drop(drop_reason::PAYLOAD_TYPE);
        ctx.record_drop(drop_reason::PAYLOAD_TYPE);
        ctx.record_drop(drop_reason::MALFORMED);

        let pt = ctx
            .rtp_packets_dropped_total
            .with_label_values(&[drop_reason::PAYLOAD_TYPE])
            .get();
        assert_eq!(pt, 2);
    }

    #[test]
    fn unknown_path_is_404() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .expect("request");
        assert_eq!(route(req, &ctx.registry).status(), StatusCode::NOT_FOUND);
    }
}
