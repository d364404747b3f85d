//! SIP AI bridge - CLI binary.
//!
//! Registers a SIP account posing as a desk phone, optionally places one
//! call and bridges its audio to a scripted AI channel.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use caller::{AiAudioChannel, CallOrchestrator, PublicIpDiscovery, ScriptedChannel};
use signaling::SipEngine;
use sipbridge_common::{
    init_tracing, CallError, ColorWhen, MetricsContext, MetricsServerConfig, Settings,
};

/// SIP AI Bridge - Place calls and bridge their audio to an AI agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// SIP registrar/proxy host
    #[arg(long, env = "SIP_SERVER")]
    server: String,

    /// SIP server port
    #[arg(long, env = "SIP_PORT", default_value = "5060")]
    sip_port: u16,

    /// SIP account user name
    #[arg(short, long, env = "SIP_USERNAME")]
    username: String,

    /// SIP account password
    #[arg(long, env = "SIP_PASSWORD", hide_env_values = true)]
    password: String,

    /// Display name shown to the called party
    #[arg(long, env = "SIP_ACCOUNT_LABEL")]
    account_label: Option<String>,

    /// Local SIP port (0 picks an ephemeral port)
    #[arg(long, default_value = "5060")]
    local_port: u16,

    /// Lowest RTP port to try
    #[arg(long, default_value = "10000")]
    rtp_port_min: u16,

    /// Highest RTP port to try
    #[arg(long, default_value = "10100")]
    rtp_port_max: u16,

    /// Skip the fixed RTP range and bind an ephemeral port
    #[arg(long)]
    no_fixed_rtp_port: bool,

    /// Public address to advertise when behind NAT
    #[arg(long, env = "PUBLIC_IP")]
    public_ip: Option<IpAddr>,

    /// Look up the public address over HTTP when none is given
    #[arg(long)]
    discover_public_ip: bool,

    /// Hang up connected calls after this many seconds
    #[arg(long, default_value = "300")]
    max_duration_secs: u64,

    /// Hang up after this many seconds without caller audio
    #[arg(long, default_value = "120")]
    silence_timeout_secs: u64,

    /// WAV prompt to play into the call (defaults to a 1 kHz test tone)
    #[arg(long)]
    prompt: Option<PathBuf>,

    /// Hang up once the prompt has been played
    #[arg(long)]
    hang_up_after_prompt: bool,

    /// Record the caller's audio to this WAV file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Do not register before dialing
    #[arg(long)]
    skip_register: bool,

    /// Number or SIP URI to call; register only when omitted
    target: Option<String>,

    /// Phone model presented in the User-Agent
    #[arg(long, default_value = "SIP-T46S")]
    device_model: String,

    /// Firmware version presented in the User-Agent
    #[arg(long, default_value = "66.85.0.5")]
    device_firmware: String,

    /// MAC address presented in the User-Agent
    #[arg(long, default_value = "00:1a:2b:3c:4d:5e")]
    device_mac: String,

    /// Replace the generated User-Agent entirely
    #[arg(long)]
    user_agent: Option<String>,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    // ---
    fn settings(&self) -> Settings {
        // ---
        let mut settings = Settings::default();

        settings.sip.server = self.server.clone();
        settings.sip.port = self.sip_port;
        settings.sip.username = self.username.clone();
        settings.sip.password = self.password.clone();
        settings.sip.account_label = self.account_label.clone();
        settings.sip.local_port = self.local_port;

        settings.device.model = self.device_model.clone();
        settings.device.firmware = self.device_firmware.clone();
        settings.device.mac_address = self.device_mac.clone();
        settings.device.custom_user_agent = self.user_agent.clone();

        settings.media.rtp_port_min = self.rtp_port_min;
        settings.media.rtp_port_max = self.rtp_port_max;
        settings.media.use_fixed_rtp_port = !self.no_fixed_rtp_port;
        settings.media.silence_timeout = Duration::from_secs(self.silence_timeout_secs);

        settings.call.max_call_duration = Duration::from_secs(self.max_duration_secs);
        settings.call.public_ip = self.public_ip;
        settings.call.discover_public_ip = self.discover_public_ip;

        settings
    }

    fn channel(&self, sample_rate: u32) -> Result<ScriptedChannel> {
        // ---
        let channel = match &self.prompt {
            Some(path) => ScriptedChannel::from_wav(path, sample_rate)
                .with_context(|| format!("failed to load prompt {}", path.display()))?,
            None => ScriptedChannel::test_tone(sample_rate),
        };
        let channel = channel.hang_up_after_prompt(self.hang_up_after_prompt);
        Ok(match &self.record {
            Some(path) => channel.record_to(path),
            None => channel,
        })
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color, args.verbose)?;
    info!("Starting SIP AI bridge v{VERSION}");

    let settings = args.settings();
    settings.validate().context("invalid configuration")?;
    info!("Account: {}@{}:{}", settings.sip.username, settings.sip.server, settings.sip.port);
    info!("User-Agent: {}", settings.device.user_agent());

    let metrics = MetricsContext::new("caller")?;
    if let Some(bind) = args.metrics_bind {
        info!("Metrics bind: {}", bind);
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
    }

    let public_ip = PublicIpDiscovery::from_settings(&settings.call).discover().await;
    let engine = SipEngine::bind(&settings, public_ip, Some(metrics.clone()))
        .await
        .context("failed to start SIP engine")?;
    let engine = Arc::new(engine);

    if args.skip_register {
        warn!("Skipping registration");
    } else {
        engine.register().await.context("registration failed")?;
    }

    let Some(target) = &args.target else {
        info!("Registered; no target given, exiting");
        engine.shutdown();
        return Ok(());
    };

    let channel: Arc<dyn AiAudioChannel> = Arc::new(args.channel(settings.media.ai_output_rate)?);
    let orchestrator = CallOrchestrator::new(settings.clone(), Arc::clone(&engine), Some(metrics));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = orchestrator.place_call(target, channel, shutdown).await;
    engine.shutdown();

    match outcome {
        Ok(summary) => info!("Done: {}", summary),
        Err(CallError::Cancelled) => info!("Call to {} cancelled before answer", target),
        Err(e) => return Err(e).with_context(|| format!("call to {target} failed")),
    }
    Ok(())
}
