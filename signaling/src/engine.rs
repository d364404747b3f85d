//! SIP transaction engine over UDP.
//!
//! One socket, one receive loop. Outbound requests register a single-use
//! completion handle keyed by `(CSeq, method)`; the loop resolves it and
//! also applies INVITE responses to the matching dialog. Inbound requests
//! are routed by Call-ID.

use crate::dialog::{Dialog, DialogState};
use crate::digest::{build_authorization, AuthChallenge, AuthHeaderValue, ChallengeKind};
use crate::message::{
    MessageBuilder, MethodKind, SipMessage, SipRequest, SipResponse, ALLOWED_METHODS,
};
use crate::sdp;
use parking_lot::Mutex;
use rand::Rng;
use sipbridge_common::{CallError, CallResult, MetricsContext, Settings};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receive timeout, so the loop notices shutdown.
const RECV_POLL: Duration = Duration::from_secs(1);

const MAX_MESSAGE: usize = 65_535;

/// Finished dialogs stay routable this long to absorb retransmissions.
const DIALOG_LINGER: Duration = Duration::from_secs(32);

type PendingKey = (u32, MethodKind);

struct EngineInner {
    // ---
    socket: UdpSocket,
    server_addr: SocketAddr,
    server_host: String,
    local_ip: IpAddr,
    local_port: u16,
    public_ip: Option<IpAddr>,

    username: String,
    password: String,
    display_name: String,
    user_agent: String,

    request_timeout: Duration,
    answer_timeout: Duration,
    hangup_wait: Duration,
    register_expires: u32,

    /// Engine-wide, so `(CSeq, method)` never repeats across dialogs
    cseq: AtomicU32,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<SipResponse>>>,
    dialogs: Mutex<HashMap<String, Arc<Dialog>>>,

    registered: AtomicBool,
    shutdown: AtomicBool,
    metrics: Option<MetricsContext>,
}

/// SIP user agent for one account.
pub struct SipEngine {
    inner: Arc<EngineInner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl SipEngine {
    // ---
    /// Resolves the server, binds the SIP socket and starts the receive loop.
    ///
    /// # Arguments
    ///
    /// * `settings` - Account, device identity and timeouts
    /// * `public_ip` - NAT public address for Via/Contact/SDP, if known
    /// * `metrics` - Prometheus handles to update, if any
    ///
    /// # Errors
    ///
    /// Returns `CallError::Socket` if the server name does not resolve to an
    /// IPv4 address or the local port cannot be bound.
    pub async fn bind(
        settings: &Settings,
        public_ip: Option<IpAddr>,
        metrics: Option<MetricsContext>,
    ) -> CallResult<Self> {
        // ---
        let sip = &settings.sip;
        let server_addr = resolve_server(&sip.server, sip.port).await?;
        let local_ip = discover_local_ip(server_addr);

        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip.local_port,
        ))
        .await?;
        let local_port = socket.local_addr()?.port();

        let inner = Arc::new(EngineInner {
            socket,
            server_addr,
            server_host: sip.server.clone(),
            local_ip,
            local_port,
            public_ip,
            username: sip.username.clone(),
            password: sip.password.clone(),
            display_name: sip.display_name().to_string(),
            user_agent: settings.device.user_agent(),
            request_timeout: sip.request_timeout,
            answer_timeout: sip.answer_timeout,
            hangup_wait: settings.call.hangup_wait,
            register_expires: sip.register_expires,
            cseq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            metrics,
        });

        let receiver = tokio::spawn(receive_loop(Arc::clone(&inner)));

        info!(
            "SIP engine on {}:{} -> {} (public {:?})",
            local_ip, local_port, server_addr, public_ip
        );

        Ok(Self {
            inner,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Address other parties should use to reach us.
    pub fn advertised_ip(&self) -> IpAddr {
        self.inner.advertised_ip()
    }

    pub fn local_ip(&self) -> IpAddr {
        self.inner.local_ip
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Registers the account, answering one digest challenge.
    ///
    /// # Errors
    ///
    /// - `CallError::Timeout` if an attempt gets no final response in time
    /// - `CallError::Unauthorized` if the authenticated attempt is challenged again
    /// - `CallError::MalformedChallenge` if the challenge cannot be answered
    /// - `CallError::ProtocolFailure` for any other final error response
    pub async fn register(&self) -> CallResult<()> {
        // ---
        let inner = &self.inner;
        let call_id = format!("reg-{}-{}", random_id(), unix_time());
        let tag = random_tag();
        let uri = format!("sip:{}", inner.server_host);
        let mut authorization: Option<AuthHeaderValue> = None;

        loop {
            let cseq = inner.next_cseq();
            let request = MessageBuilder::request(MethodKind::Register, &uri)
                .header("Via", inner.via(&random_branch()))
                .header("Max-Forwards", "70")
                .header("Contact", inner.contact())
                .header("To", format!("<sip:{}@{}>", inner.username, inner.server_host))
                .header(
                    "From",
                    format!("<sip:{}@{}>;tag={}", inner.username, inner.server_host, tag),
                )
                .header("Call-ID", call_id.as_str())
                .header("CSeq", format!("{cseq} REGISTER"))
                .header("Expires", inner.register_expires.to_string())
                .header("User-Agent", inner.user_agent.as_str());
            let request = match &authorization {
                Some(auth) => request.header(auth.name, auth.value.as_str()),
                None => request,
            };

            info!("Sending REGISTER (CSeq {})", cseq);
            let response = inner
                .transact(
                    (cseq, MethodKind::Register),
                    &request.build(),
                    inner.request_timeout,
                )
                .await?;

            match response.status {
                200..=299 => {
                    inner.registered.store(true, Ordering::SeqCst);
                    info!("Registered {}@{}", inner.username, inner.server_host);
                    return Ok(());
                }
                401 | 407 if authorization.is_some() => {
                    warn!("REGISTER challenged again after authenticating");
                    return Err(CallError::Unauthorized);
                }
                401 | 407 => {
                    inner.count_challenge();
                    let challenge = parse_challenge(&response)?;
                    debug!("REGISTER challenged by realm {}", challenge.realm);
                    authorization = Some(build_authorization(
                        "REGISTER",
                        &uri,
                        &challenge,
                        &inner.username,
                        &inner.password,
                    ));
                }
                code => {
                    warn!("REGISTER rejected: {} {}", code, response.reason);
                    return Err(CallError::ProtocolFailure {
                        code,
                        reason: response.reason,
                    });
                }
            }
        }
    }

    /// Places a call and waits until it is answered.
    ///
    /// The media bridge must already be listening on `rtp_port`, which is
    /// offered in the SDP.
    ///
    /// # Arguments
    ///
    /// * `target` - Number or user at the configured server, or a full `sip:` URI
    /// * `rtp_port` - Local RTP port to offer
    ///
    /// # Errors
    ///
    /// - `CallError::Timeout` if the server never responds, or nobody answers
    ///   within the answer timeout (a CANCEL is sent)
    /// - `CallError::Unauthorized` if the authenticated INVITE is challenged again
    /// - `CallError::ProtocolFailure` with the final response code otherwise
    pub async fn dial(&self, target: &str, rtp_port: u16) -> CallResult<Arc<Dialog>> {
        self.dial_until(target, rtp_port, std::future::pending()).await
    }

    /// Like [`SipEngine::dial`], abandoning the attempt when `cancel` resolves.
    ///
    /// A call still ringing is cancelled with CANCEL on the INVITE's branch
    /// and CSeq. One that connected at the same moment is hung up instead.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Cancelled` when `cancel` wins, otherwise the same
    /// errors as [`SipEngine::dial`].
    pub async fn dial_until<F>(
        &self,
        target: &str,
        rtp_port: u16,
        cancel: F,
    ) -> CallResult<Arc<Dialog>>
    where
        F: Future<Output = ()>,
    {
        // ---
        let inner = &self.inner;
        let target_uri = if target.starts_with("sip:") {
            target.to_string()
        } else {
            format!("sip:{}@{}", target, inner.server_host)
        };
        let dialog = Arc::new(Dialog::new(
            format!("call-{}-{}", random_id(), unix_time()),
            random_tag(),
            random_branch(),
            target,
            target_uri,
        ));

        inner
            .dialogs
            .lock()
            .insert(dialog.call_id().to_string(), Arc::clone(&dialog));
        if let Some(m) = &inner.metrics {
            m.calls_started_total.inc();
        }
        inner.advance(&dialog, DialogState::Calling);
        info!("Calling {} (Call-ID {})", dialog.target_uri(), dialog.call_id());

        tokio::pin!(cancel);
        let outcome = tokio::select! {
            outcome = inner.run_invite(&dialog, rtp_port) => outcome,
            _ = &mut cancel => {
                inner.abandon_invite(&dialog).await;
                Err(CallError::Cancelled)
            }
        };

        match outcome {
            Ok(()) => Ok(dialog),
            Err(e) => {
                warn!("Call to {} failed: {}", dialog.target(), e);
                inner.fail_dialog(&dialog, 500, "Call setup failed");
                self.retire(&dialog);
                Err(e)
            }
        }
    }

    /// Ends a call.
    ///
    /// Sends BYE when the call was connected or ringing and waits briefly
    /// for its response. Calling it again, or after the remote side hung up,
    /// does nothing.
    pub async fn hangup(&self, dialog: &Dialog) {
        // ---
        let inner = &self.inner;
        match inner.advance(dialog, DialogState::Ended) {
            Some(DialogState::Connected) | Some(DialogState::Ringing) => {
                inner.send_bye(dialog).await;
            }
            Some(previous) => {
                debug!("Call {} ended locally while {}", dialog.call_id(), previous);
            }
            None => {
                debug!(
                    "Hangup ignored for call {} in state {}",
                    dialog.call_id(),
                    dialog.state()
                );
            }
        }
        self.retire(dialog);
    }

    /// Stops the receive loop. Safe to call more than once.
    pub fn shutdown(&self) {
        // ---
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
        self.inner.pending.lock().clear();
        info!("SIP engine stopped");
    }

    /// Forgets a finished dialog once retransmissions have had time to settle.
    fn retire(&self, dialog: &Dialog) {
        // ---
        let inner = Arc::downgrade(&self.inner);
        let call_id = dialog.call_id().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DIALOG_LINGER).await;
            if let Some(inner) = inner.upgrade() {
                inner.dialogs.lock().remove(&call_id);
            }
        });
    }
}

impl Drop for SipEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineInner {
    // ---
    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst)
    }

    fn advertised_ip(&self) -> IpAddr {
        self.public_ip.unwrap_or(self.local_ip)
    }

    fn via(&self, branch: &str) -> String {
        // ---
        let mut via = format!(
            "SIP/2.0/UDP {}:{};branch={};rport",
            self.local_ip, self.local_port, branch
        );
        if let Some(public) = self.public_ip {
            via.push_str(&format!(";received={public}"));
        }
        via
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{}@{}:{}>",
            self.username,
            self.advertised_ip(),
            self.local_port
        )
    }

    /// `From` for dialog requests, with display name.
    fn dialog_from(&self, dialog: &Dialog) -> String {
        format!(
            "\"{}\" <sip:{}@{}>;tag={}",
            self.display_name,
            self.username,
            self.server_host,
            dialog.local_tag()
        )
    }

    /// `To` for in-dialog requests: the answer's To when known.
    fn dialog_to(&self, dialog: &Dialog) -> String {
        dialog
            .remote_to()
            .unwrap_or_else(|| format!("<{}>", dialog.target_uri()))
    }

    fn dialog_request(
        &self,
        method: MethodKind,
        dialog: &Dialog,
        branch: &str,
        cseq: u32,
        to: &str,
    ) -> MessageBuilder {
        // ---
        MessageBuilder::request(method, dialog.target_uri())
            .header("Via", self.via(branch))
            .header("Max-Forwards", "70")
            .header("Contact", self.contact())
            .header("To", to)
            .header("From", self.dialog_from(dialog))
            .header("Call-ID", dialog.call_id())
            .header("CSeq", format!("{} {}", cseq, method))
    }

    async fn send_request(&self, message: &str) -> CallResult<()> {
        // ---
        self.socket
            .send_to(message.as_bytes(), self.server_addr)
            .await?;
        if let Some(m) = &self.metrics {
            m.sip_requests_sent_total.inc();
        }
        debug!("Sent {}", message.lines().next().unwrap_or_default());
        Ok(())
    }

    /// Sends a request and waits for the response that resolves it.
    ///
    /// INVITE resolves on its first response (including 100); every other
    /// method on its first final response.
    async fn transact(
        &self,
        key: PendingKey,
        message: &str,
        wait: Duration,
    ) -> CallResult<SipResponse> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);

        if let Err(e) = self.send_request(message).await {
            self.pending.lock().remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().remove(&key);
                Err(CallError::Timeout(format!("response to {} (CSeq {})", key.1, key.0)))
            }
        }
    }

    async fn run_invite(&self, dialog: &Dialog, rtp_port: u16) -> CallResult<()> {
        // ---
        let offer = sdp::build_offer(self.advertised_ip(), rtp_port);
        let deadline = Instant::now() + self.answer_timeout;
        let mut branch = dialog.branch().to_string();
        let mut cseq = self.next_cseq();
        let mut authenticated = false;

        let to = format!("<{}>", dialog.target_uri());
        let invite = |branch: &str, cseq: u32, auth: Option<&AuthHeaderValue>| {
            let request = self
                .dialog_request(MethodKind::Invite, dialog, branch, cseq, &to)
                .header("Allow", ALLOWED_METHODS)
                .header("Accept", "application/sdp")
                .header("User-Agent", self.user_agent.as_str())
                .header("Supported", "timer,replaces");
            let request = match auth {
                Some(auth) => request.header(auth.name, auth.value.as_str()),
                None => request,
            };
            request.body("application/sdp", offer.as_str()).build()
        };

        dialog.set_invite(cseq, &branch);
        self.transact(
            (cseq, MethodKind::Invite),
            &invite(&branch, cseq, None),
            self.request_timeout,
        )
        .await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let settled = dialog
                .wait_for(
                    |d| {
                        d.has_challenge()
                            || matches!(
                                d.state(),
                                DialogState::Connected | DialogState::Failed | DialogState::Ended
                            )
                    },
                    remaining,
                )
                .await;

            if !settled {
                warn!("No answer from {} within {:?}", dialog.target(), self.answer_timeout);
                self.send_cancel(dialog, &branch, cseq).await;
                self.fail_dialog(dialog, 408, "Request Timeout");
                return Err(CallError::Timeout(format!("answer from {}", dialog.target())));
            }

            if let Some(challenge) = dialog.take_challenge() {
                if authenticated {
                    warn!("INVITE challenged again after authenticating");
                    let code = match challenge.kind {
                        ChallengeKind::Www => 401,
                        ChallengeKind::Proxy => 407,
                    };
                    self.fail_dialog(dialog, code, "Unauthorized");
                    return Err(CallError::Unauthorized);
                }
                authenticated = true;
                debug!("INVITE challenged by realm {}", challenge.realm);

                let auth = build_authorization(
                    "INVITE",
                    dialog.target_uri(),
                    &challenge,
                    &self.username,
                    &self.password,
                );
                branch = format!("{}-auth", dialog.branch());
                cseq = self.next_cseq();
                dialog.set_invite(cseq, &branch);
                self.transact(
                    (cseq, MethodKind::Invite),
                    &invite(&branch, cseq, Some(&auth)),
                    self.request_timeout,
                )
                .await?;
                continue;
            }

            return match dialog.state() {
                DialogState::Connected => Ok(()),
                DialogState::Failed => {
                    let (code, reason) = dialog
                        .failure()
                        .unwrap_or_else(|| (500, "Call failed".to_string()));
                    Err(CallError::ProtocolFailure { code, reason })
                }
                state => Err(CallError::InvalidState(format!(
                    "call {} while waiting for answer",
                    state
                ))),
            };
        }
    }

    /// Stops an INVITE whose dial was abandoned.
    async fn abandon_invite(&self, dialog: &Dialog) {
        // ---
        let cseq = dialog.invite_cseq();
        self.pending.lock().remove(&(cseq, MethodKind::Invite));

        match self.advance(dialog, DialogState::Ended) {
            Some(DialogState::Calling) | Some(DialogState::Ringing) => {
                info!("Cancelling call {}", dialog.call_id());
                if cseq != 0 {
                    self.send_cancel(dialog, &dialog.invite_branch(), cseq).await;
                }
            }
            Some(DialogState::Connected) => self.send_bye(dialog).await,
            _ => {}
        }
    }

    async fn send_ack(&self, dialog: &Dialog, cseq: u32, branch: &str, to: &str) {
        // ---
        let ack = self
            .dialog_request(MethodKind::Ack, dialog, branch, cseq, to)
            .header("User-Agent", self.user_agent.as_str())
            .build();
        if let Err(e) = self.send_request(&ack).await {
            warn!("Failed to send ACK for {}: {}", dialog.call_id(), e);
        }
    }

    async fn send_cancel(&self, dialog: &Dialog, branch: &str, cseq: u32) {
        // ---
        let to = format!("<{}>", dialog.target_uri());
        let cancel = self
            .dialog_request(MethodKind::Cancel, dialog, branch, cseq, &to)
            .header("User-Agent", self.user_agent.as_str())
            .build();
        if let Err(e) = self.send_request(&cancel).await {
            warn!("Failed to send CANCEL for {}: {}", dialog.call_id(), e);
        }
    }

    async fn send_bye(&self, dialog: &Dialog) {
        // ---
        let cseq = self.next_cseq();
        let branch = format!("{}-bye", dialog.branch());
        let bye = self
            .dialog_request(MethodKind::Bye, dialog, &branch, cseq, &self.dialog_to(dialog))
            .header("User-Agent", self.user_agent.as_str())
            .build();

        info!("Sending BYE for {}", dialog.call_id());
        match self
            .transact((cseq, MethodKind::Bye), &bye, self.hangup_wait)
            .await
        {
            Ok(response) => debug!("BYE answered: {} {}", response.status, response.reason),
            Err(e) => warn!("BYE for {} not confirmed: {}", dialog.call_id(), e),
        }
    }

    /// Applies a transition and keeps the call metrics in step.
    fn advance(&self, dialog: &Dialog, next: DialogState) -> Option<DialogState> {
        // ---
        let previous = dialog.transition(next)?;
        info!("Call {}: {} -> {}", dialog.call_id(), previous, next);

        if let Some(m) = &self.metrics {
            match next {
                DialogState::Connected => {
                    m.calls_connected_total.inc();
                    m.active_calls.inc();
                    m.call_setup_seconds
                        .observe(dialog.created_at().elapsed().as_secs_f64());
                }
                DialogState::Failed => m.calls_failed_total.inc(),
                DialogState::Ended if previous == DialogState::Connected => m.active_calls.dec(),
                _ => {}
            }
        }
        Some(previous)
    }

    fn fail_dialog(&self, dialog: &Dialog, code: u16, reason: &str) {
        // ---
        if dialog.fail(code, reason) {
            info!("Call {}: FAILED ({} {})", dialog.call_id(), code, reason);
            if let Some(m) = &self.metrics {
                m.calls_failed_total.inc();
            }
        }
    }

    fn count_challenge(&self) {
        if let Some(m) = &self.metrics {
            m.sip_auth_challenges_total.inc();
        }
    }

    fn find_dialog(&self, call_id: Option<&str>) -> Option<Arc<Dialog>> {
        let call_id = call_id?;
        self.dialogs.lock().get(call_id).cloned()
    }

    async fn handle_response(&self, response: SipResponse) {
        // ---
        if let Some(m) = &self.metrics {
            m.sip_responses_received_total.inc();
        }
        let Some(key) = response.cseq() else {
            warn!("Dropping {} response without CSeq", response.status);
            return;
        };
        debug!(
            "Received {} {} for {} {}",
            response.status, response.reason, key.0, key.1
        );

        if key.1 == MethodKind::Invite {
            if let Some(dialog) = self.find_dialog(response.call_id()) {
                self.apply_invite_response(&dialog, &response, key.0).await;
            }
        } else if response.is_provisional() {
            return;
        }

        let waiter = self.pending.lock().remove(&key);
        if let Some(waiter) = waiter {
            let _ = waiter.send(response);
        }
    }

    async fn apply_invite_response(&self, dialog: &Dialog, response: &SipResponse, cseq: u32) {
        // ---
        match response.status {
            100 => {}
            101..=199 => {
                self.advance(dialog, DialogState::Ringing);
            }
            200..=299 => {
                let answer = sdp::parse(&response.body);
                if answer.is_none() {
                    warn!("Answer for {} carried no usable SDP", dialog.call_id());
                }
                dialog.record_answer(response.headers.get("To").map(str::to_string), answer);
                self.advance(dialog, DialogState::Connected);

                // Retransmitted 2xx is acknowledged again
                let branch = format!("{}-ack", dialog.branch());
                self.send_ack(dialog, cseq, &branch, &self.dialog_to(dialog))
                    .await;
            }
            300..=699 if !dialog.is_current_invite(cseq) => {
                // Retransmission for a superseded INVITE; the ACK stops it
                self.ack_failure(dialog, response, cseq).await;
                debug!(
                    "Ignoring stale {} for {} (CSeq {}, current {})",
                    response.status,
                    dialog.call_id(),
                    cseq,
                    dialog.invite_cseq()
                );
            }
            401 | 407 => {
                self.ack_failure(dialog, response, cseq).await;
                self.count_challenge();
                match parse_challenge(response) {
                    Ok(challenge) => dialog.store_challenge(challenge),
                    Err(e) => {
                        warn!("Unusable INVITE challenge: {}", e);
                        self.fail_dialog(dialog, response.status, &response.reason);
                    }
                }
            }
            code => {
                self.ack_failure(dialog, response, cseq).await;
                warn!(
                    "Call {} rejected: {} {}",
                    dialog.call_id(),
                    code,
                    response.reason
                );
                self.fail_dialog(dialog, code, &response.reason);
            }
        }
    }

    /// ACK for a non-2xx final response: same branch as the INVITE.
    async fn ack_failure(&self, dialog: &Dialog, response: &SipResponse, cseq: u32) {
        // ---
        let branch = response.via_branch().unwrap_or(dialog.branch()).to_string();
        let to = response
            .headers
            .get("To")
            .map(str::to_string)
            .unwrap_or_else(|| format!("<{}>", dialog.target_uri()));
        self.send_ack(dialog, cseq, &branch, &to).await;
    }

    async fn handle_request(&self, request: SipRequest, from: SocketAddr) {
        // ---
        let Some(kind) = request.kind() else {
            debug!("Ignoring {} from {}", request.method, from);
            return;
        };

        match kind {
            MethodKind::Options => {
                let reply = MessageBuilder::response_to(&request, 200, "OK")
                    .header("Allow", ALLOWED_METHODS)
                    .header("Accept", "application/sdp")
                    .header("User-Agent", self.user_agent.as_str())
                    .build();
                self.reply(&reply, from).await;
            }
            MethodKind::Bye | MethodKind::Cancel => {
                let Some(dialog) = self.find_dialog(request.call_id()) else {
                    debug!("{} for unknown call {:?}", kind, request.call_id());
                    return;
                };
                let reply = MessageBuilder::response_to(&request, 200, "OK").build();
                self.reply(&reply, from).await;
                info!("Remote {} for call {}", kind, dialog.call_id());
                self.advance(&dialog, DialogState::Ended);
            }
            MethodKind::Ack => {}
            MethodKind::Invite | MethodKind::Register => {
                debug!("Ignoring inbound {} (Call-ID {:?})", kind, request.call_id());
            }
        }
    }

    async fn reply(&self, message: &str, to: SocketAddr) {
        // ---
        if let Err(e) = self.socket.send_to(message.as_bytes(), to).await {
            warn!("Failed to reply to {}: {}", to, e);
        }
    }
}

async fn receive_loop(inner: Arc<EngineInner>) {
    // ---
    let mut buf = vec![0u8; MAX_MESSAGE];

    while !inner.shutdown.load(Ordering::SeqCst) {
        let (len, from) =
            match tokio::time::timeout(RECV_POLL, inner.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("Transient SIP receive error: {}", e);
                    continue;
                }
                Ok(Err(e)) => {
                    error!("SIP socket failed: {}", e);
                    break;
                }
            };

        match SipMessage::parse(&buf[..len]) {
            Ok(SipMessage::Response(response)) => inner.handle_response(response).await,
            Ok(SipMessage::Request(request)) => inner.handle_request(request, from).await,
            Err(e) => warn!("Dropping datagram from {}: {}", from, e),
        }
    }
    debug!("SIP receive loop exited");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn parse_challenge(response: &SipResponse) -> CallResult<AuthChallenge> {
    // ---
    let kind = ChallengeKind::from_status(response.status).ok_or_else(|| {
        CallError::MalformedChallenge(format!("status {} is not a challenge", response.status))
    })?;
    let header = response
        .headers
        .get(kind.challenge_header())
        .ok_or_else(|| {
            CallError::MalformedChallenge(format!("{} missing", kind.challenge_header()))
        })?;
    AuthChallenge::parse(kind, header)
}

async fn resolve_server(host: &str, port: u16) -> CallResult<SocketAddr> {
    // ---
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
        CallError::Socket(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no IPv4 address for {host}"),
        ))
    })
}

/// Local address the OS would route to `server` from; nothing is sent.
fn discover_local_ip(server: SocketAddr) -> IpAddr {
    // ---
    let routed = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(server)?;
        Ok(socket.local_addr()?.ip())
    };
    match routed() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            warn!("Local IP discovery failed ({}), using 127.0.0.1", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn random_id() -> u32 {
    rand::thread_rng().gen_range(100_000..=999_999)
}

fn random_tag() -> String {
    format!("tag-{}", rand::thread_rng().gen_range(1000..=9999))
}

fn random_branch() -> String {
    format!("z9hG4bK-{}", random_id())
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
