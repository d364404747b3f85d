//! Per-call dialog state.
//!
//! The state lives in an atomic so the SIP receive loop never waits on a
//! reader. Everything else a dialog learns (remote tag, answer SDP, a
//! pending challenge) sits behind a short-lived `parking_lot` lock.

use crate::digest::AuthChallenge;
use crate::sdp::SdpSession;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Dialog lifecycle.
///
/// ```text
/// Idle -> Calling -> Ringing -> Connected -> Ended
///            |          |
///            +----------+-----> Failed | Ended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DialogState {
    Idle = 0,
    Calling = 1,
    Ringing = 2,
    Connected = 3,
    Failed = 4,
    Ended = 5,
}

impl DialogState {
    // ---
    fn from_u8(value: u8) -> Self {
        // ---
        match value {
            0 => Self::Idle,
            1 => Self::Calling,
            2 => Self::Ringing,
            3 => Self::Connected,
            4 => Self::Failed,
            _ => Self::Ended,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Ended)
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: DialogState) -> bool {
        // ---
        use DialogState::*;
        matches!(
            (self, next),
            (Idle, Calling)
                | (Calling, Ringing)
                | (Calling, Connected)
                | (Calling, Failed)
                | (Calling, Ended)
                | (Ringing, Connected)
                | (Ringing, Failed)
                | (Ringing, Ended)
                | (Connected, Ended)
        )
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            Self::Idle => "IDLE",
            Self::Calling => "CALLING",
            Self::Ringing => "RINGING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::Ended => "ENDED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct DialogData {
    /// `To` header of the answer, carrying the remote tag
    remote_to: Option<String>,
    remote_sdp: Option<SdpSession>,
    challenge: Option<AuthChallenge>,

    /// Via branch of the INVITE currently in flight
    invite_branch: Option<String>,

    failure: Option<(u16, String)>,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
}

/// One outbound call leg.
#[derive(Debug)]
pub struct Dialog {
    // ---
    call_id: String,
    local_tag: String,
    branch: String,
    target: String,
    target_uri: String,
    created_at: Instant,

    state: AtomicU8,

    /// CSeq of the INVITE currently in flight, 0 before the first one
    invite_cseq: AtomicU32,

    changed: Notify,
    data: Mutex<DialogData>,
}

impl Dialog {
    // ---
    /// Creates an idle dialog.
    ///
    /// # Arguments
    ///
    /// * `call_id` - Call-ID shared by every request in the dialog
    /// * `local_tag` - Our `From` tag
    /// * `branch` - Via branch of the first INVITE; ACK and BYE derive theirs from it
    /// * `target` - Number or user dialled
    /// * `target_uri` - Request-URI for INVITE, ACK and BYE
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        branch: impl Into<String>,
        target: impl Into<String>,
        target_uri: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            branch: branch.into(),
            target: target.into(),
            target_uri: target_uri.into(),
            created_at: Instant::now(),
            state: AtomicU8::new(DialogState::Idle as u8),
            invite_cseq: AtomicU32::new(0),
            changed: Notify::new(),
            data: Mutex::new(DialogData::default()),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> DialogState {
        DialogState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns the previous state on success. Illegal moves, including any
    /// move out of a terminal state, leave the dialog untouched and return
    /// `None`.
    pub fn transition(&self, next: DialogState) -> Option<DialogState> {
        // ---
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = DialogState::from_u8(current);
            if !from.can_transition_to(next) {
                return None;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // ---
                    {
                        let mut data = self.data.lock();
                        match next {
                            DialogState::Connected => data.connected_at = Some(Instant::now()),
                            DialogState::Ended | DialogState::Failed => {
                                data.ended_at = Some(Instant::now())
                            }
                            _ => {}
                        }
                    }
                    debug!("Dialog {}: {} -> {}", self.call_id, from, next);
                    self.changed.notify_waiters();
                    return Some(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Stores what the 2xx answer told us.
    pub fn record_answer(&self, remote_to: Option<String>, sdp: Option<SdpSession>) {
        // ---
        let mut data = self.data.lock();
        if remote_to.is_some() {
            data.remote_to = remote_to;
        }
        if sdp.is_some() {
            data.remote_sdp = sdp;
        }
    }

    /// Marks the dialog failed with the final response that ended it.
    pub fn fail(&self, code: u16, reason: impl Into<String>) -> bool {
        // ---
        if self.state().is_terminal() {
            return false;
        }
        self.data.lock().failure = Some((code, reason.into()));
        self.transition(DialogState::Failed).is_some()
    }

    /// Records the CSeq and branch of a newly sent INVITE.
    ///
    /// Final responses carrying any other CSeq belong to a superseded
    /// transaction and must not change the dialog. CANCEL reuses both.
    pub fn set_invite(&self, cseq: u32, branch: &str) {
        // ---
        self.data.lock().invite_branch = Some(branch.to_string());
        self.invite_cseq.store(cseq, Ordering::SeqCst);
    }

    pub fn invite_cseq(&self) -> u32 {
        self.invite_cseq.load(Ordering::SeqCst)
    }

    /// Branch of the INVITE in flight, the dialog branch before the first one.
    pub fn invite_branch(&self) -> String {
        // ---
        self.data
            .lock()
            .invite_branch
            .clone()
            .unwrap_or_else(|| self.branch.clone())
    }

    /// Whether a response with `cseq` answers the INVITE in flight.
    pub fn is_current_invite(&self, cseq: u32) -> bool {
        cseq == self.invite_cseq()
    }

    /// Parks a 401/407 challenge for the dialler to answer.
    pub fn store_challenge(&self, challenge: AuthChallenge) {
        // ---
        self.data.lock().challenge = Some(challenge);
        self.changed.notify_waiters();
    }

    pub fn take_challenge(&self) -> Option<AuthChallenge> {
        self.data.lock().challenge.take()
    }

    pub fn has_challenge(&self) -> bool {
        self.data.lock().challenge.is_some()
    }

    pub fn remote_to(&self) -> Option<String> {
        self.data.lock().remote_to.clone()
    }

    pub fn remote_sdp(&self) -> Option<SdpSession> {
        self.data.lock().remote_sdp.clone()
    }

    /// Negotiated remote RTP address from the answer.
    pub fn remote_audio_endpoint(&self) -> Option<SocketAddr> {
        self.data
            .lock()
            .remote_sdp
            .as_ref()
            .and_then(SdpSession::audio_endpoint)
    }

    pub fn failure(&self) -> Option<(u16, String)> {
        self.data.lock().failure.clone()
    }

    /// Time spent connected so far, or in total once ended.
    pub fn connected_duration(&self) -> Duration {
        // ---
        let data = self.data.lock();
        match data.connected_at {
            Some(start) => data
                .ended_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// Waits until `condition` holds or `timeout` elapses.
    ///
    /// Returns `true` if the condition held.
    pub async fn wait_for<F>(&self, condition: F, timeout: Duration) -> bool
    where
        F: Fn(&Dialog) -> bool,
    {
        // ---
        self.wait_until(condition, Some(Instant::now() + timeout))
            .await
    }

    /// Resolves once the dialog reaches a terminal state.
    pub async fn terminated(&self) -> DialogState {
        // ---
        self.wait_until(|d| d.state().is_terminal(), None).await;
        self.state()
    }

    async fn wait_until<F>(&self, condition: F, deadline: Option<Instant>) -> bool
    where
        F: Fn(&Dialog) -> bool,
    {
        // ---
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change in between is not missed
            notified.as_mut().enable();

            if condition(self) {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return condition(self);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    fn dialog() -> Dialog {
        Dialog::new("call-1", "tag-1", "z9hG4bK-1", "1001", "sip:1001@host")
    }

    const ALL: [DialogState; 6] = [
        DialogState::Idle,
        DialogState::Calling,
        DialogState::Ringing,
        DialogState::Connected,
        DialogState::Failed,
        DialogState::Ended,
    ];

    #[test]
    fn test_happy_path() {
        // ---
        let d = dialog();
        assert_eq!(d.transition(DialogState::Calling), Some(DialogState::Idle));
        assert_eq!(d.transition(DialogState::Ringing), Some(DialogState::Calling));
        assert_eq!(d.transition(DialogState::Connected), Some(DialogState::Ringing));
        assert_eq!(d.transition(DialogState::Ended), Some(DialogState::Connected));
        assert_eq!(d.state(), DialogState::Ended);
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        // ---
        for terminal in [DialogState::Failed, DialogState::Ended] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }

        let d = dialog();
        d.transition(DialogState::Calling);
        assert!(d.fail(486, "Busy Here"));
        assert_eq!(d.transition(DialogState::Connected), None);
        assert_eq!(d.transition(DialogState::Ended), None);
        assert!(!d.fail(500, "late"));
        assert_eq!(d.state(), DialogState::Failed);
    }

    #[test]
    fn test_no_backwards_moves() {
        // ---
        // Exhaustive walk: every accepted move goes forward in declaration order
        for from in ALL {
            for next in ALL {
                if from.can_transition_to(next) {
                    assert!((next as u8) > (from as u8), "{from} -> {next}");
                }
            }
        }
        assert!(!DialogState::Connected.can_transition_to(DialogState::Failed));
        assert!(!DialogState::Idle.can_transition_to(DialogState::Connected));
    }

    #[test]
    fn test_connected_duration() {
        // ---
        let d = dialog();
        assert_eq!(d.connected_duration(), Duration::ZERO);
        d.transition(DialogState::Calling);
        d.transition(DialogState::Connected);
        std::thread::sleep(Duration::from_millis(20));
        d.transition(DialogState::Ended);
        let total = d.connected_duration();
        assert!(total >= Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(d.connected_duration(), total);
    }

    #[test]
    fn test_invite_cseq_tracks_latest_transaction() {
        // ---
        let d = dialog();
        assert_eq!(d.invite_cseq(), 0);
        assert_eq!(d.invite_branch(), d.branch());

        d.set_invite(3, d.branch());
        assert!(d.is_current_invite(3));

        let auth_branch = format!("{}-auth", d.branch());
        d.set_invite(4, &auth_branch);
        assert!(!d.is_current_invite(3));
        assert!(d.is_current_invite(4));
        assert_eq!(d.invite_branch(), auth_branch);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_transition() {
        // ---
        let d = Arc::new(dialog());
        d.transition(DialogState::Calling);

        let waiter = {
            let d = d.clone();
            tokio::spawn(async move {
                d.wait_for(
                    |d| d.state() == DialogState::Connected,
                    Duration::from_secs(2),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        d.transition(DialogState::Connected);
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        // ---
        let d = dialog();
        let started = Instant::now();
        assert!(
            !d.wait_for(|d| d.state().is_terminal(), Duration::from_millis(50))
                .await
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_challenge_wakes_waiter() {
        // ---
        use crate::digest::{AuthChallenge, ChallengeKind};

        let d = Arc::new(dialog());
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.wait_for(Dialog::has_challenge, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let challenge = AuthChallenge::parse(ChallengeKind::Proxy, r#"Digest realm="r", nonce="n""#)
            .expect("challenge");
        d.store_challenge(challenge);

        assert!(waiter.await.expect("join"));
        assert!(d.take_challenge().is_some());
        assert!(!d.has_challenge());
    }
}
