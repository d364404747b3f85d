//! SIP transactions against a scripted server on 127.0.0.1.

use signaling::digest::digest_response;
use signaling::message::header_param;
use signaling::{Dialog, DialogState, MethodKind, SipEngine, SipMessage, SipRequest, SipResponse};
use sipbridge_common::{CallError, Settings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const ANSWER_SDP: &str = "v=0\r\n\
    o=- 1 1 IN IP4 1.2.3.4\r\n\
    s=-\r\n\
    c=IN IP4 1.2.3.4\r\n\
    t=0 0\r\n\
    m=audio 40000 RTP/AVP 0\r\n";

struct FakeServer {
    socket: UdpSocket,
}

impl FakeServer {
    // ---
    async fn start() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.expect("server bind"),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().expect("addr").port()
    }

    async fn recv_message(&self) -> (SipMessage, SocketAddr) {
        // ---
        let mut buf = vec![0u8; 65535];
        let (len, from) = tokio::time::timeout(Duration::from_secs(3), self.socket.recv_from(&mut buf))
            .await
            .expect("server timed out waiting for a message")
            .expect("server recv");
        (SipMessage::parse(&buf[..len]).expect("engine sent valid SIP"), from)
    }

    async fn recv_request(&self) -> (SipRequest, SocketAddr) {
        // ---
        match self.recv_message().await {
            (SipMessage::Request(request), from) => (request, from),
            (SipMessage::Response(response), _) => panic!("expected request, got {}", response.status),
        }
    }

    async fn recv_response(&self) -> SipResponse {
        // ---
        match self.recv_message().await {
            (SipMessage::Response(response), _) => response,
            (SipMessage::Request(request), _) => panic!("expected response, got {}", request.method),
        }
    }

    /// True if nothing arrives within `wait`.
    async fn is_silent(&self, wait: Duration) -> bool {
        let mut buf = vec![0u8; 65535];
        tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .is_err()
    }

    async fn send(&self, message: &str, to: SocketAddr) {
        self.socket
            .send_to(message.as_bytes(), to)
            .await
            .expect("server send");
    }
}

fn settings(server_port: u16) -> Settings {
    // ---
    let mut settings = Settings::default();
    settings.sip.server = "127.0.0.1".into();
    settings.sip.port = server_port;
    settings.sip.username = "alice".into();
    settings.sip.password = "secret".into();
    settings.sip.local_port = 0;
    settings.sip.request_timeout = Duration::from_millis(500);
    settings.sip.answer_timeout = Duration::from_secs(1);
    settings.call.hangup_wait = Duration::from_millis(500);
    settings
}

async fn engine_for(server: &FakeServer) -> SipEngine {
    SipEngine::bind(&settings(server.port()), None, None)
        .await
        .expect("engine bind")
}

/// Response echoing the request's transaction headers.
fn reply(
    request: &SipRequest,
    status: u16,
    reason: &str,
    to_tag: Option<&str>,
    extra: &[(&str, &str)],
    body: &str,
) -> String {
    // ---
    let mut out = format!("SIP/2.0 {status} {reason}\r\n");
    for via in request.headers.get_all("Via") {
        out.push_str(&format!("Via: {via}\r\n"));
    }
    let to = request.headers.get("To").expect("To");
    let to = match to_tag {
        Some(tag) => format!("{to};tag={tag}"),
        None => to.to_string(),
    };
    out.push_str(&format!("From: {}\r\n", request.headers.get("From").expect("From")));
    out.push_str(&format!("To: {to}\r\n"));
    out.push_str(&format!("Call-ID: {}\r\n", request.call_id().expect("Call-ID")));
    out.push_str(&format!("CSeq: {}\r\n", request.headers.get("CSeq").expect("CSeq")));
    for (name, value) in extra {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out
}

fn branch(request: &SipRequest) -> String {
    // ---
    let via = request.headers.get("Via").expect("Via");
    header_param(via, "branch").expect("branch").to_string()
}

async fn expect_ack(server: &FakeServer, invite: &SipRequest) -> SipRequest {
    // ---
    let (ack, _) = server.recv_request().await;
    assert_eq!(ack.kind(), Some(MethodKind::Ack));
    assert_eq!(ack.call_id(), invite.call_id());
    assert_eq!(
        ack.cseq(),
        invite.cseq().map(|(n, _)| (n, MethodKind::Ack))
    );
    ack
}

/// Answers an unauthenticated INVITE with 180 then 200 + SDP.
async fn answer_call(server: &FakeServer, engine: &SipEngine) -> (Arc<Dialog>, SocketAddr) {
    // ---
    let script = async {
        let (invite, from) = server.recv_request().await;
        server.send(&reply(&invite, 180, "Ringing", None, &[], ""), from).await;
        server
            .send(
                &reply(
                    &invite,
                    200,
                    "OK",
                    Some("srv-tag"),
                    &[("Content-Type", "application/sdp")],
                    ANSWER_SDP,
                ),
                from,
            )
            .await;
        expect_ack(server, &invite).await;
        from
    };
    let (dialog, from) = tokio::join!(engine.dial("15551234567", 10000), script);
    (dialog.expect("call connects"), from)
}

#[tokio::test]
async fn test_register_with_digest_challenge() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (first, from) = server.recv_request().await;
        assert_eq!(first.kind(), Some(MethodKind::Register));
        assert_eq!(first.uri, "sip:127.0.0.1");
        assert_eq!(first.headers.get("Expires"), Some("3600"));
        assert_eq!(first.headers.get("Max-Forwards"), Some("70"));
        assert!(first.headers.get("Authorization").is_none());
        assert!(first.headers.get("Via").expect("Via").contains(";rport"));
        assert!(branch(&first).starts_with("z9hG4bK-"));
        assert_eq!(
            first.headers.get("User-Agent"),
            Some("Yealink SIP-T46S 66.85.0.5 ~00:1a:2b:3c:4d:5e")
        );

        server
            .send(
                &reply(
                    &first,
                    401,
                    "Unauthorized",
                    None,
                    &[("WWW-Authenticate", r#"Digest realm="zoho", nonce="abc""#)],
                    "",
                ),
                from,
            )
            .await;

        let (second, from) = server.recv_request().await;
        assert_eq!(second.call_id(), first.call_id());
        assert!(second.cseq().expect("CSeq").0 > first.cseq().expect("CSeq").0);
        assert_ne!(branch(&second), branch(&first));
        let auth = second.headers.get("Authorization").expect("Authorization");
        assert!(auth.contains(r#"username="alice""#));
        assert!(auth.contains(r#"uri="sip:127.0.0.1""#));
        assert!(auth.contains(r#"response="658c91aa12273f032747763b0cccf7cf""#));

        server.send(&reply(&second, 200, "OK", None, &[], ""), from).await;
    };

    let (result, ()) = tokio::join!(engine.register(), script);
    result.expect("registration succeeds");
    assert!(engine.is_registered());
}

#[tokio::test]
async fn test_register_twice_challenged_is_unauthorized() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        for _ in 0..2 {
            let (request, from) = server.recv_request().await;
            server
                .send(
                    &reply(
                        &request,
                        401,
                        "Unauthorized",
                        None,
                        &[("WWW-Authenticate", r#"Digest realm="zoho", nonce="abc""#)],
                        "",
                    ),
                    from,
                )
                .await;
        }
    };

    let (result, ()) = tokio::join!(engine.register(), script);
    assert!(matches!(result, Err(CallError::Unauthorized)));
    assert!(!engine.is_registered());
}

#[tokio::test]
async fn test_register_timeout() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let (result, _) = tokio::join!(engine.register(), server.recv_request());
    assert!(matches!(result, Err(CallError::Timeout(_))));
}

#[tokio::test]
async fn test_invite_with_proxy_auth() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (invite, from) = server.recv_request().await;
        assert_eq!(invite.kind(), Some(MethodKind::Invite));
        assert_eq!(invite.uri, "sip:15551234567@127.0.0.1");
        assert_eq!(invite.headers.get("Content-Type"), Some("application/sdp"));
        assert_eq!(invite.headers.get("Supported"), Some("timer,replaces"));
        assert!(invite.headers.get("From").expect("From").starts_with("\"AI Agent\" <sip:alice@127.0.0.1>;tag=tag-"));
        assert!(invite.body.contains("m=audio 10000 RTP/AVP 18 0 8 101"));
        assert!(invite.body.contains("a=sendrecv"));

        server.send(&reply(&invite, 100, "Trying", None, &[], ""), from).await;
        server
            .send(
                &reply(
                    &invite,
                    407,
                    "Proxy Authentication Required",
                    Some("proxy"),
                    &[("Proxy-Authenticate", r#"Digest realm="zoho", nonce="xyz""#)],
                    "",
                ),
                from,
            )
            .await;

        // Non-2xx final responses are acknowledged on the INVITE's branch
        let ack = expect_ack(&server, &invite).await;
        assert_eq!(branch(&ack), branch(&invite));

        let (authed, from) = server.recv_request().await;
        assert_eq!(authed.kind(), Some(MethodKind::Invite));
        assert_eq!(authed.call_id(), invite.call_id());
        assert_eq!(branch(&authed), format!("{}-auth", branch(&invite)));
        assert!(authed.cseq().expect("CSeq").0 > invite.cseq().expect("CSeq").0);

        let expected = digest_response(
            "alice",
            "zoho",
            "secret",
            "INVITE",
            "sip:15551234567@127.0.0.1",
            "xyz",
        );
        let auth = authed.headers.get("Proxy-Authorization").expect("Proxy-Authorization");
        assert!(auth.contains(&format!(r#"response="{expected}""#)));
        assert!(authed.headers.get("Authorization").is_none());

        server.send(&reply(&authed, 180, "Ringing", None, &[], ""), from).await;
        server
            .send(
                &reply(
                    &authed,
                    200,
                    "OK",
                    Some("srv-tag"),
                    &[("Content-Type", "application/sdp")],
                    ANSWER_SDP,
                ),
                from,
            )
            .await;

        let ack = expect_ack(&server, &authed).await;
        assert_eq!(branch(&ack), format!("{}-ack", branch(&invite)));
        assert!(ack.headers.get("To").expect("To").ends_with(";tag=srv-tag"));
    };

    let (result, ()) = tokio::join!(engine.dial("15551234567", 10000), script);
    let dialog = result.expect("call connects");

    assert_eq!(dialog.state(), DialogState::Connected);
    assert_eq!(
        dialog.remote_audio_endpoint(),
        Some("1.2.3.4:40000".parse().expect("addr"))
    );
    assert_eq!(dialog.remote_sdp().expect("sdp").audio.payload_types, vec![0]);
}

#[tokio::test]
async fn test_retransmitted_challenge_after_auth_is_ignored() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (invite, from) = server.recv_request().await;
        let challenge = reply(
            &invite,
            407,
            "Proxy Authentication Required",
            Some("proxy"),
            &[("Proxy-Authenticate", r#"Digest realm="zoho", nonce="xyz""#)],
            "",
        );
        server.send(&challenge, from).await;
        expect_ack(&server, &invite).await;

        let (authed, from) = server.recv_request().await;
        assert_eq!(branch(&authed), format!("{}-auth", branch(&invite)));

        // Proxy resends the original 407 after the authenticated INVITE
        server.send(&challenge, from).await;
        let stale_ack = expect_ack(&server, &invite).await;
        assert_eq!(branch(&stale_ack), branch(&invite));

        // A late rejection for the old CSeq is ignored as well
        server
            .send(&reply(&invite, 487, "Request Terminated", Some("proxy"), &[], ""), from)
            .await;
        expect_ack(&server, &invite).await;

        server.send(&reply(&authed, 180, "Ringing", None, &[], ""), from).await;
        server
            .send(
                &reply(
                    &authed,
                    200,
                    "OK",
                    Some("srv-tag"),
                    &[("Content-Type", "application/sdp")],
                    ANSWER_SDP,
                ),
                from,
            )
            .await;
        expect_ack(&server, &authed).await;
    };

    let (result, ()) = tokio::join!(engine.dial("15551234567", 10000), script);
    let dialog = result.expect("call connects despite the stale challenge");
    assert_eq!(dialog.state(), DialogState::Connected);
    assert!(dialog.failure().is_none());
}

#[tokio::test]
async fn test_remote_bye_ends_call() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;
    let (dialog, engine_addr) = answer_call(&server, &engine).await;

    let bye = format!(
        "BYE sip:alice@127.0.0.1:{port} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{server};branch=z9hG4bK-srvbye\r\n\
         From: <sip:15551234567@127.0.0.1>;tag=srv-tag\r\n\
         To: <sip:alice@127.0.0.1>;tag={tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 BYE\r\n\
         Content-Length: 0\r\n\r\n",
        port = engine_addr.port(),
        server = server.port(),
        tag = dialog.local_tag(),
        call_id = dialog.call_id(),
    );
    server.send(&bye, engine_addr).await;

    let ok = server.recv_response().await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.cseq(), Some((1, MethodKind::Bye)));
    assert_eq!(ok.call_id(), Some(dialog.call_id()));
    assert_eq!(ok.via_branch(), Some("z9hG4bK-srvbye"));

    let state = tokio::time::timeout(Duration::from_secs(1), dialog.terminated())
        .await
        .expect("dialog ends");
    assert_eq!(state, DialogState::Ended);

    // Already ended: hanging up again sends nothing
    engine.hangup(&dialog).await;
    assert!(server.is_silent(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_local_hangup_sends_bye() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;
    let (dialog, _) = answer_call(&server, &engine).await;

    let script = async {
        let (bye, from) = server.recv_request().await;
        assert_eq!(bye.kind(), Some(MethodKind::Bye));
        assert_eq!(bye.call_id(), Some(dialog.call_id()));
        assert!(branch(&bye).ends_with("-bye"));
        assert!(bye.headers.get("To").expect("To").ends_with(";tag=srv-tag"));
        server.send(&reply(&bye, 200, "OK", None, &[], ""), from).await;
    };
    tokio::join!(engine.hangup(&dialog), script);

    assert_eq!(dialog.state(), DialogState::Ended);
    engine.hangup(&dialog).await;
    assert!(server.is_silent(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_busy_rejection() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (invite, from) = server.recv_request().await;
        server.send(&reply(&invite, 100, "Trying", None, &[], ""), from).await;
        server
            .send(&reply(&invite, 486, "Busy Here", Some("busy"), &[], ""), from)
            .await;
        expect_ack(&server, &invite).await;
    };

    let (result, ()) = tokio::join!(engine.dial("15551234567", 10000), script);
    match result {
        Err(CallError::ProtocolFailure { code, reason }) => {
            assert_eq!(code, 486);
            assert_eq!(reason, "Busy Here");
        }
        other => panic!("expected 486 failure, got {:?}", other.map(|d| d.state())),
    }
}

#[tokio::test]
async fn test_invite_twice_challenged_is_unauthorized() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        for _ in 0..2 {
            let (invite, from) = server.recv_request().await;
            server
                .send(
                    &reply(
                        &invite,
                        407,
                        "Proxy Authentication Required",
                        Some("proxy"),
                        &[("Proxy-Authenticate", r#"Digest realm="zoho", nonce="xyz""#)],
                        "",
                    ),
                    from,
                )
                .await;
            expect_ack(&server, &invite).await;
        }
    };

    let (result, ()) = tokio::join!(engine.dial("15551234567", 10000), script);
    assert!(matches!(result, Err(CallError::Unauthorized)));
}

#[tokio::test]
async fn test_unanswered_call_is_cancelled() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (invite, from) = server.recv_request().await;
        server.send(&reply(&invite, 100, "Trying", None, &[], ""), from).await;

        let (cancel, _) = server.recv_request().await;
        assert_eq!(cancel.kind(), Some(MethodKind::Cancel));
        assert_eq!(branch(&cancel), branch(&invite));
        assert_eq!(
            cancel.cseq(),
            invite.cseq().map(|(n, _)| (n, MethodKind::Cancel))
        );
    };

    let (result, ()) = tokio::join!(engine.dial("15551234567", 10000), script);
    assert!(matches!(result, Err(CallError::Timeout(_))));
}

#[tokio::test]
async fn test_ringing_call_cancelled_on_request() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;

    let script = async {
        let (invite, from) = server.recv_request().await;
        server.send(&reply(&invite, 180, "Ringing", Some("callee"), &[], ""), from).await;

        let (cancel, _) = server.recv_request().await;
        assert_eq!(cancel.kind(), Some(MethodKind::Cancel));
        assert_eq!(branch(&cancel), branch(&invite));
        assert_eq!(
            cancel.cseq(),
            invite.cseq().map(|(n, _)| (n, MethodKind::Cancel))
        );

        // The INVITE is then terminated and that final response is ACKed
        server
            .send(&reply(&invite, 487, "Request Terminated", Some("callee"), &[], ""), from)
            .await;
        expect_ack(&server, &invite).await;
    };

    let started = std::time::Instant::now();
    let (result, ()) = tokio::join!(
        engine.dial_until("15551234567", 10000, tokio::time::sleep(Duration::from_millis(200))),
        script
    );
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_options_keepalive_answered() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;
    let engine_addr: SocketAddr = format!("127.0.0.1:{}", engine.local_port())
        .parse()
        .expect("addr");

    let options = format!(
        "OPTIONS sip:alice@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bK-ping\r\n\
         From: <sip:ping@127.0.0.1>;tag=p\r\n\
         To: <sip:alice@127.0.0.1>\r\n\
         Call-ID: ping-1\r\n\
         CSeq: 5 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
        server.port()
    );
    server.send(&options, engine_addr).await;

    let ok = server.recv_response().await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.cseq(), Some((5, MethodKind::Options)));
    assert!(ok.headers.get("Allow").expect("Allow").contains("INVITE"));
    assert_eq!(ok.headers.get("Accept"), Some("application/sdp"));
}

#[tokio::test]
async fn test_bye_for_unknown_call_ignored() {
    // ---
    let server = FakeServer::start().await;
    let engine = engine_for(&server).await;
    let engine_addr: SocketAddr = format!("127.0.0.1:{}", engine.local_port())
        .parse()
        .expect("addr");

    let bye = format!(
        "BYE sip:alice@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bK-x\r\n\
         From: <sip:x@127.0.0.1>;tag=x\r\n\
         To: <sip:alice@127.0.0.1>\r\n\
         Call-ID: nobody\r\n\
         CSeq: 1 BYE\r\n\r\n",
        server.port()
    );
    server.send(&bye, engine_addr).await;
    assert!(server.is_silent(Duration::from_millis(300)).await);
}
