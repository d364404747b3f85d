//! SIP message model, parser and builder.
//!
//! Messages are text: a start line, CRLF-separated headers, a blank line and
//! an optional body. The parser also accepts bare LF line endings; the
//! builder always emits CRLF.

use sipbridge_common::{CallError, CallResult};
use std::fmt;

/// Request methods this engine sends or answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl MethodKind {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            Self::Register => "REGISTER",
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Options => "OPTIONS",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        // ---
        match token.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(Self::Register),
            "INVITE" => Some(Self::Invite),
            "ACK" => Some(Self::Ack),
            "BYE" => Some(Self::Bye),
            "CANCEL" => Some(Self::Cancel),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods advertised in `Allow`.
pub const ALLOWED_METHODS: &str = "INVITE,ACK,OPTIONS,CANCEL,BYE,SUBSCRIBE,NOTIFY,INFO,REFER,UPDATE";

/// Expands RFC 3261 compact header names.
fn canonical_name(name: &str) -> &str {
    // ---
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        _ => name,
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Every value for `name`, in message order.
    ///
    /// The returned values borrow only from `self`, not from `name`.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        // ---
        let wanted = canonical_name(name).to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| canonical_name(n).eq_ignore_ascii_case(&wanted))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    /// Method token as received
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    // ---
    pub fn kind(&self) -> Option<MethodKind> {
        MethodKind::parse(&self.method)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, MethodKind)> {
        self.headers.get("CSeq").and_then(parse_cseq)
    }
}

/// An inbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    // ---
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq number and method, the key used to match a pending request.
    pub fn cseq(&self) -> Option<(u32, MethodKind)> {
        self.headers.get("CSeq").and_then(parse_cseq)
    }

    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `branch` parameter of the topmost Via.
    pub fn via_branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(|via| header_param(via, "branch"))
    }
}

/// A parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    // ---
    /// Parses one UDP datagram.
    ///
    /// # Errors
    ///
    /// Returns `CallError::MalformedMessage` if the datagram is not UTF-8,
    /// has no valid start line or a header line has no colon.
    pub fn parse(data: &[u8]) -> CallResult<Self> {
        // ---
        let text = std::str::from_utf8(data)
            .map_err(|_| CallError::MalformedMessage("not UTF-8".into()))?;

        let (head, body) = split_head_body(text);
        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));

        let start = lines
            .by_ref()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| CallError::MalformedMessage("empty message".into()))?;
        let headers = parse_headers(lines)?;

        // Content-Length bounds the body when present
        let body = match headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) if len <= body.len() => body.get(..len).unwrap_or(body),
            _ => body,
        }
        .to_string();

        if let Some(status_line) = start.strip_prefix("SIP/2.0 ") {
            let mut parts = status_line.splitn(2, ' ');
            let status = parts
                .next()
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|s| (100..700).contains(s))
                .ok_or_else(|| CallError::MalformedMessage(format!("bad status line: {start}")))?;
            let reason = parts.next().unwrap_or("").trim().to_string();
            return Ok(SipMessage::Response(SipResponse {
                status,
                reason,
                headers,
                body,
            }));
        }

        let mut parts = start.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(uri), Some("SIP/2.0")) => Ok(SipMessage::Request(SipRequest {
                method: method.to_string(),
                uri: uri.to_string(),
                headers,
                body,
            })),
            _ => Err(CallError::MalformedMessage(format!(
                "bad request line: {start}"
            ))),
        }
    }
}

fn split_head_body(text: &str) -> (&str, &str) {
    // ---
    if let Some(pos) = text.find("\r\n\r\n") {
        (&text[..pos], &text[pos + 4..])
    } else if let Some(pos) = text.find("\n\n") {
        (&text[..pos], &text[pos + 2..])
    } else {
        (text, "")
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> CallResult<Headers> {
    // ---
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Folded continuation line
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.entries.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CallError::MalformedMessage(format!("bad header: {line}")))?;
        headers.push(name.trim(), value.trim());
    }
    Ok(headers)
}

/// Parses `"12 INVITE"`.
pub fn parse_cseq(value: &str) -> Option<(u32, MethodKind)> {
    // ---
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse().ok()?;
    let method = MethodKind::parse(parts.next()?)?;
    Some((number, method))
}

/// Value of `;name=value` in a header such as Via, From or To.
///
/// Parameters inside `<...>` belong to the URI and are not searched.
pub fn header_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    // ---
    let params = match header.rfind('>') {
        Some(end) => &header[end + 1..],
        None => header,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// URI from a name-addr (`"Bob" <sip:bob@host>;tag=1`) or bare addr-spec.
pub fn header_uri(header: &str) -> &str {
    // ---
    match (header.find('<'), header.find('>')) {
        (Some(start), Some(end)) if start < end => &header[start + 1..end],
        _ => header.split(';').next().unwrap_or(header).trim(),
    }
}

/// Assembles an outbound request or response.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    start_line: String,
    headers: Headers,
    body: String,
}

impl MessageBuilder {
    // ---
    pub fn request(method: MethodKind, uri: &str) -> Self {
        // ---
        Self {
            start_line: format!("{method} {uri} SIP/2.0"),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Response echoing every Via, From, To, Call-ID and CSeq of `request`.
    pub fn response_to(request: &SipRequest, status: u16, reason: &str) -> Self {
        // ---
        let mut builder = Self {
            start_line: format!("SIP/2.0 {status} {reason}"),
            headers: Headers::new(),
            body: String::new(),
        };
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in request.headers.get_all(name) {
                builder.headers.push(name, value);
            }
        }
        builder
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    /// Adds `Content-Type` and the body.
    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        // ---
        self.headers.push("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// Renders the message with a trailing `Content-Length`.
    pub fn build(self) -> String {
        // ---
        let mut out = String::with_capacity(512 + self.body.len());
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const RESPONSE: &str = "SIP/2.0 401 Unauthorized\r\n\
        Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK-abc123;rport\r\n\
        From: <sip:alice@sip.example.com>;tag=tag-1234\r\n\
        To: <sip:alice@sip.example.com>;tag=srv\r\n\
        Call-ID: reg-1\r\n\
        CSeq: 1 REGISTER\r\n\
        WWW-Authenticate: Digest realm=\"zoho\", nonce=\"abc\"\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_response() {
        // ---
        let SipMessage::Response(resp) = SipMessage::parse(RESPONSE.as_bytes()).expect("parse")
        else {
            panic!("expected response");
        };

        assert_eq!(resp.status, 401);
        assert_eq!(resp.reason, "Unauthorized");
        assert_eq!(resp.cseq(), Some((1, MethodKind::Register)));
        assert_eq!(resp.call_id(), Some("reg-1"));
        assert_eq!(resp.via_branch(), Some("z9hG4bK-abc123"));
        assert_eq!(
            resp.headers.get("www-authenticate"),
            Some("Digest realm=\"zoho\", nonce=\"abc\"")
        );
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_parse_request_with_compact_headers_and_lf() {
        // ---
        let raw = "BYE sip:alice@10.0.0.2:5060 SIP/2.0\n\
                   v: SIP/2.0/UDP proxy;branch=z9hG4bK1\n\
                   v: SIP/2.0/UDP edge;branch=z9hG4bK2\n\
                   i: call-42\n\
                   CSeq: 7 BYE\n\
                   l: 0\n\n";
        let SipMessage::Request(req) = SipMessage::parse(raw.as_bytes()).expect("parse") else {
            panic!("expected request");
        };

        assert_eq!(req.kind(), Some(MethodKind::Bye));
        assert_eq!(req.uri, "sip:alice@10.0.0.2:5060");
        assert_eq!(req.call_id(), Some("call-42"));
        assert_eq!(req.headers.get_all("Via").count(), 2);
        assert_eq!(req.cseq(), Some((7, MethodKind::Bye)));
    }

    #[test]
    fn test_body_bounded_by_content_length() {
        // ---
        let raw = "SIP/2.0 200 OK\r\nCSeq: 2 INVITE\r\nContent-Length: 4\r\n\r\nv=0\ntrailing";
        let SipMessage::Response(resp) = SipMessage::parse(raw.as_bytes()).expect("parse") else {
            panic!("expected response");
        };
        assert_eq!(resp.body, "v=0\n");
    }

    #[test]
    fn test_folded_header() {
        // ---
        let raw = "SIP/2.0 200 OK\r\nSubject: first\r\n  second\r\n\r\n";
        let SipMessage::Response(resp) = SipMessage::parse(raw.as_bytes()).expect("parse") else {
            panic!("expected response");
        };
        assert_eq!(resp.headers.get("subject"), Some("first second"));
    }

    #[test]
    fn test_header_value_outlives_lookup_name() {
        // ---
        let mut headers = Headers::new();
        headers.push("i", "call-7");
        headers.push("Via", "SIP/2.0/UDP a;branch=z9hG4bK1");

        let value = {
            let name = String::from("CALL-ID");
            headers.get(&name)
        };
        assert_eq!(value, Some("call-7"));

        let vias: Vec<&str> = {
            let name = "via".to_string();
            headers.get_all(&name).collect()
        };
        assert_eq!(vias, vec!["SIP/2.0/UDP a;branch=z9hG4bK1"]);
    }

    #[test]
    fn test_malformed_rejected() {
        // ---
        for raw in [
            "",
            "hello world\r\n\r\n",
            "SIP/2.0 abc OK\r\n\r\n",
            "SIP/2.0 200 OK\r\nno colon here\r\n\r\n",
        ] {
            assert!(
                matches!(
                    SipMessage::parse(raw.as_bytes()),
                    Err(CallError::MalformedMessage(_))
                ),
                "accepted {raw:?}"
            );
        }
        assert!(SipMessage::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_header_param_and_uri() {
        // ---
        let from = "\"AI Agent\" <sip:alice@host;transport=udp>;tag=abc";
        assert_eq!(header_param(from, "tag"), Some("abc"));
        assert_eq!(header_param(from, "transport"), None);
        assert_eq!(header_uri(from), "sip:alice@host;transport=udp");
        assert_eq!(header_uri("sip:bob@host;tag=1"), "sip:bob@host");

        let via = "SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK-x;rport";
        assert_eq!(header_param(via, "branch"), Some("z9hG4bK-x"));
        assert_eq!(header_param(via, "rport"), Some(""));
    }

    #[test]
    fn test_builder_appends_content_length() {
        // ---
        let msg = MessageBuilder::request(MethodKind::Invite, "sip:1@h")
            .header("Call-ID", "c1")
            .body("application/sdp", "v=0\r\n")
            .build();
        assert_eq!(
            msg,
            "INVITE sip:1@h SIP/2.0\r\nCall-ID: c1\r\nContent-Type: application/sdp\r\n\
             Content-Length: 5\r\n\r\nv=0\r\n"
        );
    }

    #[test]
    fn test_response_echoes_dialog_headers() {
        // ---
        let raw = "BYE sip:a@h SIP/2.0\r\n\
                   Via: SIP/2.0/UDP p1;branch=b1\r\n\
                   Via: SIP/2.0/UDP p2;branch=b2\r\n\
                   From: <sip:b@h>;tag=r\r\n\
                   To: <sip:a@h>;tag=l\r\n\
                   Call-ID: c9\r\n\
                   CSeq: 3 BYE\r\n\
                   Max-Forwards: 70\r\n\r\n";
        let SipMessage::Request(req) = SipMessage::parse(raw.as_bytes()).expect("parse") else {
            panic!("expected request");
        };

        let reply = MessageBuilder::response_to(&req, 200, "OK").build();
        assert_eq!(
            reply,
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP p1;branch=b1\r\n\
             Via: SIP/2.0/UDP p2;branch=b2\r\n\
             From: <sip:b@h>;tag=r\r\n\
             To: <sip:a@h>;tag=l\r\n\
             Call-ID: c9\r\n\
             CSeq: 3 BYE\r\n\
             Content-Length: 0\r\n\r\n"
        );
    }
}
