//! SIP transaction controller
//!
//! [`SipClient`] owns one dialog at a time: identity configuration, the
//! bound UDP transport, the leased source port and all dialog-scoped
//! state (CSeq, Call-ID, tags, route set). `send` drives one request
//! through the send/receive/retry/ACK cycle and returns the final
//! status; `listen` is the minimal single-call inbound mode.

use crate::auth::DigestChallenge;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{self, OutboundReply, OutboundRequest, SipMessage};
use crate::ports::{FileRegistry, LeaseService};
use crate::transport::{Transport, UdpTransport};
use bytes::Bytes;
use rand::Rng;
use std::net::IpAddr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// CSeq counter start value for a fresh dialog.
const CSEQ_BASE: u32 = 20;
/// Largest datagram the client will accept.
const MAX_DATAGRAM: usize = 65_535;
/// Additional receive attempts while responses stay provisional.
const PROVISIONAL_ATTEMPTS: u32 = 3;
/// Receive attempts for the INVITE's terminating response after a
/// CANCEL was answered with 200.
const CANCEL_WAIT_ATTEMPTS: u32 = 3;
/// Non-matching inbound requests tolerated by `listen` outside server
/// mode.
const LISTEN_MISMATCH_LIMIT: u32 = 5;

/// A SIP user-agent client bound to one source address and port.
pub struct SipClient {
    config: ClientConfig,
    transport: Box<dyn Transport>,
    lease: Option<(Box<dyn LeaseService>, u16)>,
    src_ip: IpAddr,
    src_port: u16,

    // identity / target configuration
    method: Option<String>,
    uri: Option<String>,
    host: Option<String>,
    port: u16,
    proxy: Option<(String, u16)>,
    from: Option<String>,
    from_user: Option<String>,
    to: Option<String>,
    contact: Option<String>,
    body: Option<String>,
    content_type: Option<String>,

    // dialog state
    cseq: u32,
    call_id: Option<String>,
    from_tag: Option<String>,
    to_tag: Option<String>,
    routes: Vec<String>,
    remote_contact: Option<String>,
    via: Option<String>,
    rx_msg: Option<String>,
    last_rx: Option<SipMessage>,
    status: Option<String>,
    auth: Option<(String, String)>,
    extra_headers: Vec<String>,

    // fields learned from the last inbound request (listen mode)
    req_vias: Vec<String>,
    req_record_routes: Vec<String>,
    req_from: Option<String>,
    req_from_tag: Option<String>,
    req_to: Option<String>,
    req_to_tag: Option<String>,
    req_cseq: Option<(u32, String)>,
}

impl SipClient {
    /// Create a client: resolve the source address, lease a source port
    /// (unless a fixed one is configured) and bind the UDP transport.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let src_ip = resolve_source_ip(&config)?;

        let (lease, requested_port): (Option<(Box<dyn LeaseService>, u16)>, u16) =
            match config.fixed_port {
                Some(port) => (None, port),
                None => {
                    let registry =
                        FileRegistry::new(&config.registry_path, config.persistent_registry);
                    let port = registry.acquire(config.min_port..=config.max_port)?;
                    (Some((Box::new(registry), port)), port)
                }
            };

        let transport = match UdpTransport::bind(
            src_ip,
            requested_port,
            config.final_response_timer,
            config.send_timeout,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                // No partial lease is left behind on failure.
                if let Some((service, port)) = &lease {
                    let _ = service.release(*port);
                }
                return Err(e);
            }
        };

        Ok(Self::assemble(config, Box::new(transport), src_ip, lease))
    }

    /// Create a client over a caller-supplied transport. No port is
    /// leased; the transport is taken as already bound.
    pub fn with_transport(config: ClientConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let src_ip = resolve_source_ip(&config)?;
        Ok(Self::assemble(config, transport, src_ip, None))
    }

    fn assemble(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        src_ip: IpAddr,
        lease: Option<(Box<dyn LeaseService>, u16)>,
    ) -> Self {
        let src_port = transport.local_port();
        Self {
            config,
            transport,
            lease,
            src_ip,
            src_port,
            method: None,
            uri: None,
            host: None,
            port: 5060,
            proxy: None,
            from: None,
            from_user: None,
            to: None,
            contact: None,
            body: None,
            content_type: None,
            cseq: CSEQ_BASE,
            call_id: None,
            from_tag: None,
            to_tag: None,
            routes: Vec::new(),
            remote_contact: None,
            via: None,
            rx_msg: None,
            last_rx: None,
            status: None,
            auth: None,
            extra_headers: Vec::new(),
            req_vias: Vec::new(),
            req_record_routes: Vec::new(),
            req_from: None,
            req_from_tag: None,
            req_to: None,
            req_to_tag: None,
            req_cseq: None,
        }
    }

    // --- configuration -------------------------------------------------

    pub fn set_method(&mut self, method: &str) -> Result<()> {
        if !ClientConfig::is_allowed_method(method) {
            return Err(Error::Configuration(format!("invalid method {method}")));
        }
        self.method = Some(method.to_string());
        Ok(())
    }

    /// Set the From identity. Bare URIs are wrapped in angle brackets;
    /// the user part feeds the default Contact.
    pub fn set_from(&mut self, from: &str) -> Result<()> {
        let from = from.trim();
        let wrapped = if from.ends_with('>') && from.contains('<') {
            from.to_string()
        } else {
            format!("<{from}>")
        };

        let lower = wrapped.to_ascii_lowercase();
        let user = lower
            .find("sip:")
            .map(|pos| &wrapped[pos + 4..])
            .and_then(|rest| rest.split_once('@'))
            .map(|(user, _)| user.to_string())
            .ok_or_else(|| Error::Configuration("failed to parse From username".to_string()))?;

        self.from = Some(wrapped);
        self.from_user = Some(user);
        Ok(())
    }

    /// Set the request target. Derives the destination host and port and
    /// defaults the To header when it is not set yet.
    pub fn set_uri(&mut self, uri: &str) -> Result<()> {
        if !uri.contains("sip:") {
            return Err(Error::Configuration("only sip: URIs are supported".to_string()));
        }
        if self.proxy.is_none() && uri.contains("transport=tcp") {
            return Err(Error::Configuration("only UDP transport is supported".to_string()));
        }

        self.uri = Some(uri.to_string());
        if self.to.is_none() {
            self.to = Some(format!("<{uri}>"));
        }

        let bare = uri.split(';').next().unwrap_or(uri);
        let after_scheme = match bare.find("sip:") {
            Some(pos) => &bare[pos + 4..],
            None => bare,
        };
        let host_part = after_scheme.rsplit('@').next().unwrap_or(after_scheme);
        let (host, port) = match host_part.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::Configuration(format!("invalid port in URI {uri}"))
                })?;
                (host, port)
            }
            None => (host_part, 5060),
        };
        if host.is_empty() {
            return Err(Error::Configuration(format!("failed to parse URI {uri}")));
        }
        self.host = Some(host.to_string());
        self.port = port;
        Ok(())
    }

    pub fn set_to(&mut self, to: &str) {
        let to = to.trim();
        self.to = if to.ends_with('>') && to.contains('<') {
            Some(to.to_string())
        } else {
            Some(format!("<{to}>"))
        };
    }

    /// Route everything through an outbound proxy, `host` or
    /// `host:port`.
    pub fn set_proxy(&mut self, proxy: &str) -> Result<()> {
        let (host, port) = match proxy.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Configuration(format!("invalid proxy {proxy}")))?;
                (host, port)
            }
            None => (proxy, 5060),
        };
        self.proxy = Some((host.to_string(), port));
        Ok(())
    }

    pub fn set_username(&mut self, username: &str) {
        self.config.username = Some(username.to_string());
    }

    pub fn set_password(&mut self, password: &str) {
        self.config.password = Some(password.to_string());
    }

    pub fn set_user_agent(&mut self, user_agent: &str) {
        self.config.user_agent = user_agent.to_string();
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.config.debug = debug;
    }

    /// Explicit Contact value, overriding the generated default.
    pub fn set_contact(&mut self, contact: &str) {
        self.contact = Some(contact.to_string());
    }

    pub fn set_body(&mut self, body: &str) {
        self.body = Some(body.to_string());
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    /// Add a one-shot header, cleared after the next completed exchange.
    pub fn add_header(&mut self, header: &str) {
        self.extra_headers.push(header.to_string());
    }

    /// Convenience for the common `Expires` one-shot header.
    pub fn set_expires(&mut self, seconds: u32) {
        self.add_header(&format!("Expires: {seconds}"));
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn src_ip(&self) -> IpAddr {
        self.src_ip
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    /// Last raw inbound message, if any.
    pub fn rx_message(&self) -> Option<&str> {
        self.rx_msg.as_deref()
    }

    // --- outbound state machine ----------------------------------------

    /// Send the configured request and drive it to a final status.
    ///
    /// Handles the bounded provisional wait, a single digest-auth
    /// resend on 401/407, ACK emission for INVITE and the CANCEL
    /// follow-up wait. Returns the final status code as a string, or a
    /// synthesized description when the final-response timer expires.
    pub async fn send(&mut self) -> Result<String> {
        if self.from.is_none() {
            return Err(Error::Configuration("missing From".to_string()));
        }
        let method = self
            .method
            .clone()
            .ok_or_else(|| Error::Configuration("missing method".to_string()))?;
        if self.uri.is_none() {
            return Err(Error::Configuration("missing URI".to_string()));
        }

        self.status = None;
        let data = self.format_request()?;
        self.send_data(&data).await?;
        self.receive_final().await?;

        if matches!(self.status.as_deref(), Some("401") | Some("407")) {
            let code = self.status.clone().unwrap_or_default();
            self.cseq += 1;
            self.apply_auth_challenge(&code)?;
            let data = self.format_request()?;
            self.send_data(&data).await?;
            self.receive_final().await?;
            // A second challenge is not re-authenticated; its code is
            // returned as final.
        }

        if method == "INVITE" {
            if let Some(code) = self.numeric_status() {
                if code >= 200 {
                    self.send_ack(code).await?;
                }
            }
        }

        if method == "CANCEL" && self.status.as_deref() == Some("200") {
            self.await_invite_termination().await?;
        }

        self.extra_headers.clear();
        self.auth = None;
        self.cseq += 1;

        Ok(self.status.clone().unwrap_or_default())
    }

    /// One receive plus the bounded provisional wait. Settles on
    /// whatever ends the loop; the last observed code stands.
    async fn receive_final(&mut self) -> Result<()> {
        self.read_message().await?;
        let mut attempts = 0;
        while attempts < PROVISIONAL_ATTEMPTS && self.status_class() == Some(1) {
            self.read_message().await?;
            attempts += 1;
        }
        Ok(())
    }

    async fn read_message(&mut self) -> Result<()> {
        match self.transport.receive(MAX_DATAGRAM).await? {
            None => {
                self.rx_msg = None;
                self.status = Some(format!(
                    "no final response in {} seconds",
                    self.config.final_response_timer.as_secs()
                ));
                Ok(())
            }
            Some(raw) => {
                self.log_rx(&raw);
                if let Some(msg) = SipMessage::parse(&raw) {
                    self.absorb_response(&msg);
                    self.last_rx = Some(msg);
                }
                self.rx_msg = Some(raw);
                Ok(())
            }
        }
    }

    /// Fold a parsed response into dialog state.
    fn absorb_response(&mut self, msg: &SipMessage) {
        let Some(code) = msg.status_code() else {
            return;
        };
        self.status = Some(code.to_string());

        for route in msg.record_routes() {
            if !self.routes.contains(&route) {
                self.routes.push(route);
            }
        }
        if self.to_tag.is_none() {
            self.to_tag = msg.to_tag();
        }
        if let Some(contact) = msg.contact() {
            self.remote_contact = Some(contact);
        }
    }

    fn apply_auth_challenge(&mut self, code: &str) -> Result<()> {
        let username = self
            .config
            .username
            .clone()
            .ok_or_else(|| Error::Configuration("missing auth username".to_string()))?;
        let password = self
            .config
            .password
            .clone()
            .ok_or_else(|| Error::Configuration("missing auth password".to_string()))?;

        let (challenge_header, auth_header) = if code == "401" {
            ("WWW-Authenticate", "Authorization")
        } else {
            ("Proxy-Authenticate", "Proxy-Authorization")
        };

        let challenge = self
            .last_rx
            .as_ref()
            .and_then(|msg| msg.headers().get(challenge_header))
            .ok_or_else(|| {
                Error::Protocol(format!("no {challenge_header} challenge in {code} response"))
            })?
            .to_string();

        let method = self.method.clone().unwrap_or_default();
        let uri = self.uri.clone().unwrap_or_default();
        let value =
            DigestChallenge::parse(&challenge)?.authorization_value(&username, &password, &method, &uri);

        debug!("Answering {} challenge for {}", challenge_header, username);
        self.auth = Some((auth_header.to_string(), value));
        Ok(())
    }

    fn format_request(&mut self) -> Result<String> {
        let method = self
            .method
            .clone()
            .ok_or_else(|| Error::Configuration("missing method".to_string()))?;
        let uri = self
            .uri
            .clone()
            .ok_or_else(|| Error::Configuration("missing URI".to_string()))?;
        let from = self
            .from
            .clone()
            .ok_or_else(|| Error::Configuration("missing From".to_string()))?;
        let to = self.to.clone().unwrap_or_else(|| format!("<{uri}>"));

        // CANCEL must travel in the cancelled transaction: same Via
        // branch, same CSeq number, no Route.
        let via = if method == "CANCEL" {
            match &self.via {
                Some(via) => via.clone(),
                None => self.fresh_via(),
            }
        } else {
            let via = self.fresh_via();
            self.via = Some(via.clone());
            via
        };
        let cseq = if method == "CANCEL" {
            self.cseq - 1
        } else {
            self.cseq
        };

        let from_tag = self.ensure_from_tag();
        let call_id = self.ensure_call_id();

        let request = OutboundRequest {
            method,
            uri,
            via,
            routes: self.routes.clone(),
            from,
            from_tag,
            to,
            to_tag: self.to_tag.clone(),
            auth: self.auth.clone(),
            call_id,
            cseq,
            contact: self.contact_value(),
            content_type: self.content_type.clone(),
            user_agent: self.config.user_agent.clone(),
            extra_headers: self.extra_headers.clone(),
            body: self.body.clone(),
        };
        Ok(request.render())
    }

    async fn send_ack(&mut self, code: u16) -> Result<()> {
        let uri = self
            .uri
            .clone()
            .ok_or_else(|| Error::Configuration("missing URI".to_string()))?;
        // 2xx is acknowledged at the contact the far end announced;
        // failures go back to the original request target.
        let target = if code == 200 {
            self.remote_contact.clone().unwrap_or_else(|| uri.clone())
        } else {
            uri
        };

        let mut extra_headers = Vec::new();
        if code == 200 {
            if let Some((_, value)) = &self.auth {
                extra_headers.push(format!("Proxy-Authorization: {value}"));
            }
        }

        let via = self.fresh_via();
        let from_tag = self.ensure_from_tag();
        let call_id = self.ensure_call_id();
        let from = self.from.clone().unwrap_or_default();
        let to = self.to.clone().unwrap_or_default();

        let ack = OutboundRequest {
            method: "ACK".to_string(),
            uri: target,
            via,
            routes: self.routes.clone(),
            from,
            from_tag,
            to,
            to_tag: self.to_tag.clone(),
            auth: None,
            call_id,
            cseq: self.cseq,
            contact: self.contact_value(),
            content_type: None,
            user_agent: self.config.user_agent.clone(),
            extra_headers,
            body: None,
        };
        self.send_data(&ack.render()).await
    }

    /// 200 to a CANCEL only acknowledges the CANCEL itself; the INVITE
    /// still terminates with its own final response.
    async fn await_invite_termination(&mut self) -> Result<()> {
        let cancel_status = self.status.clone();
        for _ in 0..CANCEL_WAIT_ATTEMPTS {
            self.read_message().await?;
            match self.numeric_status() {
                None => {
                    // Timer expired; the CANCEL's own 200 stands.
                    self.status = cancel_status;
                    return Ok(());
                }
                Some(code) if code >= 300 => return Ok(()),
                Some(_) => continue,
            }
        }
        Ok(())
    }

    // --- inbound mode ---------------------------------------------------

    /// Block until an inbound request matching one of `expected`
    /// arrives; returns its method. In server mode non-matching
    /// requests are answered with 200 OK and listening continues;
    /// otherwise a bounded number of mismatches is a protocol error.
    pub async fn listen(&mut self, expected: &[&str]) -> Result<String> {
        let mut mismatches = 0;
        loop {
            let raw = match self.transport.receive(MAX_DATAGRAM).await? {
                None => {
                    return Err(Error::Protocol(
                        "no matching inbound request before the receive timer expired"
                            .to_string(),
                    ))
                }
                Some(raw) => raw,
            };
            self.log_rx(&raw);
            self.rx_msg = Some(raw.clone());

            let Some(msg) = SipMessage::parse(&raw) else {
                continue;
            };
            let SipMessage::Request { ref method, .. } = msg else {
                continue;
            };
            let method = method.clone();
            self.absorb_request(&msg);
            self.last_rx = Some(msg);

            if expected.contains(&method.as_str()) {
                info!("Matched inbound {} request", method);
                return Ok(method);
            }

            if self.config.server_mode {
                self.reply(200, "OK").await?;
                continue;
            }

            mismatches += 1;
            if mismatches >= LISTEN_MISMATCH_LIMIT {
                return Err(Error::Protocol(format!(
                    "unexpected inbound method {method} after {LISTEN_MISMATCH_LIMIT} requests"
                )));
            }
        }
    }

    /// Learn dialog fields from an inbound request.
    fn absorb_request(&mut self, msg: &SipMessage) {
        self.req_vias = msg.vias();
        self.req_record_routes = msg.record_routes();
        for route in msg.record_routes() {
            if !self.routes.contains(&route) {
                self.routes.push(route);
            }
        }
        self.req_from = msg.from_value();
        self.req_from_tag = msg.from_tag();
        self.req_to = msg.to_value();
        self.req_to_tag = msg.to_tag().or_else(|| Some(generate_tag()));
        self.req_cseq = msg.cseq();
        if self.call_id.is_none() {
            self.call_id = msg.call_id();
        }
    }

    /// Reply to the last inbound request.
    pub async fn reply(&mut self, code: u16, reason: &str) -> Result<()> {
        let (cseq, cseq_method) = self
            .req_cseq
            .clone()
            .ok_or_else(|| Error::Protocol("no inbound request to reply to".to_string()))?;

        let reply = OutboundReply {
            code,
            reason: reason.to_string(),
            vias: self.req_vias.clone(),
            record_routes: self.req_record_routes.clone(),
            from: self.req_from.clone().unwrap_or_default(),
            from_tag: self.req_from_tag.clone(),
            to: self.req_to.clone().unwrap_or_default(),
            to_tag: self.req_to_tag.clone(),
            call_id: self.ensure_call_id(),
            cseq,
            cseq_method,
            user_agent: self.config.user_agent.clone(),
        };
        self.send_data(&reply.render()).await
    }

    // --- shared plumbing ------------------------------------------------

    async fn send_data(&mut self, data: &str) -> Result<()> {
        let (host, port) = match &self.proxy {
            Some((host, port)) => (host.clone(), *port),
            None => (
                self.host
                    .clone()
                    .ok_or_else(|| Error::Configuration("cannot send, host undefined".to_string()))?,
                self.port,
            ),
        };

        self.log_tx(data);
        self.transport
            .send_to(Bytes::from(data.to_string()), &host, port)
            .await?;
        Ok(())
    }

    /// Start a new call on the same transport and port lease. Identity
    /// configuration survives; dialog-scoped state does not.
    pub fn reset(&mut self) {
        self.cseq = CSEQ_BASE;
        self.call_id = None;
        self.from_tag = None;
        self.to_tag = None;
        self.body = None;
        self.content_type = None;
        self.routes.clear();
        self.remote_contact = None;
        self.via = None;
        self.rx_msg = None;
        self.last_rx = None;
        self.status = None;
        self.auth = None;
        self.extra_headers.clear();
        self.req_vias.clear();
        self.req_record_routes.clear();
        self.req_from = None;
        self.req_from_tag = None;
        self.req_to = None;
        self.req_to_tag = None;
        self.req_cseq = None;
    }

    fn fresh_via(&self) -> String {
        message::new_via(&self.src_ip.to_string(), self.src_port)
    }

    fn contact_value(&self) -> Option<String> {
        self.contact.clone().or_else(|| {
            self.from_user
                .as_ref()
                .map(|user| format!("<sip:{}@{}:{}>", user, self.src_ip, self.src_port))
        })
    }

    fn ensure_from_tag(&mut self) -> String {
        match &self.from_tag {
            Some(tag) => tag.clone(),
            None => {
                let tag = generate_tag();
                self.from_tag = Some(tag.clone());
                tag
            }
        }
    }

    fn ensure_call_id(&mut self) -> String {
        match &self.call_id {
            Some(call_id) => call_id.clone(),
            None => {
                let call_id = format!("{}@{}", Uuid::new_v4().simple(), self.src_ip);
                self.call_id = Some(call_id.clone());
                call_id
            }
        }
    }

    fn numeric_status(&self) -> Option<u16> {
        let status = self.status.as_deref()?;
        if status.len() == 3 && status.chars().all(|c| c.is_ascii_digit()) {
            status.parse().ok()
        } else {
            None
        }
    }

    fn status_class(&self) -> Option<u16> {
        self.numeric_status().map(|code| code / 100)
    }

    fn log_tx(&self, data: &str) {
        let line = SipMessage::start_line(data);
        if self.config.debug {
            info!("--> {}", line);
        } else {
            debug!("--> {}", line);
        }
    }

    fn log_rx(&self, data: &str) {
        let line = SipMessage::start_line(data);
        if self.config.debug {
            info!("<-- {}", line);
        } else {
            debug!("<-- {}", line);
        }
    }
}

impl Drop for SipClient {
    fn drop(&mut self) {
        if let Some((service, port)) = self.lease.take() {
            if let Err(e) = service.release(port) {
                warn!("Failed to release source port {}: {}", port, e);
            }
        }
    }
}

fn generate_tag() -> String {
    rand::thread_rng().gen_range(10_000..100_000u32).to_string()
}

/// Pick the source address: explicit configuration first, then the
/// `SIPLING_SRC_IP` environment variable, then the address the host
/// would route outbound traffic from. Derived loopback or unspecified
/// addresses are rejected.
fn resolve_source_ip(config: &ClientConfig) -> Result<IpAddr> {
    if let Some(explicit) = &config.src_ip {
        return explicit
            .parse::<std::net::Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| Error::Configuration(format!("invalid src_ip {explicit}")));
    }

    if let Ok(from_env) = std::env::var("SIPLING_SRC_IP") {
        return from_env
            .parse::<std::net::Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| Error::Configuration(format!("invalid SIPLING_SRC_IP {from_env}")));
    }

    // A connected UDP socket selects a source address without sending
    // any traffic.
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("8.8.8.8:53").map(|_| socket))
        .and_then(|socket| socket.local_addr())
        .map_err(|e| {
            Error::Configuration(format!("failed to derive a source address: {e}"))
        })?;

    let ip = probe.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(Error::Configuration(
            "failed to obtain a non-loopback address to bind, set src_ip explicitly".to_string(),
        ));
    }
    Ok(ip)
}
