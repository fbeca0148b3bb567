//! SIP message types, parsing and rendering
//!
//! One structured parse pass turns raw datagram text into a
//! [`SipMessage`] with an ordered, duplicate-preserving header map.
//! Rendering of outgoing requests and replies lives here too, so every
//! header rule (Via branch, Route reversal, To-tag suppression) sits in
//! one place.

use rand::Rng;

/// Methods that must not claim a To-tag: they establish a dialog rather
/// than operate inside one.
const DIALOG_ESTABLISHING: [&str; 4] = ["INVITE", "CANCEL", "NOTIFY", "REGISTER"];

/// Ordered header list. Duplicates are preserved in arrival order and
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Parse header lines up to (not including) the blank separator line.
    /// Lines without a colon are skipped.
    fn parse(lines: &[&str]) -> Self {
        let mut entries = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                entries.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        Self { entries }
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed inbound SIP message.
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request {
        method: String,
        uri: String,
        headers: Headers,
        body: String,
    },
    Response {
        code: u16,
        reason: String,
        headers: Headers,
        body: String,
    },
}

impl SipMessage {
    /// Classify and parse raw text. Text that is neither a status line
    /// nor a request line yields `None`; a missing header never fails
    /// the parse, the corresponding accessor just returns nothing.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest: Vec<&str> = raw.lines().map(|l| l.trim_end_matches('\r')).collect();
        let start = *rest.first()?;
        let blank = rest.iter().position(|l| l.is_empty()).unwrap_or(rest.len());
        let header_lines = &rest[1..blank.max(1)];
        let body = if blank + 1 < rest.len() {
            rest[blank + 1..].join("\r\n")
        } else {
            String::new()
        };
        let headers = Headers::parse(header_lines);

        if let Some(status) = start.strip_prefix("SIP/2.0 ") {
            let code_str: String = status.chars().take(3).collect();
            let code: u16 = code_str.parse().ok()?;
            if code_str.len() != 3 {
                return None;
            }
            let reason = status[3..].trim().to_string();
            return Some(SipMessage::Response {
                code,
                reason,
                headers,
                body,
            });
        }

        let mut parts = start.split_whitespace();
        let method = parts.next()?;
        let uri = parts.next()?;
        let version = parts.next()?;
        if !version.starts_with("SIP/")
            || method.is_empty()
            || !method.chars().all(|c| c.is_ascii_uppercase())
        {
            return None;
        }
        Some(SipMessage::Request {
            method: method.to_string(),
            uri: uri.to_string(),
            headers,
            body,
        })
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request { headers, .. } => headers,
            SipMessage::Response { headers, .. } => headers,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SipMessage::Response { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// All Via header values, in order.
    pub fn vias(&self) -> Vec<String> {
        self.headers()
            .get_all("Via")
            .into_iter()
            .map(|v| v.to_string())
            .collect()
    }

    /// All Record-Route entries, each comma-separated value split into
    /// individual routes, in arrival order.
    pub fn record_routes(&self) -> Vec<String> {
        self.headers()
            .get_all("Record-Route")
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// `tag=` parameter on the To header.
    pub fn to_tag(&self) -> Option<String> {
        self.headers().get("To").and_then(tag_param)
    }

    /// `tag=` parameter on the From header.
    pub fn from_tag(&self) -> Option<String> {
        self.headers().get("From").and_then(tag_param)
    }

    /// Contact target with any `;`-delimited parameters and angle
    /// brackets stripped.
    pub fn contact(&self) -> Option<String> {
        let value = self.headers().get("Contact")?;
        let target = value.split(';').next().unwrap_or(value).trim();
        let target = target.trim_start_matches('<').trim_end_matches('>');
        if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        }
    }

    /// CSeq number and method token.
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.headers().get("CSeq")?;
        let mut parts = value.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((number, method))
    }

    pub fn call_id(&self) -> Option<String> {
        self.headers().get("Call-ID").map(|v| v.to_string())
    }

    /// From value with parameters stripped, usable as an echoed target.
    pub fn from_value(&self) -> Option<String> {
        self.headers().get("From").map(strip_params)
    }

    /// To value with parameters stripped, usable as an echoed target.
    pub fn to_value(&self) -> Option<String> {
        self.headers().get("To").map(strip_params)
    }

    /// First line of the message, for one-line summaries.
    pub fn start_line(raw: &str) -> &str {
        raw.lines().next().unwrap_or(raw).trim_end_matches('\r')
    }
}

fn tag_param(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|p| {
        p.trim()
            .strip_prefix("tag=")
            .map(|t| t.trim().to_string())
    })
}

fn strip_params(value: &str) -> String {
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Fresh Via value for one transmission.
pub fn new_via(src_ip: &str, src_port: u16) -> String {
    let branch: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("SIP/2.0/UDP {src_ip}:{src_port};rport;branch=z9hG4bK{branch}")
}

/// An outgoing request, fully assembled by the transaction controller
/// and validated before rendering.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub uri: String,
    pub via: String,
    /// Accumulated route set in Record-Route arrival order; rendered
    /// reversed, omitted for CANCEL.
    pub routes: Vec<String>,
    pub from: String,
    pub from_tag: String,
    pub to: String,
    pub to_tag: Option<String>,
    /// Pending auth header as (name, value), e.g.
    /// ("Authorization", "Digest ...").
    pub auth: Option<(String, String)>,
    pub call_id: String,
    pub cseq: u32,
    /// Fully formed Contact value; omitted for MESSAGE.
    pub contact: Option<String>,
    pub content_type: Option<String>,
    pub user_agent: String,
    pub extra_headers: Vec<String>,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str(&format!("{} {} SIP/2.0\r\n", self.method, self.uri));
        out.push_str(&format!("Via: {}\r\n", self.via));

        if !self.routes.is_empty() && self.method != "CANCEL" {
            let reversed: Vec<&str> =
                self.routes.iter().rev().map(|r| r.as_str()).collect();
            out.push_str(&format!("Route: {}\r\n", reversed.join(",")));
        }

        out.push_str(&format!("From: {};tag={}\r\n", self.from, self.from_tag));

        // An un-established dialog must not claim a To-tag.
        let claim_tag = !DIALOG_ESTABLISHING.contains(&self.method.as_str());
        match (&self.to_tag, claim_tag) {
            (Some(tag), true) => out.push_str(&format!("To: {};tag={}\r\n", self.to, tag)),
            _ => out.push_str(&format!("To: {}\r\n", self.to)),
        }

        if let Some((name, value)) = &self.auth {
            out.push_str(&format!("{name}: {value}\r\n"));
        }

        out.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        out.push_str(&format!("CSeq: {} {}\r\n", self.cseq, self.method));

        if self.method != "MESSAGE" {
            if let Some(contact) = &self.contact {
                out.push_str(&format!("Contact: {contact}\r\n"));
            }
        }

        if let Some(content_type) = &self.content_type {
            out.push_str(&format!("Content-Type: {content_type}\r\n"));
        }

        out.push_str("Max-Forwards: 70\r\n");
        out.push_str(&format!("User-Agent: {}\r\n", self.user_agent));

        for header in &self.extra_headers {
            out.push_str(header);
            out.push_str("\r\n");
        }

        let body = self.body.as_deref().unwrap_or("");
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        out.push_str("\r\n");
        out.push_str(body);
        out
    }
}

/// A reply to an inbound request: Via and Record-Route echoed in
/// original order, dialog identifiers as learned from the request.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub code: u16,
    pub reason: String,
    pub vias: Vec<String>,
    pub record_routes: Vec<String>,
    pub from: String,
    pub from_tag: Option<String>,
    pub to: String,
    pub to_tag: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub cseq_method: String,
    pub user_agent: String,
}

impl OutboundReply {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str(&format!("SIP/2.0 {} {}\r\n", self.code, self.reason));
        for via in &self.vias {
            out.push_str(&format!("Via: {via}\r\n"));
        }
        for route in &self.record_routes {
            out.push_str(&format!("Record-Route: {route}\r\n"));
        }
        match &self.from_tag {
            Some(tag) => out.push_str(&format!("From: {};tag={}\r\n", self.from, tag)),
            None => out.push_str(&format!("From: {}\r\n", self.from)),
        }
        match &self.to_tag {
            Some(tag) => out.push_str(&format!("To: {};tag={}\r\n", self.to, tag)),
            None => out.push_str(&format!("To: {}\r\n", self.to)),
        }
        out.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        out.push_str(&format!("CSeq: {} {}\r\n", self.cseq, self.cseq_method));
        out.push_str("Max-Forwards: 70\r\n");
        out.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        out.push_str("Content-Length: 0\r\n\r\n");
        out
    }
}
