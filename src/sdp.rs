//! Placeholder SDP body for INVITE
//!
//! No media is negotiated or carried; the offer just has to be
//! well-formed enough for the far end to answer the call signaling.

use std::net::IpAddr;

/// Static PCMU/PCMA audio offer for `ip`.
pub fn offer(ip: IpAddr, port: u16) -> String {
    format!(
        "v=0\r\n\
         o=sipling 0 0 IN IP4 {ip}\r\n\
         s=call\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n"
    )
}
