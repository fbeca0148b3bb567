//! UDP transport for SIP datagrams
//!
//! The transaction controller only ever talks to the [`Transport`]
//! trait; the production implementation wraps a bound
//! `tokio::net::UdpSocket`. Receive timeouts model the final-response
//! timer: a timeout is not an error, it yields `None`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `host:port`, resolving `host` via DNS when
    /// it is not a literal address. Bounded by the send timeout.
    async fn send_to(&self, data: Bytes, host: &str, port: u16) -> Result<usize>;

    /// Receive one datagram of at most `max_len` bytes. `Ok(None)`
    /// means the receive timer expired without traffic.
    async fn receive(&self, max_len: usize) -> Result<Option<String>>;

    /// The actually bound source port.
    fn local_port(&self) -> u16;
}

/// UDP transport bound to the leased source address for its lifetime.
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
    recv_timeout: Duration,
    send_timeout: Duration,
}

impl UdpTransport {
    /// Bind `ip:port` eagerly. Port 0 asks the OS for an ephemeral port;
    /// the chosen value is readable via [`Transport::local_port`].
    pub async fn bind(
        ip: IpAddr,
        port: u16,
        recv_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, port))
            .await
            .map_err(|e| Error::Transport(format!("failed to bind {ip}:{port}: {e}")))?;

        let local_port = socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("failed to read local address: {e}")))?
            .port();

        debug!("UDP transport bound on {}:{}", ip, local_port);

        Ok(Self {
            socket,
            local_port,
            recv_timeout,
            send_timeout,
        })
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Transport(format!("DNS resolution of {host} failed: {e}")))?;

        addrs
            .next()
            .ok_or_else(|| Error::Transport(format!("DNS resolution of {host} failed")))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, data: Bytes, host: &str, port: u16) -> Result<usize> {
        let destination = Self::resolve(host, port).await?;

        debug!("Sending {} bytes to {} via UDP", data.len(), destination);

        let sent = timeout(self.send_timeout, self.socket.send_to(&data, destination))
            .await
            .map_err(|_| {
                Error::Transport(format!("send to {destination} timed out"))
            })?
            .map_err(|e| Error::Transport(format!("failed to send to {destination}: {e}")))?;

        Ok(sent)
    }

    async fn receive(&self, max_len: usize) -> Result<Option<String>> {
        let mut buf = vec![0u8; max_len];

        match timeout(self.recv_timeout, self.socket.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(Error::Transport(format!("failed to receive: {e}"))),
            Ok(Ok((size, source))) => {
                debug!("Received {} bytes from {} via UDP", size, source);
                Ok(Some(String::from_utf8_lossy(&buf[..size]).into_owned()))
            }
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = UdpTransport::bind(
            LOCALHOST,
            0,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_ne!(transport.local_port(), 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let transport = UdpTransport::bind(
            LOCALHOST,
            0,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(transport.receive(1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let a = UdpTransport::bind(
            LOCALHOST,
            0,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let b = UdpTransport::bind(
            LOCALHOST,
            0,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let sent = a
            .send_to(Bytes::from_static(b"OPTIONS sip:x SIP/2.0"), "127.0.0.1", b.local_port())
            .await
            .unwrap();
        assert_eq!(sent, 21);

        let received = b.receive(1024).await.unwrap().unwrap();
        assert_eq!(received, "OPTIONS sip:x SIP/2.0");
    }

    #[tokio::test]
    async fn test_dns_failure_is_transport_error() {
        let transport = UdpTransport::bind(
            LOCALHOST,
            0,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let err = transport
            .send_to(Bytes::from_static(b"x"), "no-such-host.invalid", 5060)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
