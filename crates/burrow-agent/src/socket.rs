//! Tunnel socket wrapper

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::TcpStream;

use crate::agent::SocketLease;

/// An established tunnel socket dialed by the remote client.
///
/// A `TunnelSocket` is single-use: it is either idle in the agent's pool or
/// checked out to exactly one consumer. Dropping it in any path (transaction
/// complete, proxy error, upgrade splice over) closes the TCP connection and
/// releases its slot in the owning agent exactly once.
pub struct TunnelSocket {
    stream: TcpStream,
    peer: SocketAddr,
    _lease: SocketLease,
}

impl TunnelSocket {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, lease: SocketLease) -> Self {
        Self {
            stream,
            peer,
            _lease: lease,
        }
    }

    /// Remote address of the dialing client, with IPv4-mapped IPv6 collapsed.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Resolves once the socket can no longer be handed out: the peer closed
    /// it, errored, or sent bytes while the socket sat idle in the pool (a
    /// pooled socket must be quiet until a request is written to it).
    pub(crate) async fn unusable(&self) {
        loop {
            if self.stream.ready(Interest::READABLE).await.is_err() {
                return;
            }
            let mut buf = [0u8; 32];
            match self.stream.try_read(&mut buf) {
                Ok(0) => return,
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            }
        }
    }
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// Collapse an IPv4-mapped IPv6 address (`::ffff:1.2.3.4`) to plain IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ip_collapses_v4_mapped() {
        let mapped: IpAddr = "::ffff:1.2.3.4".parse().unwrap();
        assert_eq!(canonical_ip(mapped), "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn canonical_ip_keeps_plain_addresses() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(canonical_ip(v4), v4);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(canonical_ip(v6), v6);
    }
}
