//! Host-network helpers: display-address lookup and listener probing.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tokio::net::TcpStream;

/// Best-effort local IPv4 address, for display only.
///
/// Asks the OS which source address would route towards a public destination
/// by connecting a UDP socket; no packet is sent. Returns `None` when only
/// loopback is available, and callers fall back to a placeholder label rather
/// than treating that as an error.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => {
            Some(*addr.ip())
        }
        _ => None,
    }
}

/// Checks whether something is actually accepting connections on `addr`.
///
/// An all-interfaces address is probed via loopback. Resolves to the peer
/// address on success, the connect error otherwise; the attempt is bounded by
/// `wait`.
pub async fn probe_listener(mut addr: SocketAddr, wait: Duration) -> io::Result<SocketAddr> {
    if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        addr.set_ip(loopback);
    }
    match tokio::time::timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream.peer_addr(),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "listener probe timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn local_ipv4_never_reports_loopback() {
        if let Some(ip) = local_ipv4() {
            assert!(!ip.is_loopback());
        }
    }

    #[tokio::test]
    async fn probe_finds_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let probed = probe_listener(addr, Duration::from_millis(500)).await.expect("probe");
        assert_eq!(probed.port(), addr.port());
    }

    #[tokio::test]
    async fn probe_maps_unspecified_to_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let wildcard: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("addr");
        let probed = probe_listener(wildcard, Duration::from_millis(500)).await.expect("probe");
        assert!(probed.ip().is_loopback());
    }

    #[tokio::test]
    async fn probe_fails_on_dead_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        assert!(probe_listener(addr, Duration::from_millis(500)).await.is_err());
    }
}
