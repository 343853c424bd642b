//! Port allocation: deterministic, ephemeral, and bind-probing.

use std::net::{IpAddr, SocketAddr};
use std::ops::Range;

use sha2::{Digest, Sha256};
use socket2::{Domain, Protocol, Socket, Type};

/// Range deterministic ports are drawn from.
pub const DEFAULT_PORT_RANGE: Range<u16> = 50_000..60_000;

/// Deterministic port for an artifact payload.
///
/// SHA-256 over the payload, reduced modulo the range width. Identical bytes
/// resolve to the same port on any platform and any run, which is what lets
/// unrelated processes agree on an address without a registry.
pub fn specific_port(payload: &[u8], range: Range<u16>) -> u16 {
    let digest = Sha256::digest(payload);
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    let wide = u128::from_be_bytes(head);

    let width = u128::from(range.end - range.start);
    range.start + (wide % width) as u16
}

/// Bind with SO_REUSEADDR, matching how service listeners bind. "Bound"
/// therefore means a live socket holds the port, not a TIME_WAIT remnant of
/// a dead service.
pub(crate) fn try_bind(addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Ask the OS for a currently-free ephemeral port on `host`.
///
/// The socket is released before returning, so another process may claim the
/// port before it is used; callers accept that race.
pub fn free_port(host: IpAddr) -> std::io::Result<u16> {
    let socket = try_bind(SocketAddr::new(host, 0))?;
    let addr = socket.local_addr()?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| std::io::Error::other("ephemeral bind returned a non-IP address"))
}

/// Bind-probe: is `(host, port)` currently held by someone?
///
/// A probe, not a reservation. The probe socket is released on success.
pub fn is_port_bound(host: IpAddr, port: u16) -> bool {
    match try_bind(SocketAddr::new(host, port)) {
        Ok(_) => false,
        Err(e) => {
            tracing::warn!(%host, port, error = %e, "port is in use");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn specific_port_is_deterministic() {
        let a = specific_port(b"def fact(n): ...", DEFAULT_PORT_RANGE);
        let b = specific_port(b"def fact(n): ...", DEFAULT_PORT_RANGE);
        assert_eq!(a, b);
    }

    #[test]
    fn specific_port_stays_in_range() {
        for i in 0..100u32 {
            let port = specific_port(&i.to_be_bytes(), DEFAULT_PORT_RANGE);
            assert!(DEFAULT_PORT_RANGE.contains(&port), "port {port} out of range");
        }
    }

    #[test]
    fn specific_port_spreads_over_the_range() {
        let ports: std::collections::HashSet<u16> = (0..100u32)
            .map(|i| specific_port(format!("artifact-{i}").as_bytes(), DEFAULT_PORT_RANGE))
            .collect();
        // 100 draws over 10k slots; a handful of collisions would already be
        // suspicious, fewer than 90 distinct means the digest is broken.
        assert!(ports.len() >= 90, "only {} distinct ports", ports.len());
    }

    #[test]
    fn specific_port_honors_custom_range() {
        let port = specific_port(b"payload", 8000..8010);
        assert!((8000..8010).contains(&port));
    }

    #[test]
    fn free_port_returns_bindable_port() {
        let port = free_port(LOOPBACK).unwrap();
        assert_ne!(port, 0);
        assert!(!is_port_bound(LOOPBACK, port));
    }

    #[test]
    fn bound_port_is_reported_bound() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_bound(LOOPBACK, port));
        drop(listener);
        assert!(!is_port_bound(LOOPBACK, port));
    }
}
