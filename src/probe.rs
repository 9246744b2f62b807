//! Liveness probing.
//!
//! Interface "up" flags say nothing about whether multicast traffic sent
//! through an interface will actually reach the network, so eligibility
//! is decided empirically: send an ICMP echo request to the all-hosts
//! group from a candidate source address and see whether anything answers
//! within the timeout.  A probe resolves to exactly one of three
//! outcomes, whichever of {reply, idle timeout, transport error} happens
//! first.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// ICMP echo request message type.
const ECHO_REQUEST: u8 = 8;
/// ICMP echo reply message type.
const ECHO_REPLY: u8 = 0;

/// Result of a single liveness probe.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// A reply arrived before the timeout.
    Reply,
    /// The timeout elapsed without a reply or a transport error.
    NoReply,
    /// The transport reported a failure, e.g. network unreachable.
    Error(io::Error),
}

/// Reachability check against a target address.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe `target`, optionally originating from the local address
    /// `source` so the check is specific to one interface.  Blocks the
    /// caller until one outcome wins; never longer than `timeout` plus
    /// socket setup.
    async fn probe(
        &self,
        target: Ipv4Addr,
        source: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> ProbeOutcome;
}

/// ICMP echo implementation of [`Probe`].
///
/// Uses an unprivileged datagram ICMP socket, so no raw-socket capability
/// is required on Linux (subject to `net.ipv4.ping_group_range`).
pub struct IcmpProbe;

#[async_trait]
impl Probe for IcmpProbe {
    async fn probe(
        &self,
        target: Ipv4Addr,
        source: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> ProbeOutcome {
        // The echo exchange is plain blocking socket I/O.
        let outcome = tokio::task::spawn_blocking(move || echo(target, source, timeout)).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(e) => ProbeOutcome::Error(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

/// Send one echo request and wait for the first reply.
fn echo(target: Ipv4Addr, source: Option<Ipv4Addr>, timeout: Duration) -> ProbeOutcome {
    let socket = match open_socket(source) {
        Ok(s) => s,
        Err(e) => return ProbeOutcome::Error(e),
    };

    let ident = std::process::id() as u16;
    let packet = echo_request(ident, 1);
    if let Err(e) = socket.send_to(&packet, SocketAddrV4::new(target, 0)) {
        return ProbeOutcome::Error(e);
    }

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::NoReply;
        }
        if let Err(e) = socket.set_read_timeout(Some(remaining)) {
            return ProbeOutcome::Error(e);
        }
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n > 0 && buf[0] == ECHO_REPLY {
                    debug!("Echo reply from {:?} for probe of {}", from, target);
                    return ProbeOutcome::Reply;
                }
                // Some other ICMP message; keep waiting until the deadline.
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return ProbeOutcome::NoReply;
            }
            Err(e) => return ProbeOutcome::Error(e),
        }
    }
}

/// Open an unprivileged ICMP socket, bound to `source` when given so the
/// probe egresses through that interface.
fn open_socket(source: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
    if let Some(addr) = source {
        socket.bind(&SockAddr::from(SocketAddrV4::new(addr, 0)))?;
        // Multicast egress follows the configured interface, not the
        // routing table.
        socket.set_multicast_if_v4(&addr)?;
    }
    // The fd is a datagram socket; UdpSocket is just a convenient
    // std wrapper for send_to/recv_from on it.
    Ok(socket.into())
}

/// Build an ICMP echo request message (type 8, code 0).
fn echo_request(ident: u16, seq: u16) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..].copy_from_slice(b"beacond\0");
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// RFC 1071 ones-complement checksum over the whole ICMP message.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_layout() {
        let packet = echo_request(0x1234, 7);
        assert_eq!(packet[0], ECHO_REQUEST);
        assert_eq!(packet[1], 0); // code
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x07]);
    }

    #[test]
    fn checksum_validates_to_zero() {
        // A message with its checksum filled in sums to 0xffff, i.e. the
        // recomputed checksum over the full packet is zero.
        let packet = echo_request(0xbeef, 3);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn checksum_odd_length() {
        // Odd trailing byte is padded with zero.
        assert_eq!(checksum(&[0xff]), !0xff00);
    }
}
