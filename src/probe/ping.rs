//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native probes use blocking sockets inside `spawn_blocking` for
//! sub-millisecond timing precision.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, Prober};

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

/// How this process is able to send ICMP echo requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpCapability {
    /// Raw ICMP sockets (CAP_NET_RAW or root)
    Raw,
    /// Unprivileged datagram ICMP sockets
    Datagram,
    /// Only the system `ping` executable
    Command,
}

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent pings to the same host stay distinct.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// ICMP echo prober. Build it once at startup with [`IcmpProber::detect`].
#[derive(Debug, Clone)]
pub struct IcmpProber {
    capability: IcmpCapability,
}

impl IcmpProber {
    /// Detect the best available probing primitive.
    ///
    /// Fails only when neither an ICMP socket nor a `ping` executable is
    /// available, which makes monitoring impossible for the whole process.
    pub fn detect() -> Result<Self, ProbeError> {
        if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
            tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
            return Ok(Self::with_capability(IcmpCapability::Raw));
        }

        if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
            tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
            return Ok(Self::with_capability(IcmpCapability::Datagram));
        }

        match find_ping_executable() {
            Some(path) => {
                tracing::info!(
                    "Ping probe: native ICMP unavailable, using {}",
                    path.display()
                );
                Ok(Self::with_capability(IcmpCapability::Command))
            }
            None => Err(ProbeError::Unavailable(
                "cannot open an ICMP socket and no `ping` executable on PATH".to_string(),
            )),
        }
    }

    pub fn with_capability(capability: IcmpCapability) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> IcmpCapability {
        self.capability
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<f64, ProbeError> {
        // Spread out a cycle's worth of probes
        let jitter = rand::random::<u64>() % 50;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let socket_type = match self.capability {
            IcmpCapability::Raw => Type::RAW,
            IcmpCapability::Datagram => Type::DGRAM,
            IcmpCapability::Command => return run_ping_command(address, timeout).await,
        };

        let ip = resolve_address(address).await?;
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, socket_type, timeout))
            .await
            .map_err(|e| ProbeError::Internal(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::PermissionDenied(reason)) => {
                tracing::warn!(
                    "Native ping to {} denied ({}), falling back to command",
                    address,
                    reason
                );
                run_ping_command(address, timeout).await
            }
            other => other,
        }
    }
}

fn find_ping_executable() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("ping"))
        .find(|candidate| candidate.is_file())
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Dns(format!("{}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Dns(format!("no addresses found for {}", address)))
}

fn socket_error(context: &str, e: std::io::Error) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ProbeError::PermissionDenied(format!("{}: {}", context, e))
        }
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            ProbeError::Network(format!("{}: {}", context, e))
        }
        _ => match e.raw_os_error() {
            // ENETUNREACH / EHOSTUNREACH
            Some(101) | Some(113) => ProbeError::Unreachable(format!("{}: {}", context, e)),
            _ => ProbeError::Network(format!("{}: {}", context, e)),
        },
    }
}

/// Send one echo request and wait for the matching reply.
/// Runs on the blocking pool.
fn run_blocking_ping(ip: IpAddr, socket_type: Type, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ECHO_REQUEST_V4, ECHO_REPLY_V4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ECHO_REQUEST_V6, ECHO_REPLY_V6),
    };

    let socket = Socket::new(domain, socket_type, Some(protocol))
        .map_err(|e| socket_error("failed to create ICMP socket", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Internal(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("failed to connect", e))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());
    // Datagram sockets get their identifier rewritten by the kernel, which
    // already filters replies per socket.
    let match_identifier = socket_type == Type::RAW;

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_error("failed to send", e))?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Internal(format!("failed to set timeout: {}", e)))?;

        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => socket_error("failed to receive", e),
        })?;
        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let reply = &buf[..len];
        if is_echo_reply(reply, reply_type, identifier, sequence, match_identifier) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
        // Someone else's packet, keep waiting
    }
}

/// Check whether `reply` answers our echo request.
///
/// IPv4 raw sockets deliver the IP header in front of the ICMP message.
fn is_echo_reply(
    reply: &[u8],
    reply_type: u8,
    identifier: u16,
    sequence: u16,
    match_identifier: bool,
) -> bool {
    let offset = match reply.first() {
        Some(first) if reply_type == ECHO_REPLY_V4 && first >> 4 == 4 => {
            usize::from(first & 0x0F) * 4
        }
        _ => 0,
    };
    let Some(icmp) = reply.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply_type && reply_seq == sequence && (!match_identifier || reply_id == identifier)
}

/// Build an ICMP/ICMPv6 echo request (8 byte header + 56 byte payload).
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = request_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum
    if checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Internal(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_ping_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

fn classify_ping_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    if stderr.contains("unknown host")
        || stderr.contains("Name or service not known")
        || stderr.contains("Temporary failure in name resolution")
        || stderr.contains("cannot resolve")
    {
        return ProbeError::Dns(stderr.trim().to_string());
    }
    if stdout.contains("Destination Host Unreachable") || stdout.contains("Destination Net Unreachable")
    {
        return ProbeError::Unreachable(stdout.trim().to_string());
    }
    if stderr.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
    {
        return ProbeError::Timeout(timeout);
    }
    ProbeError::Command(format!("ping failed: {}", stdout.trim()))
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, macOS)
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    if let Some(ms) = per_packet
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    // Summary "rtt min/avg/max/mdev = ..." (Linux) or
    // "round-trip min/avg/max/stddev = ..." (macOS), use the average
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .unwrap()
    });

    if let Some(ms) = summary
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    Err(ProbeError::Command(format!(
        "failed to parse ping output: {}",
        output
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(ECHO_REQUEST_V4, 0x1234, 0x0001, true);
        // A packet with a correct checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(ECHO_REQUEST_V4, 0x1234, 0x0001, true);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_echo_request(ECHO_REQUEST_V6, 0x1234, 0x0001, false);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_is_echo_reply_raw_v4_with_ip_header() {
        let mut reply = vec![0u8; 20];
        reply[0] = 0x45; // IPv4, IHL 5
        let mut icmp = build_echo_request(ECHO_REPLY_V4, 0xBEEF, 7, true);
        reply.append(&mut icmp);

        assert!(is_echo_reply(&reply, ECHO_REPLY_V4, 0xBEEF, 7, true));
        assert!(!is_echo_reply(&reply, ECHO_REPLY_V4, 0xBEEF, 8, true));
        assert!(!is_echo_reply(&reply, ECHO_REPLY_V4, 0xCAFE, 7, true));
    }

    #[test]
    fn test_is_echo_reply_datagram_ignores_identifier() {
        let reply = build_echo_request(ECHO_REPLY_V4, 0x0042, 9, true);
        assert!(is_echo_reply(&reply, ECHO_REPLY_V4, 0xFFFF, 9, false));
        assert!(!is_echo_reply(&reply[..6], ECHO_REPLY_V4, 0x0042, 9, false));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12.345).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17.906).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(
            parse_ping_output("nothing useful"),
            Err(ProbeError::Command(_))
        ));
    }

    #[test]
    fn test_classify_ping_failure() {
        let timeout = Duration::from_secs(3);
        let loss = "1 packets transmitted, 0 received, 100% packet loss, time 0ms";
        assert!(matches!(
            classify_ping_failure(loss, "", timeout),
            ProbeError::Timeout(_)
        ));
        assert!(matches!(
            classify_ping_failure("", "ping: nosuch.invalid: Name or service not known", timeout),
            ProbeError::Dns(_)
        ));
        assert!(matches!(
            classify_ping_failure("From 10.0.0.1 icmp_seq=1 Destination Host Unreachable", "", timeout),
            ProbeError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let ip = resolve_address("203.0.113.5").await.unwrap();
        assert_eq!(ip, "203.0.113.5".parse::<IpAddr>().unwrap());
    }
}
