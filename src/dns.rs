//! DNS message plumbing
//!
//! Just enough RFC 1035 to carry labels: single-question queries going out,
//! minimal answers coming back. The server replies with `A 0.0.0.0` to
//! anything it accepts, NXDOMAIN to names it does not recognise and
//! SERVFAIL when a chunk fails its checksum so the sender retries.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::label::{MAX_LABEL_LEN, MAX_QNAME_LEN};

/// DNS header size
const HEADER_LEN: usize = 12;

/// Maximum UDP DNS packet size (RFC 1035)
pub const MAX_DNS_UDP_SIZE: usize = 512;

/// QTYPE A
pub const QTYPE_A: u16 = 0x0001;

/// QTYPE ANY
const QTYPE_ANY: u16 = 0x00ff;

/// QCLASS IN
pub const QCLASS_IN: u16 = 0x0001;

/// TTL on synthesised answers
const ANSWER_TTL: u32 = 60;

/// DNS transport errors
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("query name is {0} bytes, maximum is 253")]
    NameTooLong(usize),

    #[error("label '{0}' is longer than 63 bytes")]
    LabelTooLong(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("server answered {0:?}")]
    Rcode(Rcode),

    #[error("no usable nameservers")]
    NoNameservers,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Response codes used by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    Refused,
    Other(u8),
}

impl Rcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0f {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::Refused => 5,
            Rcode::Other(v) => v & 0x0f,
        }
    }

    /// Whether the query reached an authoritative answer.
    /// NXDOMAIN counts: the name was seen, it just has no records.
    pub fn is_delivered(self) -> bool {
        matches!(self, Rcode::NoError | Rcode::NxDomain)
    }
}

/// A parsed inbound query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    /// Dotted name without the trailing root
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
    recursion_desired: bool,
    question_end: usize,
}

/// A parsed response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: Rcode,
    pub answers: u16,
}

/// Encode a dotted name as wire-format labels
pub fn encode_qname(name: &str) -> Result<Vec<u8>, DnsError> {
    let name = name.trim_end_matches('.');
    if name.len() > MAX_QNAME_LEN {
        return Err(DnsError::NameTooLong(name.len()));
    }

    let mut qname = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong(label.to_string()));
        }
        qname.push(label.len() as u8);
        qname.extend_from_slice(label.as_bytes());
    }
    qname.push(0);
    Ok(qname)
}

/// Build a DNS query packet for `qname` (type A, class IN, RD set)
pub fn build_query(qname: &str, transaction_id: u16) -> Result<Vec<u8>, DnsError> {
    let encoded = encode_qname(qname)?;
    let mut packet = Vec::with_capacity(HEADER_LEN + encoded.len() + 4);

    packet.extend_from_slice(&transaction_id.to_be_bytes()); // Transaction ID
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT: 1 question
    packet.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    packet.extend_from_slice(&encoded);
    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Parse a DNS query and extract its first question
pub fn parse_query(packet: &[u8]) -> Result<DnsQuery, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Malformed("packet too short".to_string()));
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    if packet[2] & 0x80 != 0 {
        return Err(DnsError::Malformed("not a query".to_string()));
    }
    let recursion_desired = packet[2] & 0x01 != 0;

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(DnsError::Malformed("no question".to_string()));
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<&str> = Vec::new();
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| DnsError::Malformed("truncated QNAME".to_string()))? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            // Queries never carry compression pointers
            return Err(DnsError::Malformed(format!("label length {} at {}", len, pos - 1)));
        }
        let label = packet
            .get(pos..pos + len)
            .ok_or_else(|| DnsError::Malformed("label overruns packet".to_string()))?;
        if !label.is_ascii() {
            return Err(DnsError::Malformed("non-ASCII label".to_string()));
        }
        labels.push(std::str::from_utf8(label).map_err(|e| DnsError::Malformed(e.to_string()))?);
        pos += len;
    }

    let tail = packet
        .get(pos..pos + 4)
        .ok_or_else(|| DnsError::Malformed("missing QTYPE/QCLASS".to_string()))?;
    let qtype = u16::from_be_bytes([tail[0], tail[1]]);
    let qclass = u16::from_be_bytes([tail[2], tail[3]]);

    let qname = labels.join(".");
    if qname.len() > MAX_QNAME_LEN {
        return Err(DnsError::NameTooLong(qname.len()));
    }

    Ok(DnsQuery {
        id,
        qname,
        qtype,
        qclass,
        recursion_desired,
        question_end: pos + 4,
    })
}

/// Build a response to `query`, echoing its question
///
/// `NoError` answers an A (or ANY) question with `A 0.0.0.0`.
pub fn build_response(query: &DnsQuery, packet: &[u8], rcode: Rcode) -> Vec<u8> {
    let answer = rcode == Rcode::NoError
        && query.qclass == QCLASS_IN
        && (query.qtype == QTYPE_A || query.qtype == QTYPE_ANY);

    let mut response = Vec::with_capacity(query.question_end + 16);
    response.extend_from_slice(&query.id.to_be_bytes());

    // QR=1, AA=1, RD copied; RA=0
    let flags_hi = 0x80 | 0x04 | if query.recursion_desired { 0x01 } else { 0x00 };
    response.push(flags_hi);
    response.push(rcode.to_u8());

    response.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    response.extend_from_slice(&(answer as u16).to_be_bytes()); // ANCOUNT
    response.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    response.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    let question_end = query.question_end.min(packet.len());
    response.extend_from_slice(&packet[HEADER_LEN.min(question_end)..question_end]);

    if answer {
        response.extend_from_slice(&[0xc0, 0x0c]); // NAME: pointer to question
        response.extend_from_slice(&QTYPE_A.to_be_bytes());
        response.extend_from_slice(&QCLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x04]); // RDLENGTH
        response.extend_from_slice(&[0, 0, 0, 0]); // 0.0.0.0
    }

    response
}

/// Parse the header of a DNS response
pub fn parse_response(packet: &[u8]) -> Result<DnsResponse, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Malformed("packet too short".to_string()));
    }
    if packet[2] & 0x80 == 0 {
        return Err(DnsError::Malformed("not a response".to_string()));
    }

    Ok(DnsResponse {
        id: u16::from_be_bytes([packet[0], packet[1]]),
        rcode: Rcode::from_u8(packet[3]),
        answers: u16::from_be_bytes([packet[6], packet[7]]),
    })
}

/// Outbound query primitive used by the transfer engine
#[async_trait]
pub trait QuerySender: Send + Sync {
    /// Send one query for `qname`; returns the observed round-trip time
    async fn send_query(&self, qname: &str) -> Result<Duration, DnsError>;
}

/// Sends queries over UDP to one or more nameservers, round-robin
pub struct UdpQuerySender {
    nameservers: Vec<SocketAddr>,
    timeout: Duration,
    next: AtomicUsize,
}

impl UdpQuerySender {
    pub fn new(nameservers: Vec<SocketAddr>, timeout: Duration) -> Result<Self, DnsError> {
        if nameservers.is_empty() {
            return Err(DnsError::NoNameservers);
        }
        Ok(Self {
            nameservers,
            timeout,
            next: AtomicUsize::new(0),
        })
    }

    /// Resolve nameserver hosts (names or addresses) on `port`
    pub async fn resolve(hosts: &[String], port: u16, timeout: Duration) -> Result<Self, DnsError> {
        let mut nameservers = Vec::new();
        for host in hosts.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
            match tokio::net::lookup_host((host, port)).await {
                Ok(addrs) => nameservers.extend(addrs),
                Err(e) => log::warn!("Could not resolve nameserver {}: {}", host, e),
            }
        }
        nameservers.dedup();
        log::info!("Configured nameservers: {:?}", nameservers);
        Self::new(nameservers, timeout)
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.nameservers
    }

    fn pick(&self) -> SocketAddr {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.nameservers[i % self.nameservers.len()]
    }
}

fn local_bind_addr(server: SocketAddr) -> SocketAddr {
    let local = match (server.is_ipv4(), server.ip().is_loopback()) {
        (true, true) => "127.0.0.1:0",
        (true, false) => "0.0.0.0:0",
        (false, true) => "[::1]:0",
        (false, false) => "[::]:0",
    };
    local
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

#[async_trait]
impl QuerySender for UdpQuerySender {
    async fn send_query(&self, qname: &str) -> Result<Duration, DnsError> {
        let server = self.pick();
        let transaction_id = rand::random::<u16>();
        let query = build_query(qname, transaction_id)?;

        // Fresh socket per query: new source port, no stale replies
        let socket = UdpSocket::bind(local_bind_addr(server)).await?;
        socket.connect(server).await?;

        let started = Instant::now();
        socket.send(&query).await?;
        log::trace!("Sent {} ({} bytes) to {}", qname, query.len(), server);

        let mut buf = vec![0u8; MAX_DNS_UDP_SIZE * 2];
        loop {
            let remaining = self
                .timeout
                .checked_sub(started.elapsed())
                .ok_or(DnsError::Timeout(self.timeout))?;

            let n = timeout(remaining, socket.recv(&mut buf))
                .await
                .map_err(|_| DnsError::Timeout(self.timeout))??;

            let response = match parse_response(&buf[..n]) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Ignoring bad response from {}: {}", server, e);
                    continue;
                }
            };
            if response.id != transaction_id {
                log::debug!(
                    "Ignoring response id {:04x}, expected {:04x}",
                    response.id,
                    transaction_id
                );
                continue;
            }

            let latency = started.elapsed();
            return if response.rcode.is_delivered() {
                Ok(latency)
            } else {
                Err(DnsError::Rcode(response.rcode))
            };
        }
    }
}

/// Nameservers listed in resolv.conf-formatted text
pub fn parse_resolv_conf(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or("").trim())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// The system resolvers from `/etc/resolv.conf`
pub fn system_nameservers() -> Vec<String> {
    match std::fs::read_to_string("/etc/resolv.conf") {
        Ok(text) => parse_resolv_conf(&text),
        Err(e) => {
            log::debug!("Could not read /etc/resolv.conf: {}", e);
            Vec::new()
        }
    }
}
