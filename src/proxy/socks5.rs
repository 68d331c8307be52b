//! SOCKS5 proxying per RFC 1928 (protocol) and RFC 1929 (user/pass
//! auth): TCP CONNECT plus UDP ASSOCIATE with the datagram header
//! framing QUIC rides on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};
use crate::proxy::{ProxyConfig, Target};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Human-readable reply reason for the REP byte.
pub fn reply_reason(code: u8) -> String {
    match code {
        0x00 => "success".to_string(),
        0x01 => "general SOCKS server failure".to_string(),
        0x02 => "connection not allowed by ruleset".to_string(),
        0x03 => "network unreachable".to_string(),
        0x04 => "host unreachable".to_string(),
        0x05 => "connection refused".to_string(),
        0x06 => "TTL expired".to_string(),
        0x07 => "command not supported".to_string(),
        0x08 => "address type not supported".to_string(),
        other => format!("unknown error (code {other})"),
    }
}

fn negotiation_error(reason: impl Into<String>) -> Error {
    Error::ProxyNegotiationFailed {
        reason: reason.into(),
        status: None,
    }
}

/// Greeting + method selection + optional user/pass subnegotiation.
async fn handshake(stream: &mut TcpStream, auth: Option<(&str, &str)>) -> Result<()> {
    let methods: &[u8] = if auth.is_some() {
        &[METHOD_NONE, METHOD_USERPASS]
    } else {
        &[METHOD_NONE]
    };
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .await
        .map_err(|e| negotiation_error(format!("SOCKS5 greeting failed: {e}")))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| negotiation_error(format!("SOCKS5 method selection failed: {e}")))?;
    if choice[0] != VERSION {
        return Err(negotiation_error(format!(
            "SOCKS5 bad version in method selection: {}",
            choice[0]
        )));
    }

    match choice[1] {
        METHOD_NONE => Ok(()),
        METHOD_USERPASS => {
            let (user, pass) = auth.ok_or_else(|| {
                negotiation_error("proxy requires username/password but none configured")
            })?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::configuration(
                    "SOCKS5 credentials exceed 255 bytes",
                ));
            }
            // RFC 1929 subnegotiation.
            let mut msg = vec![0x01, user.len() as u8];
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream
                .write_all(&msg)
                .await
                .map_err(|e| negotiation_error(format!("SOCKS5 auth write failed: {e}")))?;

            let mut reply = [0u8; 2];
            stream
                .read_exact(&mut reply)
                .await
                .map_err(|e| negotiation_error(format!("SOCKS5 auth read failed: {e}")))?;
            if reply[1] != 0x00 {
                return Err(negotiation_error("SOCKS5 authentication rejected"));
            }
            Ok(())
        }
        METHOD_UNACCEPTABLE => Err(negotiation_error(
            "SOCKS5 proxy accepted none of our auth methods",
        )),
        other => Err(negotiation_error(format!(
            "SOCKS5 proxy chose unknown method {other:#04x}"
        ))),
    }
}

/// Append a SOCKS5 address (ATYP + ADDR + PORT) for a target.
fn push_target(buf: &mut Vec<u8>, target: &Target) -> Result<()> {
    match target {
        Target::Addr(SocketAddr::V4(addr)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Addr(SocketAddr::V6(addr)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::configuration("SOCKS5 domain exceeds 255 bytes"));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// Read a SOCKS5 reply, returning the bound address.
async fn read_reply(stream: &mut TcpStream) -> Result<SocketAddr> {
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| negotiation_error(format!("SOCKS5 reply read failed: {e}")))?;
    if head[0] != VERSION {
        return Err(negotiation_error(format!(
            "SOCKS5 bad version in reply: {}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(negotiation_error(format!(
            "SOCKS5 request rejected: {}",
            reply_reason(head[1])
        )));
    }

    let ip: IpAddr = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.map_err(Error::Io)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(Error::Io)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await.map_err(Error::Io)?;
            // Bound addresses are, in practice, always literal IPs;
            // treat a domain reply as unspecified.
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => {
            return Err(negotiation_error(format!(
                "SOCKS5 reply with unknown ATYP {other:#04x}"
            )))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.map_err(Error::Io)?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

/// Negotiate a TCP CONNECT tunnel on an established proxy stream.
pub async fn connect_tcp(
    stream: &mut TcpStream,
    target: &Target,
    auth: Option<(&str, &str)>,
    timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(timeout, async {
        handshake(stream, auth).await?;
        let mut req = vec![VERSION, CMD_CONNECT, 0x00];
        push_target(&mut req, target)?;
        stream
            .write_all(&req)
            .await
            .map_err(|e| negotiation_error(format!("SOCKS5 CONNECT write failed: {e}")))?;
        read_reply(stream).await?;
        Ok(())
    })
    .await
    .map_err(|_| Error::DeadlineExceeded("socks5 negotiation"))?
}

// ---------------------------------------------------------------------------
// UDP ASSOCIATE
// ---------------------------------------------------------------------------

/// Build the SOCKS5 UDP request header for a datagram to `target`:
/// `RSV(2) FRAG(1) ATYP(1) DST.ADDR DST.PORT`.
pub fn build_udp_header(target: &SocketAddr) -> Vec<u8> {
    let mut header = vec![0x00, 0x00, 0x00];
    match target {
        SocketAddr::V4(addr) => {
            header.push(ATYP_IPV4);
            header.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            header.push(ATYP_IPV6);
            header.extend_from_slice(&addr.ip().octets());
        }
    }
    header.extend_from_slice(&target.port().to_be_bytes());
    header
}

/// Parse an inbound SOCKS5 UDP header. Returns (payload offset, source
/// address). Fragmented datagrams (FRAG != 0) are refused — reassembly
/// is optional per RFC 1928 and no mainstream proxy emits fragments.
///
/// A domain-typed source resolves to an unspecified IP with the carried
/// port, since a `SocketAddr` cannot hold a name.
pub fn parse_udp_header(packet: &[u8]) -> Result<(usize, SocketAddr)> {
    if packet.len() < 4 {
        return Err(Error::protocol("SOCKS5 UDP packet too small"));
    }
    if packet[2] != 0x00 {
        return Err(Error::protocol("SOCKS5 UDP fragment refused"));
    }
    let (addr_len, ip): (usize, IpAddr) = match packet[3] {
        ATYP_IPV4 => {
            if packet.len() < 4 + 4 + 2 {
                return Err(Error::protocol("SOCKS5 UDP packet too small for IPv4"));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[4..8]);
            (4, IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            if packet.len() < 4 + 16 + 2 {
                return Err(Error::protocol("SOCKS5 UDP packet too small for IPv6"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            (16, IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let name_len = *packet
                .get(4)
                .ok_or_else(|| Error::protocol("SOCKS5 UDP packet truncated"))?
                as usize;
            if packet.len() < 5 + name_len + 2 {
                return Err(Error::protocol("SOCKS5 UDP packet too small for domain"));
            }
            (1 + name_len, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }
        other => {
            return Err(Error::protocol(format!(
                "SOCKS5 UDP unknown ATYP {other:#04x}"
            )))
        }
    };
    let port_off = 4 + addr_len;
    let port = u16::from_be_bytes([packet[port_off], packet[port_off + 1]]);
    Ok((port_off + 2, SocketAddr::new(ip, port)))
}

/// A UDP relay negotiated via UDP ASSOCIATE.
///
/// The control TCP connection must stay open for the relay's lifetime;
/// dropping this struct closes it, which tears the relay down at the
/// proxy.
pub struct Socks5UdpRelay {
    /// Keeps the association alive at the proxy.
    _control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
    target: SocketAddr,
    /// Precomputed header for the fixed target.
    header: Vec<u8>,
}

impl Socks5UdpRelay {
    /// Negotiate UDP ASSOCIATE and bind the local datagram socket.
    pub async fn associate(
        proxy: &ProxyConfig,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = format!("{}:{}", proxy.host, proxy.port);
        let mut control = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| Error::DeadlineExceeded("socks5 proxy connect"))?
            .map_err(|e| Error::DialTcpFailed {
                addr: endpoint.clone(),
                source: e,
            })?;

        let relay = tokio::time::timeout(timeout, async {
            handshake(&mut control, proxy.auth()).await?;
            // DST 0.0.0.0:0 lets the proxy pick the relay endpoint.
            let mut req = vec![VERSION, CMD_UDP_ASSOCIATE, 0x00];
            push_target(
                &mut req,
                &Target::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
            )?;
            control
                .write_all(&req)
                .await
                .map_err(|e| negotiation_error(format!("UDP ASSOCIATE write failed: {e}")))?;
            read_reply(&mut control).await
        })
        .await
        .map_err(|_| Error::DeadlineExceeded("socks5 udp associate"))??;

        // A 0.0.0.0 bound address means "same host as the control conn".
        let relay = if relay.ip().is_unspecified() {
            let proxy_ip = control.peer_addr().map_err(Error::Io)?.ip();
            SocketAddr::new(proxy_ip, relay.port())
        } else {
            relay
        };

        let bind: SocketAddr = if relay.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| Error::DialUdpFailed {
            addr: relay.to_string(),
            source: e,
        })?;

        Ok(Self {
            _control: control,
            socket,
            relay,
            target,
            header: build_udp_header(&target),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }

    /// Send one datagram to the target through the relay.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        let mut packet = Vec::with_capacity(self.header.len() + payload.len());
        packet.extend_from_slice(&self.header);
        packet.extend_from_slice(payload);
        let sent = self
            .socket
            .send_to(&packet, self.relay)
            .await
            .map_err(|e| Error::DialUdpFailed {
                addr: self.relay.to_string(),
                source: e,
            })?;
        Ok(sent.saturating_sub(self.header.len()))
    }

    /// Receive one datagram, stripping the relay header.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut packet = vec![0u8; buf.len() + 262]; // header worst case
        loop {
            let (n, from) = self.socket.recv_from(&mut packet).await.map_err(Error::Io)?;
            if from != self.relay {
                tracing::debug!(%from, relay = %self.relay, "dropping datagram from unexpected source");
                continue;
            }
            let (offset, _src) = parse_udp_header(&packet[..n])?;
            let payload = &packet[offset..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok(len);
        }
    }
}
