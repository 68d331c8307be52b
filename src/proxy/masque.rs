//! MASQUE: UDP proxying over HTTP/3 (RFC 9298 CONNECT-UDP, RFC 9297
//! HTTP datagrams).
//!
//! The tunnel holds its own QUIC connection to the proxy; target
//! datagrams travel as HTTP datagrams on an extended-CONNECT request
//! stream. The [`MasqueTunnel`] presents the same send/recv surface as
//! a plain socket, so the HTTP/3 dialer stacks its QUIC connection on
//! top without caring that another QUIC connection sits underneath.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};

use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;

const MAX_DATAGRAM_SIZE: usize = 1350;
const HANDSHAKE_POLL: Duration = Duration::from_millis(25);

/// Encode a QUIC variable-length integer (RFC 9000 §16).
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0x3f => out.push(value as u8),
        0x40..=0x3fff => out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes()),
        0x4000..=0x3fff_ffff => out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes()),
        _ => out.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes()),
    }
}

/// Decode a QUIC varint, returning (value, bytes consumed).
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| Error::protocol("empty varint"))?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(Error::protocol("truncated varint"));
    }
    let mut value = u64::from(first & 0x3f);
    for b in &buf[1..len] {
        value = (value << 8) | u64::from(*b);
    }
    Ok((value, len))
}

/// A CONNECT-UDP tunnel to one target through a MASQUE proxy.
pub struct MasqueTunnel {
    socket: UdpSocket,
    proxy_addr: SocketAddr,
    conn: quiche::Connection,
    h3: quiche::h3::Connection,
    /// Request stream carrying the CONNECT-UDP; datagram flow is keyed
    /// by its quarter stream ID.
    stream_id: u64,
    target: SocketAddr,
    recv_buf: Vec<u8>,
}

impl MasqueTunnel {
    /// Establish the tunnel: QUIC+H3 handshake with the proxy, then an
    /// extended CONNECT with `:protocol = connect-udp`.
    pub async fn establish(
        proxy: &ProxyConfig,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        tokio::time::timeout(timeout, Self::establish_inner(proxy, target))
            .await
            .map_err(|_| Error::DeadlineExceeded("masque establish"))?
    }

    async fn establish_inner(proxy: &ProxyConfig, target: SocketAddr) -> Result<Self> {
        let endpoint = format!("{}:{}", proxy.host, proxy.port);
        let proxy_addr = lookup_host(&endpoint)
            .await
            .map_err(|e| Error::DnsFailed {
                host: proxy.host.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| Error::DnsFailed {
                host: proxy.host.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            })?;

        let bind: SocketAddr = if proxy_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| Error::DialUdpFailed {
            addr: proxy_addr.to_string(),
            source: e,
        })?;

        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)
            .map_err(|e| Error::quic(format!("quiche config: {e}")))?;
        config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL);
        config.set_max_idle_timeout(30_000);
        config.set_max_recv_udp_payload_size(65535);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_stream_data_uni(1_000_000);
        config.set_initial_max_streams_bidi(16);
        config.set_initial_max_streams_uni(16);
        config.set_disable_active_migration(true);
        config.enable_dgram(true, 64, 64);
        config.grease(true);

        let mut scid = [0u8; 16];
        getrandom::getrandom(&mut scid)
            .map_err(|e| Error::quic(format!("connection id entropy: {e}")))?;
        let scid = quiche::ConnectionId::from_ref(&scid);
        let local = socket.local_addr().map_err(Error::Io)?;

        let mut conn = quiche::connect(Some(&proxy.host), &scid, local, proxy_addr, &mut config)
            .map_err(|e| Error::quic(format!("quiche connect: {e}")))?;

        let mut buf = vec![0u8; 65535];
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        // QUIC handshake pump.
        while !conn.is_established() {
            flush_egress(&mut conn, &socket, &mut out).await?;
            match tokio::time::timeout(HANDSHAKE_POLL, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let info = quiche::RecvInfo { from, to: local };
                    if let Err(e) = conn.recv(&mut buf[..n], info) {
                        if e != quiche::Error::Done {
                            return Err(Error::quic(format!("quiche recv: {e}")));
                        }
                    }
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    if conn.is_closed() {
                        return Err(Error::ProxyNegotiationFailed {
                            reason: "MASQUE proxy closed during QUIC handshake".to_string(),
                            status: None,
                        });
                    }
                }
            }
        }

        let h3_config = quiche::h3::Config::new()
            .map_err(|e| Error::quic(format!("h3 config: {e}")))?;
        let mut h3 = quiche::h3::Connection::with_transport(&mut conn, &h3_config)
            .map_err(|e| Error::quic(format!("h3 connection: {e}")))?;

        // RFC 9298 URI template path for the well-known CONNECT-UDP form.
        let path = format!(
            "/.well-known/masque/udp/{}/{}/",
            target.ip(),
            target.port()
        );
        let authority = format!("{}:{}", proxy.host, proxy.port);
        let headers = [
            quiche::h3::Header::new(b":method", b"CONNECT"),
            quiche::h3::Header::new(b":protocol", b"connect-udp"),
            quiche::h3::Header::new(b":scheme", b"https"),
            quiche::h3::Header::new(b":authority", authority.as_bytes()),
            quiche::h3::Header::new(b":path", path.as_bytes()),
        ];
        let stream_id = h3
            .send_request(&mut conn, &headers, false)
            .map_err(|e| Error::quic(format!("CONNECT-UDP request: {e}")))?;

        // Wait for the proxy's 2xx before declaring the tunnel up.
        loop {
            flush_egress(&mut conn, &socket, &mut out).await?;

            let mut responded = false;
            loop {
                match h3.poll(&mut conn) {
                    Ok((id, quiche::h3::Event::Headers { list, .. })) if id == stream_id => {
                        let status = connect_status(&list)?;
                        if !(200..300).contains(&status) {
                            return Err(Error::ProxyNegotiationFailed {
                                reason: format!("CONNECT-UDP refused with {status}"),
                                status: Some(status),
                            });
                        }
                        responded = true;
                    }
                    Ok((id, quiche::h3::Event::Finished)) if id == stream_id => {
                        return Err(Error::ProxyNegotiationFailed {
                            reason: "MASQUE proxy closed the CONNECT-UDP stream".to_string(),
                            status: None,
                        });
                    }
                    Ok(_) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(Error::quic(format!("h3 poll: {e}"))),
                }
            }
            if responded {
                break;
            }

            match tokio::time::timeout(HANDSHAKE_POLL, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let info = quiche::RecvInfo { from, to: local };
                    if let Err(e) = conn.recv(&mut buf[..n], info) {
                        if e != quiche::Error::Done {
                            return Err(Error::quic(format!("quiche recv: {e}")));
                        }
                    }
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    if conn.is_closed() {
                        return Err(Error::ProxyNegotiationFailed {
                            reason: "MASQUE proxy closed before answering CONNECT-UDP".to_string(),
                            status: None,
                        });
                    }
                }
            }
        }

        tracing::debug!(%target, proxy = %proxy_addr, "MASQUE tunnel established");
        Ok(Self {
            socket,
            proxy_addr,
            conn,
            h3,
            stream_id,
            target,
            recv_buf: vec![0u8; 65535],
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }

    /// Send one target datagram: quarter-stream-id, context id 0, then
    /// the payload, as one HTTP datagram.
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let mut dgram = Vec::with_capacity(payload.len() + 4);
        encode_varint(self.stream_id / 4, &mut dgram);
        encode_varint(0, &mut dgram);
        dgram.extend_from_slice(payload);

        self.conn
            .dgram_send(&dgram)
            .map_err(|e| Error::quic(format!("dgram send: {e}")))?;
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        flush_egress(&mut self.conn, &self.socket, &mut out).await?;
        Ok(payload.len())
    }

    /// Receive one target datagram, stripping the HTTP datagram prefix.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            // Drain any queued datagram first.
            match self.conn.dgram_recv(&mut self.recv_buf) {
                Ok(n) => {
                    let (qsid, off1) = decode_varint(&self.recv_buf[..n])?;
                    if qsid != self.stream_id / 4 {
                        tracing::debug!(qsid, "dropping datagram for unknown flow");
                        continue;
                    }
                    let (context_id, off2) = decode_varint(&self.recv_buf[off1..n])?;
                    if context_id != 0 {
                        // Only context 0 (raw UDP payload) is negotiated.
                        continue;
                    }
                    let payload = &self.recv_buf[off1 + off2..n];
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok(len);
                }
                Err(quiche::Error::Done) => {}
                Err(e) => return Err(Error::quic(format!("dgram recv: {e}"))),
            }

            // Keep the inner connection alive (acks, capsule events).
            while let Ok((_, _)) = self.h3.poll(&mut self.conn) {}
            flush_egress(&mut self.conn, &self.socket, &mut out).await?;

            if self.conn.is_closed() {
                return Err(Error::quic("MASQUE tunnel closed".to_string()));
            }

            let local = self.socket.local_addr().map_err(Error::Io)?;
            let (n, from) = self
                .socket
                .recv_from(&mut self.recv_buf)
                .await
                .map_err(Error::Io)?;
            if from != self.proxy_addr {
                continue;
            }
            let info = quiche::RecvInfo { from, to: local };
            let mut pkt = self.recv_buf[..n].to_vec();
            if let Err(e) = self.conn.recv(&mut pkt, info) {
                if e != quiche::Error::Done {
                    return Err(Error::quic(format!("quiche recv: {e}")));
                }
            }
        }
    }
}

/// Extract the :status pseudo-header from a response header list.
fn connect_status(list: &[quiche::h3::Header]) -> Result<u16> {
    use quiche::h3::NameValue;
    for header in list {
        if header.name() == b":status" {
            return String::from_utf8_lossy(header.value())
                .parse()
                .map_err(|_| Error::protocol("malformed :status from MASQUE proxy"));
        }
    }
    Err(Error::protocol("MASQUE response missing :status"))
}

async fn flush_egress(
    conn: &mut quiche::Connection,
    socket: &UdpSocket,
    out: &mut [u8],
) -> Result<()> {
    loop {
        match conn.send(out) {
            Ok((len, info)) => {
                socket
                    .send_to(&out[..len], info.to)
                    .await
                    .map_err(Error::Io)?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(Error::quic(format!("quiche send: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 63, 64, 16383, 16384, 1_073_741_823, 1_073_741_824] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_lengths_match_rfc9000() {
        let len_of = |v: u64| {
            let mut buf = Vec::new();
            encode_varint(v, &mut buf);
            buf.len()
        };
        assert_eq!(len_of(0), 1);
        assert_eq!(len_of(63), 1);
        assert_eq!(len_of(64), 2);
        assert_eq!(len_of(16383), 2);
        assert_eq!(len_of(16384), 4);
        assert_eq!(len_of(1_073_741_824), 8);
    }

    #[test]
    fn varint_rejects_truncation() {
        let mut buf = Vec::new();
        encode_varint(16384, &mut buf);
        assert!(decode_varint(&buf[..2]).is_err());
        assert!(decode_varint(&[]).is_err());
    }
}
