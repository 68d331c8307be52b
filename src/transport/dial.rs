//! Shared dial prelude: resolution, Happy Eyeballs ordering, and the
//! per-address budget division every dialer applies.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::{Error, Result};
use crate::request::CancelToken;

/// No single address may consume more than this, however generous the
/// overall budget is.
pub const MAX_PER_ADDR_BUDGET: Duration = Duration::from_secs(10);

/// Divide the remaining deadline across the remaining candidates:
/// `min(remaining / addrs_left, 10s)`. A slow first address can never
/// starve the candidates behind it.
pub fn per_addr_budget(remaining: Duration, addrs_left: usize) -> Duration {
    if addrs_left == 0 {
        return Duration::ZERO;
    }
    (remaining / addrs_left as u32).min(MAX_PER_ADDR_BUDGET)
}

/// Resolve a host:port to candidate addresses.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::DnsFailed {
            host: host.to_string(),
            source: e,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::DnsFailed {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

/// Happy Eyeballs ordering (RFC 8305, simplified): interleave address
/// families starting with the resolver's first preference.
pub fn interleave_families(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<&SocketAddr>, Vec<&SocketAddr>) =
        addrs.iter().partition(|a| a.is_ipv6());
    let first_is_v6 = addrs.first().map(|a| a.is_ipv6()).unwrap_or(false);
    let (primary, secondary) = if first_is_v6 { (v6, v4) } else { (v4, v6) };

    let mut out = Vec::with_capacity(primary.len() + secondary.len());
    let mut p = primary.into_iter();
    let mut s = secondary.into_iter();
    loop {
        match (p.next(), s.next()) {
            (Some(a), Some(b)) => {
                out.push(*a);
                out.push(*b);
            }
            (Some(a), None) => out.push(*a),
            (None, Some(b)) => out.push(*b),
            (None, None) => break,
        }
    }
    out
}

/// Options for the raw TCP dial.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Bind outgoing connections to this local address; also filters
    /// candidates to the matching family.
    pub local_bind: Option<IpAddr>,
    /// Total connect budget across all addresses.
    pub connect_timeout: Option<Duration>,
}

/// Dial the first address that answers, walking candidates in Happy
/// Eyeballs order with divided budgets.
pub async fn dial_first(
    host: &str,
    port: u16,
    opts: &DialOptions,
    cancel: &CancelToken,
) -> Result<(TcpStream, SocketAddr)> {
    cancel.check()?;
    let started = Instant::now();
    let total_budget = opts.connect_timeout.unwrap_or(Duration::from_secs(30));

    let mut addrs = interleave_families(resolve(host, port).await?);
    if let Some(bind) = opts.local_bind {
        addrs.retain(|a| a.is_ipv4() == bind.is_ipv4());
        if addrs.is_empty() {
            return Err(Error::configuration(format!(
                "no {} addresses for {host} match local bind {bind}",
                if bind.is_ipv4() { "IPv4" } else { "IPv6" },
            )));
        }
    }

    let mut last_err: Option<Error> = None;
    let count = addrs.len();
    for (i, addr) in addrs.into_iter().enumerate() {
        cancel.check()?;
        let remaining = total_budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(last_err.unwrap_or(Error::DeadlineExceeded("tcp connect")));
        }
        let budget = per_addr_budget(remaining, count - i);

        let attempt = connect_one(addr, opts.local_bind);
        let result = tokio::select! {
            r = tokio::time::timeout(budget, attempt) => r,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        match result {
            Ok(Ok(stream)) => return Ok((stream, addr)),
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "dial attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                tracing::debug!(%addr, ?budget, "dial attempt timed out");
                last_err = Some(Error::DialTcpFailed {
                    addr: addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        }
    }

    Err(last_err.unwrap_or(Error::DeadlineExceeded("tcp connect")))
}

async fn connect_one(addr: SocketAddr, local_bind: Option<IpAddr>) -> Result<TcpStream> {
    let map_err = |e: std::io::Error| Error::DialTcpFailed {
        addr: addr.to_string(),
        source: e,
    };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4().map_err(map_err)?
    } else {
        TcpSocket::new_v6().map_err(map_err)?
    };
    if let Some(ip) = local_bind {
        socket.bind(SocketAddr::new(ip, 0)).map_err(map_err)?;
    }
    socket.connect(addr).await.map_err(map_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_division_and_cap() {
        // 30s over 3 addresses: even split.
        assert_eq!(
            per_addr_budget(Duration::from_secs(30), 3),
            Duration::from_secs(10)
        );
        // 6s over 3 addresses: 2s each.
        assert_eq!(
            per_addr_budget(Duration::from_secs(6), 3),
            Duration::from_secs(2)
        );
        // 60s over 2 addresses: capped at 10s.
        assert_eq!(
            per_addr_budget(Duration::from_secs(60), 2),
            Duration::from_secs(10)
        );
        assert_eq!(per_addr_budget(Duration::from_secs(5), 0), Duration::ZERO);
    }

    #[test]
    fn budget_leaves_room_for_later_addresses() {
        // Scenario: 6s total, 3 addresses. Address 1 exhausts its 2s;
        // at least two more attempts must fit in the remaining 4s.
        let total = Duration::from_secs(6);
        let first = per_addr_budget(total, 3);
        assert_eq!(first, Duration::from_secs(2));

        let remaining = total - first;
        let second = per_addr_budget(remaining, 2);
        assert_eq!(second, Duration::from_secs(2));

        let remaining = remaining - second;
        let third = per_addr_budget(remaining, 1);
        assert_eq!(third, Duration::from_secs(2));
    }

    #[test]
    fn interleave_alternates_families() {
        let addrs: Vec<SocketAddr> = vec![
            "[2001:db8::1]:443".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            "2.2.2.2:443".parse().unwrap(),
        ];
        let ordered = interleave_families(addrs);
        assert!(ordered[0].is_ipv6());
        assert!(ordered[1].is_ipv4());
        assert!(ordered[2].is_ipv6());
        assert!(ordered[3].is_ipv4());
    }

    #[test]
    fn interleave_keeps_v4_first_when_resolver_prefers_it() {
        let addrs: Vec<SocketAddr> = vec![
            "1.1.1.1:443".parse().unwrap(),
            "[2001:db8::1]:443".parse().unwrap(),
        ];
        let ordered = interleave_families(addrs);
        assert!(ordered[0].is_ipv4());
        assert!(ordered[1].is_ipv6());
    }

    #[tokio::test]
    async fn dial_connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let opts = DialOptions {
            connect_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let (stream, picked) = dial_first(
            "127.0.0.1",
            addr.port(),
            &opts,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(picked.port(), addr.port());
        drop(stream);
    }

    #[tokio::test]
    async fn cancelled_dial_returns_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let opts = DialOptions::default();
        let err = dial_first("127.0.0.1", 1, &opts, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
