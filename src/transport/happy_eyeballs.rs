// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Happy Eyeballs (RFC 8305-style) dialing: resolve both address families,
//! prefer IPv6 by racing it against IPv4 with a short head start, and
//! stagger further connection attempts so one slow/black-holed address
//! cannot stall the whole dial. All racing attempts live in one private
//! [`Bundle`], so losing attempts are cancelled the instant a winner is
//! found -- no attempt outlives the call that started it.

use crate::{
    bundle::Bundle,
    chan::Channel,
    fail::Fail,
    resolve::resolve_host,
    sched::{go, sleep_until},
    timer::{after, Deadline},
    transport::tcp::TcpStream,
};
use std::{
    cell::Cell,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::Duration,
};

/// How long an IPv6 attempt gets to succeed before an IPv4 attempt is
/// allowed to start, when both families are available.
const IPV6_PREFERENCE_WINDOW: Duration = Duration::from_millis(50);

/// Delay between successive connection attempts down the sorted address
/// list, alternating families.
const ATTEMPT_STAGGER: Duration = Duration::from_millis(300);

/// Interleaves a resolved address list so attempts alternate families,
/// starting with whichever family has the first (i.e. most preferred)
/// address.
fn interleave(addrs: Vec<IpAddr>) -> Vec<IpAddr> {
    let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) = addrs.into_iter().partition(|a| a.is_ipv6());
    let (first, second) = if v6.first().is_some() {
        (v6, v4)
    } else {
        (v4, v6)
    };
    let mut out = Vec::with_capacity(first.len() + second.len());
    let mut fi = first.into_iter();
    let mut si = second.into_iter();
    loop {
        let f = fi.next();
        let s = si.next();
        if f.is_none() && s.is_none() {
            break;
        }
        if let Some(f) = f {
            out.push(f);
        }
        if let Some(s) = s {
            out.push(s);
        }
    }
    out
}

/// Connects to `host:port`, trying every resolved address in Happy
/// Eyeballs order and returning the first successful stream. Fails with
/// the last attempt's error if every address is exhausted before
/// `deadline`.
pub async fn dial(host: &str, port: u16, deadline: Deadline) -> Result<TcpStream, Fail> {
    let addrs = resolve_host(host).await?;
    let ordered = interleave(addrs);
    if ordered.is_empty() {
        return Err(Fail::HostUnreachable);
    }

    let winner: Channel<Result<TcpStream, Fail>> = Channel::new();
    let bundle = Bundle::new();
    let remaining = Rc::new(Cell::new(ordered.len()));

    for (i, addr) in ordered.into_iter().enumerate() {
        let winner = winner.clone();
        let remaining = remaining.clone();
        let sock = SocketAddr::new(addr, port);
        let stagger = match i {
            0 => Duration::ZERO,
            1 => IPV6_PREFERENCE_WINDOW,
            n => ATTEMPT_STAGGER * n as u32,
        };
        bundle.go(async move {
            if !stagger.is_zero() {
                let _ = sleep_until(after(stagger)).await;
            }
            match TcpStream::connect(sock, deadline).await {
                Ok(stream) => {
                    let _ = winner.send(Ok(stream), None).await;
                }
                Err(e) => {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let _ = winner.send(Err(e), None).await;
                    }
                }
            }
        });
    }

    let result = winner.recv(deadline).await;
    bundle.close().await;
    result?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn interleave_alternates_families_preferring_v6_first() {
        let addrs = vec![
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V6("::1".parse().unwrap()),
            IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
        ];
        let out = interleave(addrs);
        assert!(out[0].is_ipv6());
        assert!(out[1].is_ipv4());
    }
}
