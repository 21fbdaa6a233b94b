// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! DNS resolution feeding Happy Eyeballs dialing. `hickory-resolver`'s
//! client API is synchronous, and the scheduler has no secondary runtime to
//! hand blocking work to, so each record-type query runs on its own
//! one-shot OS thread; the calling task parks on a small future that the
//! thread wakes on completion, rather than blocking the scheduler itself.
//! The A and AAAA queries run on two such threads in parallel, exactly as
//! Happy Eyeballs expects.

use crate::fail::Fail;
use hickory_resolver::{config::*, Resolver};
use std::{
    future::Future,
    net::IpAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
    thread,
};

enum State<T> {
    Pending,
    Waiting(Waker),
    Done(T),
}

/// Runs `f` on a dedicated thread and resolves once it completes, waking
/// the polling task rather than blocking it.
fn spawn_blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> impl Future<Output = T> {
    let state = Arc::new(Mutex::new(State::Pending));
    let state_thread = state.clone();
    thread::spawn(move || {
        let result = f();
        let waker = {
            let mut guard = state_thread.lock().unwrap();
            match std::mem::replace(&mut *guard, State::Done(result)) {
                State::Waiting(w) => Some(w),
                _ => None,
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
    });
    BlockingResult { state }
}

struct BlockingResult<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Future for BlockingResult<T> {
    type Output = T;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<T> {
        let mut guard = self.state.lock().unwrap();
        match std::mem::replace(&mut *guard, State::Pending) {
            State::Done(v) => Poll::Ready(v),
            _ => {
                *guard = State::Waiting(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

fn lookup_v4(host: &str) -> Result<Vec<IpAddr>, Fail> {
    let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
        .map_err(|_| Fail::HostUnreachable)?;
    let response = resolver.ipv4_lookup(host).map_err(|_| Fail::HostUnreachable)?;
    Ok(response.iter().map(|a| IpAddr::V4(a.0)).collect())
}

fn lookup_v6(host: &str) -> Result<Vec<IpAddr>, Fail> {
    let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
        .map_err(|_| Fail::HostUnreachable)?;
    let response = resolver.ipv6_lookup(host).map_err(|_| Fail::HostUnreachable)?;
    Ok(response.iter().map(|a| IpAddr::V6(a.0)).collect())
}

/// Resolves `host` to every address record of both families. The A and
/// AAAA queries run concurrently; a failure in one family is tolerated as
/// long as the other returns at least one address, matching how Happy
/// Eyeballs treats a resolver that only has one of the two records.
pub async fn resolve_host(host: &str) -> Result<Vec<IpAddr>, Fail> {
    let host_v4 = host.to_string();
    let host_v6 = host.to_string();
    let (v4, v6) = futures::join!(
        spawn_blocking(move || lookup_v4(&host_v4)),
        spawn_blocking(move || lookup_v6(&host_v6)),
    );

    let mut addrs = Vec::new();
    let mut last_err = None;
    match v4 {
        Ok(mut a) => addrs.append(&mut a),
        Err(e) => last_err = Some(e),
    }
    match v6 {
        Ok(mut a) => addrs.append(&mut a),
        Err(e) => last_err = Some(e),
    }
    if addrs.is_empty() {
        return Err(last_err.unwrap_or(Fail::HostUnreachable));
    }
    Ok(addrs)
}
