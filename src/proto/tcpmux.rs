// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `tcpmux`: a tiny RFC 1078-style service multiplexer. A client connects
//! to one well-known broker listener, sends a CRLF-terminated service name,
//! and the broker hands its connection's file descriptor off to whichever
//! backend registered that name -- via `SCM_RIGHTS` over a second IPC
//! socket -- so the client ends up talking directly to the backend with no
//! byte-relay hop through the broker.

use crate::{
    fail::Fail,
    proto::crlf::CrlfSocket,
    timer::Deadline,
    transport::ipc::{IpcListener, IpcStream},
};
use std::{
    cell::RefCell,
    collections::HashMap,
    io::{IoSlice, IoSliceMut},
    os::unix::io::AsRawFd,
    path::PathBuf,
};

const MAX_SERVICE_NAME_LEN: usize = 256;

/// Maps service names to the IPC path a backend is listening on for
/// handoffs.
#[derive(Default)]
pub struct Broker {
    routes: RefCell<HashMap<String, PathBuf>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: impl Into<String>, handoff_path: impl Into<PathBuf>) {
        self.routes.borrow_mut().insert(service.into(), handoff_path.into());
    }

    pub fn unregister(&self, service: &str) {
        self.routes.borrow_mut().remove(service);
    }

    fn lookup(&self, service: &str) -> Option<PathBuf> {
        self.routes.borrow().get(service).cloned()
    }
}

/// Sends the client-side handshake -- the service name -- and returns the
/// raw byte stream ready for the handed-off conversation.
pub async fn request(
    stream: IpcStream,
    service: &str,
    deadline: Deadline,
) -> Result<IpcStream, Fail> {
    let mut framed = CrlfSocket::new(stream, MAX_SERVICE_NAME_LEN);
    framed
        .send_msg(&[IoSlice::new(service.as_bytes())], deadline)
        .await?;
    Ok(framed.into_inner())
}

/// Accepts one client connection already carrying a `tcpmux` handshake,
/// looks its requested service up in `broker`, and hands the client's
/// connection off to the registered backend. The caller spawns one of
/// these per accepted connection; once it returns, the broker holds no
/// reference to the client's connection at all -- only the backend does.
pub async fn serve_one(broker: &Broker, client: IpcStream, deadline: Deadline) -> Result<(), Fail> {
    let mut framed = CrlfSocket::new(client, MAX_SERVICE_NAME_LEN);
    let mut name_buf = [0u8; MAX_SERVICE_NAME_LEN];
    let n = framed
        .recv_msg(&mut [IoSliceMut::new(&mut name_buf)], deadline)
        .await?;
    let service = String::from_utf8(name_buf[..n].to_vec()).map_err(|_| Fail::Protocol { details: "protocol violation" })?;
    let handoff_path = broker.lookup(&service).ok_or(Fail::BadHandle)?;

    let client_stream = framed.into_inner();
    let mut handoff = IpcStream::connect(handoff_path, deadline).await?;
    handoff
        .send_fd(service.as_bytes(), client_stream.as_raw_fd(), deadline)
        .await?;
    // client_stream drops here, closing the broker's copy of the fd; the
    // backend's duplicate (from send_fd) keeps the underlying connection alive.
    Ok(())
}

/// Backend side of a handoff: accepts one connection on `listener` (the
/// broker dialing in to deliver a client), reads the service name sent
/// alongside the descriptor, and returns the client's connection ready for
/// direct use.
pub async fn accept_handoff(
    listener: &mut IpcListener,
    deadline: Deadline,
) -> Result<(String, IpcStream), Fail> {
    let mut conn = listener.accept(deadline).await?;
    let mut buf = [0u8; MAX_SERVICE_NAME_LEN];
    let (n, fd) = conn.recv_fd(&mut buf, deadline).await?;
    let fd = fd.ok_or(Fail::Protocol { details: "handoff carried no file descriptor" })?;
    let service = String::from_utf8(buf[..n].to_vec()).map_err(|_| Fail::Protocol { details: "protocol violation" })?;
    let client = unsafe { IpcStream::from_raw_fd(fd)? };
    Ok((service, client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_looks_up_registered_services() {
        let broker = Broker::new();
        let path = PathBuf::from("/tmp/tcpmux-echo.sock");
        broker.register("echo", path.clone());
        assert_eq!(broker.lookup("echo"), Some(path));
        broker.unregister("echo");
        assert_eq!(broker.lookup("echo"), None);
    }

    #[test]
    fn handoff_delivers_the_clients_connection_to_the_backend() {
        use crate::sched::Scheduler;
        use crate::sock::ByteStream;

        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let dir = std::env::temp_dir().join(format!("tcpmux-test-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let broker_path = dir.join("broker.sock");
            let handoff_path = dir.join("backend.sock");
            let _ = std::fs::remove_file(&broker_path);
            let _ = std::fs::remove_file(&handoff_path);

            let broker = Broker::new();
            broker.register("echo", handoff_path.clone());

            let mut broker_listener = IpcListener::bind(&broker_path).unwrap();
            let mut handoff_listener = IpcListener::bind(&handoff_path).unwrap();

            let backend = crate::sched::go(async move {
                let (service, mut client) = accept_handoff(&mut handoff_listener, None).await.unwrap();
                assert_eq!(service, "echo");
                let mut buf = [0u8; 32];
                let n = client.recv(&mut [IoSliceMut::new(&mut buf)], None).await.unwrap();
                client.send(&[IoSlice::new(&buf[..n])], None).await.unwrap();
            });

            let server = crate::sched::go(async move {
                let client = broker_listener.accept(None).await.unwrap();
                serve_one(&broker, client, None).await.unwrap();
            });

            let client_stream = IpcStream::connect(&broker_path, None).await.unwrap();
            let mut raw = request(client_stream, "echo", None).await.unwrap();
            raw.send(&[IoSlice::new(b"ping")], None).await.unwrap();
            let mut buf = [0u8; 32];
            let n = raw.recv(&mut [IoSliceMut::new(&mut buf)], None).await.unwrap();
            assert_eq!(&buf[..n], b"ping");

            server.wait().await;
            backend.wait().await;
            let _ = std::fs::remove_dir_all(&dir);
        });
    }
}
