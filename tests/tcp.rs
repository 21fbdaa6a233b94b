// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end TCP coverage for the [`LibOs`] facade: bind/accept/connect,
//! send/recv in both directions, and handle teardown, all driven over a
//! real loopback socket on a single-threaded scheduler.

use nanort::{LibOs, LibOsOptions};

#[test]
fn connect_send_recv_close_roundtrip() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    let server_libos = libos.clone();
    libos.block_on(async move {
        let mut listener = server_libos
            .bind_tcp("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_libos = server_libos.clone();
        let server = nanort::go(async move {
            let (h, _peer) = accept_libos.accept_tcp(&mut listener, None).await.unwrap();
            let mut buf = [0u8; 64];
            let n = accept_libos.recv(h, &mut buf, None).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            accept_libos.send(h, b"pong", None).await.unwrap();
            accept_libos.close(h).unwrap();
        });

        let client = server_libos.connect_tcp(addr, None).await.unwrap();
        server_libos.send(client, b"ping", None).await.unwrap();
        let mut buf = [0u8; 64];
        let n = server_libos.recv(client, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        server_libos.close(client).unwrap();
        server.wait().await;
    });
}

#[test]
fn recv_after_close_fails() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    let server_libos = libos.clone();
    libos.block_on(async move {
        let mut listener = server_libos
            .bind_tcp("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_libos = server_libos.clone();
        let server = nanort::go(async move {
            let (h, _) = accept_libos.accept_tcp(&mut listener, None).await.unwrap();
            accept_libos.close(h).unwrap();
        });

        let client = server_libos.connect_tcp(addr, None).await.unwrap();
        server.wait().await;
        server_libos.close(client).unwrap();
        let mut buf = [0u8; 16];
        assert!(server_libos.recv(client, &mut buf, None).await.is_err());
    });
}

#[test]
fn multiple_connections_are_independent() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    let server_libos = libos.clone();
    libos.block_on(async move {
        let mut listener = server_libos
            .bind_tcp("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_libos = server_libos.clone();
        let server = nanort::go(async move {
            for _ in 0..2 {
                let (h, _) = accept_libos.accept_tcp(&mut listener, None).await.unwrap();
                let mut buf = [0u8; 16];
                let n = accept_libos.recv(h, &mut buf, None).await.unwrap();
                let echoed = buf[..n].to_vec();
                accept_libos.send(h, &echoed, None).await.unwrap();
                accept_libos.close(h).unwrap();
            }
        });

        for msg in [&b"alice"[..], &b"bob"[..]] {
            let client = server_libos.connect_tcp(addr, None).await.unwrap();
            server_libos.send(client, msg, None).await.unwrap();
            let mut buf = [0u8; 16];
            let n = server_libos.recv(client, &mut buf, None).await.unwrap();
            assert_eq!(&buf[..n], msg);
            server_libos.close(client).unwrap();
        }
        server.wait().await;
    });
}
