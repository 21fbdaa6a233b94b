// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end UDP coverage for the [`LibOs`] facade: unconnected sockets
//! receiving from arbitrary peers, connected sockets restricted to one
//! peer, and the datagram boundary being preserved end to end.

use nanort::{LibOs, LibOsOptions};

#[test]
fn connected_sockets_exchange_datagrams() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    libos.block_on(async move {
        let (server, server_addr) = libos
            .socket_udp("127.0.0.1:0".parse().unwrap())
            .unwrap();

        let (client, client_addr) = libos
            .connect_udp("127.0.0.1:0".parse().unwrap(), server_addr)
            .unwrap();

        let (server_conn, _) = libos.connect_udp(server_addr, client_addr).unwrap();
        libos.close(server).unwrap();

        libos.send_msg(client, b"hello", None).await.unwrap();
        let mut buf = [0u8; 64];
        let n = libos.recv_msg(server_conn, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        libos.send_msg(server_conn, b"world", None).await.unwrap();
        let n = libos.recv_msg(client, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        libos.close(client).unwrap();
        libos.close(server_conn).unwrap();
    });
}

#[test]
fn unconnected_socket_receives_from_any_peer() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    libos.block_on(async move {
        let (server, server_addr) = libos
            .socket_udp("127.0.0.1:0".parse().unwrap())
            .unwrap();

        let (sender_a, _) = libos
            .connect_udp("127.0.0.1:0".parse().unwrap(), server_addr)
            .unwrap();
        let (sender_b, _) = libos
            .connect_udp("127.0.0.1:0".parse().unwrap(), server_addr)
            .unwrap();

        libos.send_msg(sender_a, b"from-a", None).await.unwrap();
        libos.send_msg(sender_b, b"from-b", None).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut buf = [0u8; 64];
            let n = libos.recv_msg(server, &mut buf, None).await.unwrap();
            seen.push(buf[..n].to_vec());
        }
        seen.sort();
        assert_eq!(seen, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

        libos.close(server).unwrap();
        libos.close(sender_a).unwrap();
        libos.close(sender_b).unwrap();
    });
}

#[test]
fn message_larger_than_buffer_reports_too_long() {
    let libos = LibOs::new(LibOsOptions::default()).unwrap();
    libos.block_on(async move {
        let (server, server_addr) = libos
            .socket_udp("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let (client, _) = libos
            .connect_udp("127.0.0.1:0".parse().unwrap(), server_addr)
            .unwrap();

        libos.send_msg(client, &[7u8; 128], None).await.unwrap();
        let mut small = [0u8; 4];
        assert!(libos.recv_msg(server, &mut small, None).await.is_err());

        libos.close(server).unwrap();
        libos.close(client).unwrap();
    });
}
