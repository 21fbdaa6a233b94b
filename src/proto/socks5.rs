// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `socks5`: client and server sides of a SOCKS version 5 (RFC 1928)
//! negotiation, restricted to the `CONNECT` command, the "no authentication
//! required" method, and RFC 1929 username/password subnegotiation.

use crate::{fail::Fail, proto::framing::{read_exact, write_all}, sock::ByteStream, timer::Deadline};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// RFC 1929 username/password credentials offered by a client, or checked
/// by a server.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A SOCKS5 request target: either a resolved address or a hostname the
/// server is expected to resolve itself.
pub enum Target {
    Addr(SocketAddr),
    Domain(String, u16),
}

/// Maps a SOCKS5 reply code to this crate's error taxonomy, the same
/// translation a SOCKS5 client performs against `errno` on a POSIX host.
fn reply_to_fail(code: u8) -> Fail {
    match code {
        0x00 => unreachable!("success is not an error"),
        0x01 => Fail::Protocol { details: "protocol violation" },
        0x02 => Fail::PermissionDenied,
        0x03 => Fail::NetworkUnreachable,
        0x04 => Fail::HostUnreachable,
        0x05 => Fail::ConnectionRefused,
        0x06 => Fail::Timedout,
        0x07 => Fail::NotSupported { details: "operation not supported" },
        0x08 => Fail::AddressFamilySupport,
        _ => Fail::Protocol { details: "protocol violation" },
    }
}

/// Runs the client side of a SOCKS5 handshake over an already-connected
/// stream to the proxy, requesting a `CONNECT` to `target`. When `auth` is
/// given, offers RFC 1929 username/password and runs the subnegotiation if
/// the proxy selects it; otherwise offers only "no authentication
/// required". Returns the address the proxy bound on its side for the
/// relayed connection.
pub async fn client_connect(
    stream: &mut dyn ByteStream,
    target: Target,
    auth: Option<&Credentials>,
    deadline: Deadline,
) -> Result<SocketAddr, Fail> {
    let offered = if auth.is_some() { METHOD_USER_PASS } else { METHOD_NO_AUTH };
    write_all(stream, &[VERSION, 1, offered], deadline).await?;
    let mut reply = [0u8; 2];
    read_exact(stream, &mut reply, deadline).await?;
    if reply[0] != VERSION {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    match (reply[1], auth) {
        (m, None) if m == METHOD_NO_AUTH => {}
        (m, Some(creds)) if m == METHOD_USER_PASS => {
            client_authenticate(stream, creds, deadline).await?;
        }
        (METHOD_NONE_ACCEPTABLE, _) => {
            return Err(Fail::NotSupported { details: "operation not supported" });
        }
        _ => return Err(Fail::Protocol { details: "protocol violation" }),
    }

    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    encode_address(&mut request, &target);
    write_all(stream, &request, deadline).await?;

    let mut header = [0u8; 4];
    read_exact(stream, &mut header, deadline).await?;
    if header[0] != VERSION {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    if header[1] != 0x00 {
        return Err(reply_to_fail(header[1]));
    }
    decode_address(stream, header[3], deadline).await
}

/// Runs the server side: negotiates a method, reads the `CONNECT` request,
/// and returns the requested target. The caller is responsible for making
/// the outbound connection and calling [`server_reply`] with the result.
///
/// When `authenticator` is `Some`, only RFC 1929 username/password is
/// offered and the callback decides whether a presented credential pair is
/// accepted; when it is `None`, only "no authentication required" is
/// offered. Fails with [`Fail::PermissionDenied`] if the client's
/// credentials are rejected.
pub async fn server_negotiate(
    stream: &mut dyn ByteStream,
    authenticator: Option<&dyn Fn(&str, &str) -> bool>,
    deadline: Deadline,
) -> Result<Target, Fail> {
    let mut header = [0u8; 2];
    read_exact(stream, &mut header, deadline).await?;
    if header[0] != VERSION {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    let mut methods = vec![0u8; header[1] as usize];
    read_exact(stream, &mut methods, deadline).await?;

    let required = if authenticator.is_some() { METHOD_USER_PASS } else { METHOD_NO_AUTH };
    if !methods.contains(&required) {
        write_all(stream, &[VERSION, METHOD_NONE_ACCEPTABLE], deadline).await?;
        return Err(Fail::NotSupported { details: "operation not supported" });
    }
    write_all(stream, &[VERSION, required], deadline).await?;

    if let Some(authenticator) = authenticator {
        server_authenticate(stream, authenticator, deadline).await?;
    }

    let mut request_header = [0u8; 4];
    read_exact(stream, &mut request_header, deadline).await?;
    if request_header[0] != VERSION || request_header[1] != CMD_CONNECT {
        return Err(Fail::NotSupported { details: "operation not supported" });
    }
    let port_and_addr = decode_target(stream, request_header[3], deadline).await?;
    Ok(port_and_addr)
}

/// Sends the SOCKS5 reply for a completed (or failed) `CONNECT`.
/// `bound` is the address the relayed connection was made from, when
/// `result` is `Ok`.
pub async fn server_reply(
    stream: &mut dyn ByteStream,
    result: Result<SocketAddr, u8>,
    deadline: Deadline,
) -> Result<(), Fail> {
    let mut reply = vec![VERSION];
    match result {
        Ok(addr) => {
            reply.push(0x00);
            reply.push(0x00);
            encode_address(&mut reply, &Target::Addr(addr));
        }
        Err(code) => {
            reply.push(code);
            reply.push(0x00);
            reply.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        }
    }
    write_all(stream, &reply, deadline).await
}

/// Client side of RFC 1929: sends the username/password subnegotiation
/// request and checks the server's status reply.
async fn client_authenticate(
    stream: &mut dyn ByteStream,
    creds: &Credentials,
    deadline: Deadline,
) -> Result<(), Fail> {
    if creds.username.len() > 255 || creds.password.len() > 255 {
        return Err(Fail::Invalid { details: "socks5 username or password exceeds 255 bytes" });
    }
    let mut request = vec![USER_PASS_VERSION, creds.username.len() as u8];
    request.extend_from_slice(creds.username.as_bytes());
    request.push(creds.password.len() as u8);
    request.extend_from_slice(creds.password.as_bytes());
    write_all(stream, &request, deadline).await?;

    let mut reply = [0u8; 2];
    read_exact(stream, &mut reply, deadline).await?;
    if reply[0] != USER_PASS_VERSION {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    if reply[1] != 0x00 {
        return Err(Fail::PermissionDenied);
    }
    Ok(())
}

/// Server side of RFC 1929: reads the subnegotiation request, hands the
/// credentials to `authenticator`, and replies with the outcome.
async fn server_authenticate(
    stream: &mut dyn ByteStream,
    authenticator: &dyn Fn(&str, &str) -> bool,
    deadline: Deadline,
) -> Result<(), Fail> {
    let mut version_and_ulen = [0u8; 2];
    read_exact(stream, &mut version_and_ulen, deadline).await?;
    if version_and_ulen[0] != USER_PASS_VERSION {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    let mut username = vec![0u8; version_and_ulen[1] as usize];
    read_exact(stream, &mut username, deadline).await?;
    let mut plen = [0u8; 1];
    read_exact(stream, &mut plen, deadline).await?;
    let mut password = vec![0u8; plen[0] as usize];
    read_exact(stream, &mut password, deadline).await?;

    let username = String::from_utf8(username).map_err(|_| Fail::Protocol { details: "protocol violation" })?;
    let password = String::from_utf8(password).map_err(|_| Fail::Protocol { details: "protocol violation" })?;
    let accepted = authenticator(&username, &password);
    write_all(stream, &[USER_PASS_VERSION, if accepted { 0x00 } else { 0x01 }], deadline).await?;
    if !accepted {
        return Err(Fail::PermissionDenied);
    }
    Ok(())
}

fn encode_address(out: &mut Vec<u8>, target: &Target) {
    match target {
        Target::Addr(SocketAddr::V4(addr)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Addr(SocketAddr::V6(addr)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Domain(host, port) => {
            out.push(ATYP_DOMAIN);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
}

async fn decode_address(
    stream: &mut dyn ByteStream,
    atyp: u8,
    deadline: Deadline,
) -> Result<SocketAddr, Fail> {
    match decode_target(stream, atyp, deadline).await? {
        Target::Addr(addr) => Ok(addr),
        Target::Domain(..) => Err(Fail::Protocol { details: "protocol violation" }),
    }
}

async fn decode_target(
    stream: &mut dyn ByteStream,
    atyp: u8,
    deadline: Deadline,
) -> Result<Target, Fail> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            read_exact(stream, &mut buf, deadline).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(Target::Addr(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            read_exact(stream, &mut buf, deadline).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(Target::Addr(SocketAddr::new(IpAddr::V6(ip), port)))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            read_exact(stream, &mut len_buf, deadline).await?;
            let mut buf = vec![0u8; len_buf[0] as usize + 2];
            read_exact(stream, &mut buf, deadline).await?;
            let host = String::from_utf8(buf[..buf.len() - 2].to_vec()).map_err(|_| Fail::Protocol { details: "protocol violation" })?;
            let port = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
            Ok(Target::Domain(host, port))
        }
        _ => Err(Fail::Protocol { details: "protocol violation" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn client_server_connect_roundtrip() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (mut stream, _) = listener.accept(None).await.unwrap();
                let target = server_negotiate(&mut stream, None, None).await.unwrap();
                match target {
                    Target::Domain(host, port) => {
                        assert_eq!(host, "example.com");
                        assert_eq!(port, 443);
                    }
                    _ => panic!("expected a domain target"),
                }
                server_reply(&mut stream, Ok("127.0.0.1:9999".parse().unwrap()), None)
                    .await
                    .unwrap();
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let bound = client_connect(
                &mut client,
                Target::Domain("example.com".to_string(), 443),
                None,
                None,
            )
            .await
            .unwrap();
            assert_eq!(bound.port(), 9999);
            server.wait().await;
        });
    }

    #[test]
    fn username_password_auth_accepted() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (mut stream, _) = listener.accept(None).await.unwrap();
                let check = |u: &str, p: &str| u == "alice" && p == "hunter2";
                let target = server_negotiate(&mut stream, Some(&check), None)
                    .await
                    .unwrap();
                assert!(matches!(target, Target::Domain(ref h, 443) if h == "example.com"));
                server_reply(&mut stream, Ok("127.0.0.1:9999".parse().unwrap()), None)
                    .await
                    .unwrap();
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let creds = Credentials { username: "alice".to_string(), password: "hunter2".to_string() };
            let bound = client_connect(
                &mut client,
                Target::Domain("example.com".to_string(), 443),
                Some(&creds),
                None,
            )
            .await
            .unwrap();
            assert_eq!(bound.port(), 9999);
            server.wait().await;
        });
    }

    #[test]
    fn username_password_auth_rejected() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (mut stream, _) = listener.accept(None).await.unwrap();
                let check = |_: &str, _: &str| false;
                let err = server_negotiate(&mut stream, Some(&check), None)
                    .await
                    .unwrap_err();
                assert_eq!(err, Fail::PermissionDenied);
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let creds = Credentials { username: "alice".to_string(), password: "wrong".to_string() };
            let err = client_connect(
                &mut client,
                Target::Domain("example.com".to_string(), 443),
                Some(&creds),
                None,
            )
            .await
            .unwrap_err();
            assert_eq!(err, Fail::PermissionDenied);
            server.wait().await;
        });
    }
}
