//! Outbound connections, optionally through a SOCKS5 proxy.
//!
//! Onion addresses cannot be resolved locally, so the target host is always
//! sent to the proxy as a domain name (address type 3).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use thiserror::Error;
use tracing::debug;

use crate::error::PeerError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 negotiation failures.
#[derive(Error, Debug)]
pub enum SocksError {
    #[error("Host name too long for SOCKS5: {0} bytes")]
    HostTooLong(usize),

    #[error("Proxy rejected no-auth method (version {version}, method {method})")]
    AuthRejected { version: u8, method: u8 },

    #[error("SOCKS5 connect failed: status {code} ({reason})")]
    ConnectFailed { code: u8, reason: &'static str },

    #[error("Malformed SOCKS5 reply: {0}")]
    BadReply(String),

    #[error("Proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a client reaches `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialer {
    /// Plain TCP. Used on loopback and in tests.
    Direct,
    /// Through a SOCKS5 proxy such as the local Tor daemon.
    Socks5 { proxy: SocketAddr },
}

impl Dialer {
    /// Open a connected stream to `host:port`.
    pub fn connect(&self, host: &str, port: u16) -> Result<TcpStream, PeerError> {
        let mut stream = self.open(host, port)?;
        self.negotiate(&mut stream, host, port)?;
        Ok(stream)
    }

    /// First half of [`Dialer::connect`]: the raw TCP connection, to the
    /// target itself or to the proxy.
    pub fn open(&self, host: &str, port: u16) -> Result<TcpStream, PeerError> {
        match self {
            Dialer::Direct => TcpStream::connect((host, port))
                .map_err(|e| PeerError::Connection(format!("{}:{}: {}", host, port, e))),
            Dialer::Socks5 { proxy } => TcpStream::connect(proxy).map_err(|e| {
                PeerError::Connection(format!("SOCKS proxy {} unreachable: {}", proxy, e))
            }),
        }
    }

    /// Second half of [`Dialer::connect`]: tunnel setup over a stream from
    /// [`Dialer::open`]. A no-op for direct connections.
    pub fn negotiate(
        &self,
        stream: &mut TcpStream,
        host: &str,
        port: u16,
    ) -> Result<(), PeerError> {
        if let Dialer::Socks5 { proxy } = self {
            socks5_connect(stream, host, port)?;
            debug!(%proxy, host, port, "SOCKS5 tunnel established");
        }
        Ok(())
    }
}

fn socks5_connect<S: Read + Write>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<(), SocksError> {
    let host_len = u8::try_from(host.len()).map_err(|_| SocksError::HostTooLong(host.len()))?;

    stream.write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(SocksError::AuthRejected {
            version: choice[0],
            method: choice[1],
        });
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply)?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::BadReply(format!("version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(SocksError::ConnectFailed {
            code: reply[1],
            reason: reply_reason(reply[1]),
        });
    }

    // Drain the bound address so the stream is positioned at tunnel data.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => return Err(SocksError::BadReply(format!("address type {}", other))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound)?;
    Ok(())
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Minimal proxy: accepts one client, checks the CONNECT request and
    /// answers with `status`. On success it echoes four bytes of tunnel data.
    fn fake_proxy(status: u8) -> (SocketAddr, thread::JoinHandle<(String, u16)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            conn.write_all(&[5, 0]).unwrap();

            let mut head = [0u8; 5];
            conn.read_exact(&mut head).unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut host = vec![0u8; head[4] as usize];
            conn.read_exact(&mut host).unwrap();
            let mut port = [0u8; 2];
            conn.read_exact(&mut port).unwrap();

            conn.write_all(&[5, status, 0, 1, 0, 0, 0, 0, 0, 0]).unwrap();
            if status == 0 {
                let mut byte = [0u8; 4];
                conn.read_exact(&mut byte).unwrap();
                conn.write_all(&byte).unwrap();
            }
            (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
        });
        (addr, handle)
    }

    #[test]
    fn test_socks5_connect_success() {
        let (proxy, handle) = fake_proxy(0);
        let dialer = Dialer::Socks5 { proxy };
        let mut stream = dialer.connect("abcdef.onion", 5000).unwrap();

        stream.write_all(b"ping").unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"ping");

        let (host, port) = handle.join().unwrap();
        assert_eq!(host, "abcdef.onion");
        assert_eq!(port, 5000);
    }

    #[test]
    fn test_socks5_connect_refused() {
        let (proxy, handle) = fake_proxy(5);
        let dialer = Dialer::Socks5 { proxy };
        let err = dialer.connect("abcdef.onion", 5000).unwrap_err();

        assert!(matches!(err, PeerError::Connection(_)));
        assert!(err.to_string().contains("connection refused"));
        handle.join().unwrap();
    }

    #[test]
    fn test_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = listener.local_addr().unwrap();
        drop(listener);

        let err = Dialer::Socks5 { proxy }.connect("x.onion", 1).unwrap_err();
        assert!(matches!(err, PeerError::Connection(_)));
    }

    #[test]
    fn test_host_too_long() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let host = "a".repeat(300);
        assert!(matches!(
            socks5_connect(&mut buf, &host, 1),
            Err(SocksError::HostTooLong(300))
        ));
    }
}
