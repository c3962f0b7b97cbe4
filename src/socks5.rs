use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytebuffer::ByteBuffer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::request::{ParsedRequest, ProxyMode};
use crate::{Error, Result};

pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Fixed 10-byte reply with a zeroed IPv4 bind address.
pub fn reply(rep: u8) -> Vec<u8> {
    let mut msg = ByteBuffer::new();
    msg.write_bytes(&[VERSION5, rep, 0x00, ATYP_IPV4]);
    msg.write_u32(0);
    msg.write_u16(0);
    msg.into_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Addr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

#[derive(Debug)]
struct TargetAddress {
    addr: Addr,
    port: u16,
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::V4(ip) => write!(f, "{ip}:{}", self.port),
            Addr::Domain(domain) => write!(f, "{domain}:{}", self.port),
            Addr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

/// CONNECT-only SOCKS5 handshake over a client stream whose first byte
/// (the version) has not been consumed yet.
pub struct Socks5<'a, S> {
    down_stream: &'a mut S,
    client_addr: &'a str,
}

impl<'a, S> Socks5<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(down_stream: &'a mut S, client_addr: &'a str) -> Self {
        Self {
            down_stream,
            client_addr,
        }
    }

    pub async fn process(&mut self) -> Result<ParsedRequest> {
        self.read_auth().await?;
        self.resp_auth().await?;

        let target = self.read_target_address().await?.to_string();
        debug!(client = self.client_addr, target = %target, "socks5 connect");
        Ok(ParsedRequest::new(target, ProxyMode::Socks5))
    }

    async fn read_auth(&mut self) -> Result<()> {
        let version = self.down_stream.read_u8().await?;
        if version != VERSION5 {
            return Err(Error::protocol(format!("socks version 0x{version:02x}")));
        }
        let method_num = self.down_stream.read_u8().await?;
        let mut methods = vec![0; method_num as usize];
        self.down_stream.read_exact(&mut methods).await?;
        Ok(())
    }

    // Always "no authentication", whatever the client offered.
    async fn resp_auth(&mut self) -> Result<()> {
        self.down_stream.write_all(&[VERSION5, AUTH_NONE]).await?;
        Ok(())
    }

    async fn read_target_address(&mut self) -> Result<TargetAddress> {
        let mut header = [0u8; 4];
        self.down_stream.read_exact(&mut header).await?;
        let [version, command, _, addr_type] = header;

        if version != VERSION5 {
            return Err(Error::protocol(format!("socks request version 0x{version:02x}")));
        }

        let addr = match addr_type {
            ATYP_IPV4 => Addr::V4(Ipv4Addr::from(self.down_stream.read_u32().await?)),
            ATYP_DOMAIN => {
                let len = self.down_stream.read_u8().await?;
                let mut domain = vec![0; len as usize];
                self.down_stream.read_exact(&mut domain).await?;
                // the relay resolves the name, bytes that are not utf8 still go out
                Addr::Domain(String::from_utf8_lossy(&domain).into_owned())
            }
            ATYP_IPV6 => Addr::V6(Ipv6Addr::from(self.down_stream.read_u128().await?)),
            _ => {
                self.reject(REP_ADDR_NOT_SUPPORTED).await;
                return Err(Error::Rejected(format!(
                    "unsupported address type 0x{addr_type:02x}"
                )));
            }
        };

        let port = self.down_stream.read_u16().await?;

        if command != CMD_CONNECT {
            self.reject(REP_CMD_NOT_SUPPORTED).await;
            return Err(Error::Rejected(format!(
                "unsupported command 0x{command:02x}"
            )));
        }

        Ok(TargetAddress { addr, port })
    }

    async fn reject(&mut self, rep: u8) {
        let _ = self.down_stream.write_all(&reply(rep)).await;
    }
}
