use std::net::{IpAddr, SocketAddr};

use crate::{Error, Result};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:30000";
pub const DEFAULT_DNS: &str = "dns.alidns.com/dns-query";
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";
const DEFAULT_SERVER_PORT: u16 = 443;

#[derive(Debug, Clone)]
pub struct Config {
    /// SOCKS5 and HTTP share this listener
    pub listen_addr: String,
    /// relay server, `host[:port][/path]`
    pub server_addr: String,
    /// pin the relay server's IP instead of resolving it
    pub server_ip: Option<String>,
    pub token: Option<String>,
    /// DoH endpoint used for the ECH lookup
    pub dns_server: String,
    pub ech_domain: String,
    /// fallback IP handed to the relay with every connect request
    pub proxy_ip: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN.to_string(),
            server_addr: String::new(),
            server_ip: None,
            token: None,
            dns_server: DEFAULT_DNS.to_string(),
            ech_domain: DEFAULT_ECH_DOMAIN.to_string(),
            proxy_ip: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("listen address {:?}: {e}", self.listen_addr)))?;
        self.endpoint()?;
        self.pinned_ip()?;
        if self.dns_server.trim().is_empty() {
            return Err(Error::Config("dns server is empty".into()));
        }
        if self.ech_domain.trim().is_empty() {
            return Err(Error::Config("ech domain is empty".into()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.server_addr)
    }

    pub fn pinned_ip(&self) -> Result<Option<IpAddr>> {
        non_empty(&self.server_ip)
            .map(|ip| {
                ip.parse()
                    .map_err(|_| Error::Config(format!("server ip {ip:?} is not an ip address")))
            })
            .transpose()
    }

    pub fn fallback_ip(&self) -> Option<String> {
        non_empty(&self.proxy_ip).map(str::to_string)
    }

    pub fn token(&self) -> Option<String> {
        non_empty(&self.token).map(str::to_string)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Where the tunnel transport connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// bare host, IPv6 without brackets
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn parse(addr: &str) -> Result<Self> {
        let invalid = |why: &str| Error::Config(format!("server address {addr:?}: {why}"));

        let rest = addr.trim();
        let rest = rest
            .strip_prefix("wss://")
            .or_else(|| rest.strip_prefix("https://"))
            .unwrap_or(rest);
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.strip_prefix('[') {
            Some(v6) => {
                let (host, tail) = v6.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
                match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None if tail.is_empty() => (host, None),
                    None => return Err(invalid("junk after ']'")),
                }
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => DEFAULT_SERVER_PORT,
        };
        if port == 0 {
            return Err(invalid("port 0"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("wss://[{}]:{}{}", self.host, self.port, self.path)
        } else {
            format!("wss://{}:{}{}", self.host, self.port, self.path)
        }
    }
}
