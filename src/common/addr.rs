use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use anyhow::Result;
use serde::Deserialize;

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// DNS 解析为 SocketAddr
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let port = *port;
                let resolved = tokio::task::spawn_blocking(move || addr_str.to_socket_addrs())
                    .await??
                    .next()
                    .ok_or_else(|| {
                        anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)
                    })?;
                Ok(resolved)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // 尝试解析为 SocketAddr
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        // 尝试解析为 host:port
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return Ok(Address::Ip(SocketAddr::new(ip, port)));
                }
                return Ok(Address::Domain(host.to_string(), port));
            }
        }
        Err(serde::de::Error::custom(format!("invalid address: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_and_host() {
        let ip_addr = Address::Ip("10.0.0.1:3000".parse().unwrap());
        assert_eq!(ip_addr.port(), 3000);
        assert_eq!(ip_addr.host(), "10.0.0.1");

        let domain_addr = Address::Domain("foo.bar".to_string(), 8443);
        assert_eq!(domain_addr.port(), 8443);
        assert_eq!(domain_addr.host(), "foo.bar");
    }

    #[test]
    fn display_format() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert_eq!(format!("{}", addr), "example.com:443");

        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        assert_eq!(format!("{}", addr), "1.2.3.4:80");
    }

    #[tokio::test]
    async fn resolve_ip_is_identity() {
        let addr = Address::Ip("127.0.0.1:9000".parse().unwrap());
        assert_eq!(addr.resolve().await.unwrap(), "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn deserialize_forms() {
        let ip: Address = serde_json::from_str("\"1.2.3.4:80\"").unwrap();
        assert_eq!(ip, Address::Ip("1.2.3.4:80".parse().unwrap()));

        let domain: Address = serde_json::from_str("\"example.com:443\"").unwrap();
        assert_eq!(domain, Address::Domain("example.com".to_string(), 443));

        let bad: Result<Address, _> = serde_json::from_str("\"no-port\"");
        assert!(bad.is_err());
    }
}
