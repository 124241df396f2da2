// src/ssrf.rs
//! Static URL validation for user-supplied feed and article URLs.
//!
//! Rejects anything that could reach internal resources:
//! - non-HTTP(S) schemes (file://, ftp://, gopher://)
//! - loopback, private, link-local and other special IPv4/IPv6 ranges
//! - cloud metadata hostnames and internal-only TLDs
//! - admin/database ports (explicit or scheme default)
//!
//! Only the literal host is inspected. Names are not resolved, so a public
//! hostname that later resolves to a private address is not caught here.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("invalid url: {0}")]
    Parse(String),
    #[error("scheme not allowed: {0}")]
    Scheme(String),
    #[error("url has no host")]
    NoHost,
    #[error("host not allowed: {0}")]
    BlockedHost(String),
    #[error("address in blocked range: {0}")]
    BlockedAddress(IpAddr),
    #[error("port not allowed: {0}")]
    BlockedPort(u16),
}

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata",
    "metadata.google.internal",
    "metadata.gke.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
];

const BLOCKED_SUFFIXES: &[&str] = &[
    ".local",
    ".localhost",
    ".internal",
    ".corp",
    ".intranet",
    ".lan",
];

pub const BLOCKED_PORTS: &[u16] = &[22, 23, 25, 3306, 5432, 6379, 27017, 11211];

const BLOCKED_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_suffixes: Vec<String>,
    blocked_cidrs: Vec<IpNet>,
    blocked_ports: HashSet<u16>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    pub fn new() -> Self {
        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            blocked_suffixes: BLOCKED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            blocked_cidrs: BLOCKED_CIDRS
                .iter()
                .filter_map(|c| c.parse().ok())
                .collect(),
            blocked_ports: BLOCKED_PORTS.iter().copied().collect(),
        }
    }

    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    pub fn block_cidr(mut self, cidr: IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    pub fn block_port(mut self, port: u16) -> Self {
        self.blocked_ports.insert(port);
        self
    }

    /// Parse and check `raw`; returns the parsed URL when it is safe to fetch.
    pub fn validate(&self, raw: &str) -> Result<Url, UrlRejection> {
        let url = Url::parse(raw.trim()).map_err(|e| UrlRejection::Parse(e.to_string()))?;

        if !self.allowed_schemes.contains(url.scheme()) {
            return Err(UrlRejection::Scheme(url.scheme().to_string()));
        }

        match url.host().ok_or(UrlRejection::NoHost)? {
            Host::Domain(domain) => self.check_domain(domain)?,
            Host::Ipv4(v4) => self.check_ip(IpAddr::V4(v4))?,
            Host::Ipv6(v6) => self.check_ip(IpAddr::V6(v6))?,
        }

        if let Some(port) = url.port_or_known_default() {
            if self.blocked_ports.contains(&port) {
                return Err(UrlRejection::BlockedPort(port));
            }
        }

        Ok(url)
    }

    pub fn is_allowed(&self, raw: &str) -> bool {
        self.validate(raw).is_ok()
    }

    fn check_domain(&self, domain: &str) -> Result<(), UrlRejection> {
        let host = domain.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Err(UrlRejection::NoHost);
        }
        if self.blocked_hosts.contains(&host)
            || self.blocked_suffixes.iter().any(|s| host.ends_with(s.as_str()))
        {
            return Err(UrlRejection::BlockedHost(host));
        }
        // Single-label names ("intranet", "router") only resolve on local networks.
        if !host.contains('.') {
            return Err(UrlRejection::BlockedHost(host));
        }
        Ok(())
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), UrlRejection> {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        if self.blocked_cidrs.iter().any(|net| net.contains(&ip)) {
            return Err(UrlRejection::BlockedAddress(ip));
        }
        Ok(())
    }
}

/// Validate with the default rules.
pub fn validate_url(raw: &str) -> Result<Url, UrlRejection> {
    UrlValidator::new().validate(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_and_metadata_targets() {
        for bad in [
            "http://127.0.0.1/x",
            "http://10.0.0.5/",
            "http://169.254.169.254/latest/meta-data/",
            "http://metadata.google.internal/",
            "http://localhost:8080/",
            "http://172.16.4.2/",
            "http://172.31.255.255/",
            "http://192.168.1.1/router",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:10.0.0.1]/",
            "http://0.0.0.0/",
            "http://2130706433/",
            "http://printer.local/",
            "http://wiki.corp/",
            "http://nas.lan/",
            "http://svc.intranet/",
            "http://intranet/",
        ] {
            assert!(validate_url(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn allows_public_urls() {
        for ok in [
            "https://example.com/feed.xml",
            "http://news.ycombinator.com/rss",
            "https://172.32.0.1/",
            "https://blog.example.com:8443/atom",
        ] {
            assert!(validate_url(ok).is_ok(), "{ok} should pass");
        }
    }

    #[test]
    fn rejects_schemes_and_garbage() {
        assert_eq!(
            validate_url("file:///etc/passwd").unwrap_err(),
            UrlRejection::Scheme("file".into())
        );
        assert!(matches!(
            validate_url("ftp://example.com/"),
            Err(UrlRejection::Scheme(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(UrlRejection::Parse(_))
        ));
    }

    #[test]
    fn blocks_admin_ports() {
        assert_eq!(
            validate_url("http://example.com:6379/").unwrap_err(),
            UrlRejection::BlockedPort(6379)
        );
        assert_eq!(
            validate_url("https://db.example.com:5432/").unwrap_err(),
            UrlRejection::BlockedPort(5432)
        );
        assert!(validate_url("http://example.com:22/").is_err());
    }

    #[test]
    fn builder_extends_rules() {
        let v = UrlValidator::new()
            .block_host("evil.example.com")
            .block_port(8080);
        assert!(v.validate("https://evil.example.com/").is_err());
        assert!(v.validate("https://example.com:8080/").is_err());
        assert!(v.is_allowed("https://example.com/"));
    }
}
