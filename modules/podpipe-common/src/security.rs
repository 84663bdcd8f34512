//! SSRF protection for episode audio URLs.
//!
//! Rejects loopback, private, link-local, reserved, and cloud-metadata
//! (`169.254.0.0/16`) addresses before the daemon is allowed to download
//! audio from a URL taken from feed-provided metadata.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("disallowed URL scheme: {0}")]
    DisallowedScheme(String),

    #[error("blocked host: {0}")]
    BlockedHost(String),

    #[error("blocked IP range: {0}")]
    BlockedCidr(String),

    #[error("URL has no host")]
    NoHost,

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

/// Validates audio download URLs against SSRF rules.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<ipnet::IpNet>,
    allowed_hosts: HashSet<String>,
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
            blocked_hosts: [
                "localhost",
                "127.0.0.1",
                "::1",
                "[::1]",
                "0.0.0.0",
                "metadata.google.internal",
                "metadata.gke.internal",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_cidrs: vec![
                "10.0.0.0/8".parse().unwrap(),
                "172.16.0.0/12".parse().unwrap(),
                "192.168.0.0/16".parse().unwrap(),
                "169.254.0.0/16".parse().unwrap(), // link-local / cloud metadata
                "127.0.0.0/8".parse().unwrap(),    // loopback
                "0.0.0.0/8".parse().unwrap(),       // "this network" reserved
                "::1/128".parse().unwrap(),         // IPv6 loopback
                "fc00::/7".parse().unwrap(),        // IPv6 unique local (private)
                "fe80::/10".parse().unwrap(),       // IPv6 link-local
            ],
            allowed_hosts: HashSet::new(),
        }
    }

    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into());
        self
    }

    pub fn block_cidr(mut self, cidr: ipnet::IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    /// Validate scheme, host literal, and (if the host is itself an IP
    /// literal) CIDR membership. Does not resolve DNS.
    pub fn validate(&self, url: &str) -> SecurityResult<()> {
        let parsed = url::Url::parse(url)?;

        if !self.allowed_schemes.contains(parsed.scheme()) {
            return Err(SecurityError::DisallowedScheme(parsed.scheme().to_string()));
        }

        let host = parsed.host_str().ok_or(SecurityError::NoHost)?;

        if self.allowed_hosts.contains(host) {
            return Ok(());
        }

        if self.blocked_hosts.contains(host) {
            return Err(SecurityError::BlockedHost(host.to_string()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            self.check_ip(ip)?;
        }

        Ok(())
    }

    /// Validate, then resolve DNS and re-check the resolved IPs. Catches
    /// DNS-rebinding attacks where a hostname resolves to an internal IP.
    pub async fn validate_with_dns(&self, url: &str) -> SecurityResult<()> {
        self.validate(url)?;

        let parsed = url::Url::parse(url)?;
        let host = parsed.host_str().ok_or(SecurityError::NoHost)?;

        if self.allowed_hosts.contains(host) || host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let port = parsed.port().unwrap_or(match parsed.scheme() {
            "https" => 443,
            _ => 80,
        });

        let addrs = tokio::net::lookup_host(format!("{host}:{port}"))
            .await
            .map_err(|e| SecurityError::DnsResolution(e.to_string()))?;

        for addr in addrs {
            self.check_ip(addr.ip()).map_err(|_| {
                SecurityError::BlockedCidr(format!(
                    "DNS for {host} resolved to blocked IP {}",
                    addr.ip()
                ))
            })?;
        }

        Ok(())
    }

    fn check_ip(&self, ip: IpAddr) -> SecurityResult<()> {
        for cidr in &self.blocked_cidrs {
            if cidr.contains(&ip) {
                return Err(SecurityError::BlockedCidr(ip.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_loopback() {
        let v = UrlValidator::new();
        assert!(v.validate("http://127.0.0.1:8080/x.mp3").is_err());
        assert!(v.validate("http://localhost/x.mp3").is_err());
        assert!(v.validate("http://[::1]/x.mp3").is_err());
    }

    #[test]
    fn blocks_private_ranges() {
        let v = UrlValidator::new();
        assert!(v.validate("http://10.0.0.1/x.mp3").is_err());
        assert!(v.validate("http://172.16.0.1/x.mp3").is_err());
        assert!(v.validate("http://192.168.1.1/x.mp3").is_err());
    }

    #[test]
    fn blocks_cloud_metadata() {
        let v = UrlValidator::new();
        assert!(v.validate("http://169.254.169.254/latest/meta").is_err());
    }

    #[test]
    fn blocks_non_http_schemes() {
        let v = UrlValidator::new();
        assert!(v.validate("file:///etc/passwd").is_err());
        assert!(v.validate("ftp://example.com/a.mp3").is_err());
    }

    #[test]
    fn allows_public_audio_urls() {
        let v = UrlValidator::new();
        assert!(v.validate("https://cdn.example.com/episodes/a.mp3").is_ok());
    }

    #[test]
    fn allow_host_bypasses_block_list() {
        let v = UrlValidator::new().allow_host("localhost");
        assert!(v.validate("http://localhost/a.mp3").is_ok());
    }
}
