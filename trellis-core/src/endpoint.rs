//! Endpoint abstraction for service and peer addressing.
//!
//! Provides unified parsing for the endpoint URLs carried on routes and
//! peer records: `http://`, `https://` and `tcp://` forms.

use std::fmt;
use std::str::FromStr;

/// Parsed endpoint address.
///
/// The scheme selects the data-plane listener flavor downstream (HTTP
/// connection manager vs TCP passthrough); the host/port pair is what the
/// transport layer dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Plain HTTP upstream: `http://host:port`
    Http { host: String, port: u16 },
    /// TLS HTTP upstream: `https://host:port`
    Https { host: String, port: u16 },
    /// Raw TCP upstream: `tcp://host:port`
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `http://books.internal:8080`
    /// - `https://books.internal:8443`
    /// - `tcp://10.0.0.7:5432`
    ///
    /// A missing port defaults to 80 for `http`, 443 for `https`; `tcp`
    /// endpoints must carry an explicit port.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Host portion of the endpoint.
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Http { host, .. } | Self::Https { host, .. } | Self::Tcp { host, .. } => host,
        }
    }

    /// Port portion of the endpoint.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Http { port, .. } | Self::Https { port, .. } | Self::Tcp { port, .. } => *port,
        }
    }

    /// `host:port` form suitable for dialing.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Returns true if this endpoint speaks TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Https { .. })
    }
}

fn split_authority(rest: &str, default_port: Option<u16>) -> Result<(String, u16), EndpointError> {
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(EndpointError::EmptyHost);
    }
    // IPv6 literals: [::1]:8080
    if let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| EndpointError::InvalidAuthority(rest.to_string()))?;
        let host = &stripped[..close];
        let after = &stripped[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(after.to_string()))?,
            None => default_port.ok_or_else(|| EndpointError::MissingPort(rest.to_string()))?,
        };
        return Ok((host.to_string(), port));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(EndpointError::EmptyHost);
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => {
            let port = default_port.ok_or_else(|| EndpointError::MissingPort(rest.to_string()))?;
            Ok((rest.to_string(), port))
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("http://") {
            let (host, port) = split_authority(rest, Some(80))?;
            Ok(Endpoint::Http { host, port })
        } else if let Some(rest) = s.strip_prefix("https://") {
            let (host, port) = split_authority(rest, Some(443))?;
            Ok(Endpoint::Https { host, port })
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = split_authority(rest, None)?;
            Ok(Endpoint::Tcp { host, port })
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http { host, port } => write!(f, "http://{host}:{port}"),
            Endpoint::Https { host, port } => write!(f, "https://{host}:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected http://, https://, or tcp://)")]
    InvalidScheme(String),

    #[error("Invalid authority in endpoint: {0}")]
    InvalidAuthority(String),

    #[error("Invalid port in endpoint: {0}")]
    InvalidPort(String),

    #[error("Endpoint requires an explicit port: {0}")]
    MissingPort(String),

    #[error("Endpoint host is empty")]
    EmptyHost,
}
