//! Endpoint addressing for the remote execution host.
//!
//! The host exposes two sibling resources on one scheme/host/port:
//! a WebSocket at [`RUN_PATH`] for the persistent command connection and a
//! plain HTTP resource at [`PWD_PATH`] for the working directory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProtocolError, Result};

/// Conventional path of the persistent command connection.
pub const RUN_PATH: &str = "/run";

/// Conventional path of the working-directory resource.
pub const PWD_PATH: &str = "/pwd";

/// Transport scheme of the host.
///
/// The WebSocket URL follows the HTTP scheme: `http` maps to `ws` and
/// `https` maps to `wss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// Scheme used for plain requests.
    pub fn http(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Scheme used for the WebSocket upgrade.
    pub fn websocket(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

impl FromStr for Scheme {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "ws" => Ok(Scheme::Http),
            "https" | "wss" => Ok(Scheme::Https),
            _ => Err(ProtocolError::UnsupportedScheme(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.http())
    }
}

/// Fully resolved address of a remote execution host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    run_path: String,
    pwd_path: String,
}

impl Endpoint {
    /// Creates an endpoint using the conventional resource paths.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            run_path: RUN_PATH.to_string(),
            pwd_path: PWD_PATH.to_string(),
        }
    }

    /// Overrides the command connection path.
    pub fn with_run_path(mut self, path: impl Into<String>) -> Self {
        self.run_path = path.into();
        self
    }

    /// Overrides the working-directory path.
    pub fn with_pwd_path(mut self, path: impl Into<String>) -> Self {
        self.pwd_path = path.into();
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL of the persistent command connection.
    pub fn run_url(&self) -> Result<Url> {
        self.build(self.scheme.websocket(), &self.run_path)
    }

    /// URL of the working-directory resource.
    pub fn pwd_url(&self) -> Result<Url> {
        self.build(self.scheme.http(), &self.pwd_path)
    }

    fn build(&self, scheme: &str, path: &str) -> Result<Url> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::InvalidEndpoint("host is empty".to_string()));
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let raw = format!("{}://{}:{}{}", scheme, self.host, self.port, path);
        Ok(Url::parse(&raw)?)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_endpoint_urls() {
        let endpoint = Endpoint::new(Scheme::Http, "192.168.1.10", 8000);
        assert_eq!(
            endpoint.run_url().unwrap().as_str(),
            "ws://192.168.1.10:8000/run"
        );
        assert_eq!(
            endpoint.pwd_url().unwrap().as_str(),
            "http://192.168.1.10:8000/pwd"
        );
    }

    #[test]
    fn test_https_endpoint_uses_wss() {
        let endpoint = Endpoint::new(Scheme::Https, "shell.example.com", 8443);
        assert_eq!(
            endpoint.run_url().unwrap().as_str(),
            "wss://shell.example.com:8443/run"
        );
        assert_eq!(
            endpoint.pwd_url().unwrap().as_str(),
            "https://shell.example.com:8443/pwd"
        );
    }

    #[test]
    fn test_custom_paths() {
        let endpoint = Endpoint::new(Scheme::Http, "localhost", 9000)
            .with_run_path("exec")
            .with_pwd_path("/api/cwd");
        assert_eq!(endpoint.run_url().unwrap().path(), "/exec");
        assert_eq!(endpoint.pwd_url().unwrap().path(), "/api/cwd");
    }

    #[test]
    fn test_empty_host_is_rejected() {
        let endpoint = Endpoint::new(Scheme::Http, "  ", 8000);
        assert!(matches!(
            endpoint.run_url(),
            Err(ProtocolError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_scheme_parsing() {
        assert_eq!("http".parse::<Scheme>().unwrap(), Scheme::Http);
        assert_eq!("HTTPS".parse::<Scheme>().unwrap(), Scheme::Https);
        assert_eq!("wss".parse::<Scheme>().unwrap(), Scheme::Https);
        assert!(matches!(
            "ftp".parse::<Scheme>(),
            Err(ProtocolError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_display() {
        let endpoint = Endpoint::new(Scheme::Http, "localhost", 8000);
        assert_eq!(endpoint.to_string(), "http://localhost:8000");
    }
}
