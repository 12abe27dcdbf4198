//! Display name parsing.
//!
//! A display name has the form `[protocol/][host]:display[.screen]`:
//!
//! ```text
//! :0              Unix socket /tmp/.X11-unix/X0
//! unix:1.0        Unix socket /tmp/.X11-unix/X1, screen 0
//! example.org:2   TCP port 6002
//! tcp/:3          TCP to localhost, port 6003
//! [::1]:0         TCP over IPv6
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, XwireError};

/// Directory holding the local server sockets.
pub const UNIX_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// TCP port of display 0.
pub const TCP_PORT_BASE: u16 = 6000;

/// A parsed display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName {
    pub protocol: Option<String>,
    pub host: String,
    pub display: u16,
    pub screen: u16,
}

/// Where to connect for a display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl DisplayName {
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || XwireError::InvalidDisplay(name.to_string());

        let (protocol, rest) = match name.split_once('/') {
            // A leading '/' is a socket path, not a protocol.
            Some((protocol, rest)) if !protocol.is_empty() => (Some(protocol.to_string()), rest),
            _ => (None, name),
        };

        let (host, number) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let (display, screen) = match number.split_once('.') {
            Some((display, screen)) => (display, screen),
            None => (number, "0"),
        };
        let display = display.parse().map_err(|_| invalid())?;
        let screen = screen.parse().map_err(|_| invalid())?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        Ok(Self {
            protocol,
            host: host.to_string(),
            display,
            screen,
        })
    }

    /// Parse the `DISPLAY` environment variable.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("DISPLAY")
            .map_err(|_| XwireError::InvalidDisplay("DISPLAY is not set".into()))?;
        Self::parse(&name)
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        let unix = || {
            Endpoint::Unix(PathBuf::from(format!(
                "{}/X{}",
                UNIX_SOCKET_DIR, self.display
            )))
        };

        match self.protocol.as_deref() {
            Some("unix") => Ok(unix()),
            None if self.host.starts_with('/') => Ok(Endpoint::Unix(PathBuf::from(&self.host))),
            None if self.host.is_empty() || self.host == "unix" => Ok(unix()),
            None | Some("tcp") | Some("inet") | Some("inet6") => {
                let port = TCP_PORT_BASE
                    .checked_add(self.display)
                    .ok_or_else(|| XwireError::InvalidDisplay(self.to_string()))?;
                let host = if self.host.is_empty() {
                    "localhost".to_string()
                } else {
                    self.host.clone()
                };
                Ok(Endpoint::Tcp { host, port })
            }
            Some(other) => Err(XwireError::InvalidDisplay(format!(
                "unsupported protocol {}",
                other
            ))),
        }
    }
}

impl FromStr for DisplayName {
    type Err = XwireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(protocol) = &self.protocol {
            write!(f, "{}/", protocol)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, ":{}.{}", self.display, self.screen)
    }
}
