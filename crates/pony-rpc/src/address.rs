//! Messaging endpoint addresses.
//!
//! Two schemes are understood: `tcp://host:port` and `ipc:///path/to.sock`
//! (Unix domain socket, `unix://` is accepted as an alias).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp(String),
    Ipc(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Unsupported address scheme in {0:?} (expected tcp:// or ipc://)")]
    UnsupportedScheme(String),

    #[error("TCP address {0:?} must be host:port")]
    MissingPort(String),

    #[error("Empty socket path in {0:?}")]
    EmptyPath(String),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let Some((host, port)) = rest.rsplit_once(':') else {
                return Err(AddressError::MissingPort(s.to_string()));
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(AddressError::MissingPort(s.to_string()));
            }
            return Ok(Address::Tcp(rest.to_string()));
        }

        let path = s
            .strip_prefix("ipc://")
            .or_else(|| s.strip_prefix("unix://"))
            .ok_or_else(|| AddressError::UnsupportedScheme(s.to_string()))?;

        if path.is_empty() {
            return Err(AddressError::EmptyPath(s.to_string()));
        }
        Ok(Address::Ipc(PathBuf::from(path)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(host_port) => write!(f, "tcp://{host_port}"),
            Address::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
