//! Server host descriptions and seed-list parsing.
use crate::error::Error::ArgumentError;
use crate::error::Result;

use std::fmt;

pub const DEFAULT_PORT: u16 = 27017;

/// Encapsulates the hostname and port of a server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    pub fn new(host_name: String, port: u16) -> Host {
        Host { host_name, port }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host_name, self.port)
    }
}

/// Parses a `hostname[:port]` string into a Host.
pub fn parse_host(address: &str) -> Result<Host> {
    if address.is_empty() {
        return Err(ArgumentError("Host address must not be empty.".to_owned()));
    }

    let mut parts = address.split(':');
    let host_name = parts.next().unwrap_or("");

    if host_name.is_empty() {
        return Err(ArgumentError(format!("Missing hostname in '{}'.", address)));
    }

    let port = match parts.next() {
        Some(port) => match port.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(ArgumentError(format!("Invalid port in '{}'.", address))),
        },
        None => DEFAULT_PORT,
    };

    if parts.next().is_some() {
        return Err(ArgumentError(format!("Invalid host address '{}'.", address)));
    }

    Ok(Host::new(host_name.to_owned(), port))
}

/// Parses a comma-separated seed list, e.g. `"a:27017,b:27018"`.
pub fn parse_seeds(seeds: &str) -> Result<Vec<Host>> {
    seeds.split(',').map(|s| parse_host(s.trim())).collect()
}
