//! Client endpoint grammar.
//!
//! ```text
//! local-path
//! [user@]host::module[/path]
//! rsync://[user@]host[:port]/module[/path]
//! ```
//!
//! IPv6 hosts are bracketed in both remote forms. An empty module selects
//! the daemon's module listing.

use std::path::PathBuf;

use crate::error::ClientError;

/// One side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A local filesystem path.
    Local(PathBuf),
    /// An rsync daemon.
    Daemon(DaemonTarget),
}

impl Endpoint {
    /// True for the daemon variant.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Daemon(_))
    }
}

/// A parsed daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonTarget {
    /// Username for authentication, when given.
    pub user: Option<String>,
    /// Host name or address (brackets stripped).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Module-qualified path; empty selects the module listing.
    pub path: String,
}

/// Parses one endpoint argument.
pub fn parse_endpoint(text: &str, default_port: u16) -> Result<Endpoint, ClientError> {
    if let Some(rest) = text.strip_prefix("rsync://") {
        return parse_url_form(rest, default_port).map(Endpoint::Daemon);
    }
    if let Some(target) = parse_double_colon_form(text, default_port)? {
        return Ok(Endpoint::Daemon(target));
    }
    Ok(Endpoint::Local(PathBuf::from(text)))
}

/// `[user@]host[:port]/module[/path]` after the `rsync://` scheme.
fn parse_url_form(rest: &str, default_port: u16) -> Result<DaemonTarget, ClientError> {
    let (user, rest) = split_user(rest)?;

    let (host_part, path) = match rest.split_once('/') {
        Some((host, path)) => (host, path.to_string()),
        None => (rest, String::new()),
    };

    let (host, port) = parse_host_port(host_part, default_port)?;
    Ok(DaemonTarget {
        user,
        host,
        port,
        path,
    })
}

/// `[user@]host::module[/path]`, `None` when the text has no `::`.
fn parse_double_colon_form(
    text: &str,
    default_port: u16,
) -> Result<Option<DaemonTarget>, ClientError> {
    // A bracketed IPv6 host may contain colons of its own; search for the
    // separator after the closing bracket.
    let search_from = match text.find(']') {
        Some(pos) => pos,
        None => 0,
    };
    let Some(sep) = text[search_from..].find("::").map(|pos| pos + search_from) else {
        return Ok(None);
    };

    let (user, host_part) = split_user(&text[..sep])?;
    let path = text[sep + 2..].to_string();

    let host = strip_brackets(host_part)?;
    if host.is_empty() {
        return Err(ClientError::Usage(format!("missing host in {text:?}")));
    }
    Ok(Some(DaemonTarget {
        user,
        host,
        port: default_port,
        path,
    }))
}

fn split_user(text: &str) -> Result<(Option<String>, &str), ClientError> {
    match text.split_once('@') {
        Some(("", _)) => Err(ClientError::Usage("empty username".to_string())),
        Some((user, rest)) => Ok((Some(user.to_string()), rest)),
        None => Ok((None, text)),
    }
}

fn parse_host_port(text: &str, default_port: u16) -> Result<(String, u16), ClientError> {
    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ClientError::Usage(format!("unterminated bracket in {text:?}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ClientError::Usage(format!("trailing garbage in {text:?}")));
            }
        };
        return Ok((host.to_string(), port));
    }

    match text.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((text.to_string(), default_port)),
    }
}

fn parse_port(text: &str) -> Result<u16, ClientError> {
    text.parse()
        .map_err(|_| ClientError::Usage(format!("invalid port {text:?}")))
}

fn strip_brackets(text: &str) -> Result<String, ClientError> {
    if let Some(rest) = text.strip_prefix('[') {
        let host = rest
            .strip_suffix(']')
            .ok_or_else(|| ClientError::Usage(format!("unterminated bracket in {text:?}")))?;
        Ok(host.to_string())
    } else {
        Ok(text.to_string())
    }
}
