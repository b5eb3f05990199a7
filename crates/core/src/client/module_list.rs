//! Daemon module listings.
//!
//! An empty module request makes the daemon print its exported modules and
//! end the session with `@RSYNCD: EXIT`.

use std::io::Write;

use protocol::handshake::{self, DaemonMessage, PROTOCOL_VERSION, read_line};

use crate::client::url::DaemonTarget;
use crate::client::{ClientConfig, SessionSummary};
use crate::error::{ClientError, socket_error};

/// Fetches the module listing.
pub(crate) fn run(
    cfg: &ClientConfig,
    target: &DaemonTarget,
) -> Result<SessionSummary, ClientError> {
    // The listing handshake diverges right after the greeting (no OK line
    // ever comes), so it does not share `open_session`.
    let display = format!("{}:{}", target.host, target.port);
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&(target.host.as_str(), target.port))
        .map_err(|err| socket_error("resolve", display.clone(), err))?
        .next()
        .ok_or_else(|| ClientError::Daemon(format!("host {:?} did not resolve", target.host)))?;

    let stream = match cfg.timeout {
        Some(timeout) => std::net::TcpStream::connect_timeout(&addr, timeout),
        None => std::net::TcpStream::connect(addr),
    }
    .map_err(|err| socket_error("connect to", display.clone(), err))?;
    stream
        .set_read_timeout(cfg.timeout)
        .map_err(|err| socket_error("configure", display.clone(), err))?;

    let mut reader = stream
        .try_clone()
        .map_err(|err| socket_error("clone", display.clone(), err))?;
    let mut writer = stream;

    match handshake::parse_daemon_line(&read_line(&mut reader)?)? {
        DaemonMessage::Version { major, .. } if major >= PROTOCOL_VERSION => {}
        DaemonMessage::Version { major, .. } => {
            return Err(protocol::ProtocolError::UnsupportedVersion(major).into());
        }
        DaemonMessage::Error(text) => return Err(ClientError::Daemon(text)),
        other => {
            return Err(
                protocol::ProtocolError::UnexpectedDaemonLine(format!("{other:?}")).into(),
            );
        }
    }
    writer
        .write_all(handshake::greeting_line().as_bytes())
        .and_then(|()| writer.write_all(b"\n"))
        .and_then(|()| writer.flush())
        .map_err(|err| socket_error("write to", display.clone(), err))?;

    let mut summary = SessionSummary::default();
    loop {
        match handshake::parse_daemon_line(&read_line(&mut reader)?)? {
            DaemonMessage::Exit => break,
            DaemonMessage::Error(text) => return Err(ClientError::Daemon(text)),
            DaemonMessage::Line(text) => {
                let decoded = cfg
                    .charset
                    .decode(text.as_bytes())
                    .unwrap_or_else(|_| text.clone());
                summary.module_list.push(decoded);
            }
            DaemonMessage::Ok | DaemonMessage::AuthRequired { .. } => {
                return Err(protocol::ProtocolError::UnexpectedDaemonLine(
                    "unexpected control line in a module listing".to_string(),
                )
                .into());
            }
            DaemonMessage::Version { .. } => {
                return Err(protocol::ProtocolError::UnexpectedDaemonLine(
                    "version line after the greeting".to_string(),
                )
                .into());
            }
        }
    }

    Ok(summary)
}
