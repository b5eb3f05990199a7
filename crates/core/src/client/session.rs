//! Client-side daemon sessions.
//!
//! The handshake state machine from the client's seat: greeting exchange,
//! module request, optional authentication, argument vector, compatibility
//! flags, checksum seed, then the transfer roles.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use engine::{
    GeneratorConfig, PeerMessages, ReceiverConfig, SenderConfig, SessionStats, SessionStop,
    WireCounters,
};
use protocol::handshake::{
    self, CompatFlags, DaemonMessage, PROTOCOL_VERSION, read_line,
};
use protocol::varint::{read_int, read_u8};
use protocol::{DemuxReader, MuxWriter};

use crate::client::url::DaemonTarget;
use crate::client::{ClientConfig, SessionSummary};
use crate::error::{ClientError, socket_error};
use crate::password;

/// Which way file content flows in this invocation.
pub(crate) enum Direction<'a> {
    /// The daemon sends; we rebuild locally.
    Download {
        /// Local destination directory.
        dest: &'a Path,
    },
    /// We send; the daemon rebuilds.
    Upload {
        /// Local source path.
        source: &'a Path,
    },
}

/// Connects and walks the handshake up to `@RSYNCD: OK`, returning the
/// established stream. MOTD and listing lines seen on the way are logged.
pub(crate) fn open_session(
    cfg: &ClientConfig,
    target: &DaemonTarget,
    module: &str,
) -> Result<TcpStream, ClientError> {
    let display = format!("{}:{}", target.host, target.port);
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| socket_error("resolve", display.clone(), err))?
        .next()
        .ok_or_else(|| {
            ClientError::Daemon(format!("host {:?} did not resolve", target.host))
        })?;

    let stream = match cfg.timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
        None => TcpStream::connect(addr),
    }
    .map_err(|err| socket_error("connect to", display.clone(), err))?;
    stream
        .set_read_timeout(cfg.timeout)
        .and_then(|()| stream.set_write_timeout(cfg.timeout))
        .and_then(|()| stream.set_nodelay(true))
        .map_err(|err| socket_error("configure", display.clone(), err))?;

    let mut reader = stream
        .try_clone()
        .map_err(|err| socket_error("clone", display.clone(), err))?;
    let mut writer = stream
        .try_clone()
        .map_err(|err| socket_error("clone", display.clone(), err))?;

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
        .map_err(|err| socket_error("write to", display.clone(), err))?;

    writer
        .write_all(format!("{module}\n").as_bytes())
        .and_then(|()| writer.flush())
        .map_err(|err| socket_error("write to", display.clone(), err))?;

    let mut authenticated = false;
    loop {
        match handshake::parse_daemon_line(&read_line(&mut reader)?)? {
            DaemonMessage::Ok => break,
            DaemonMessage::Exit => {
                return Err(ClientError::Daemon(
                    "daemon ended the session before the transfer".to_string(),
                ));
            }
            DaemonMessage::AuthRequired { challenge } => {
                if authenticated {
                    return Err(protocol::ProtocolError::UnexpectedDaemonLine(
                        "repeated authentication challenge".to_string(),
                    )
                    .into());
                }
                authenticated = true;
                answer_challenge(cfg, target, &challenge, &mut writer)?;
            }
            DaemonMessage::Error(text) => return Err(ClientError::Daemon(text)),
            DaemonMessage::Line(text) => {
                tracing::info!(target: "daemon", "{text}");
            }
            DaemonMessage::Version { .. } => {
                return Err(protocol::ProtocolError::UnexpectedDaemonLine(
                    "version line after the greeting".to_string(),
                )
                .into());
            }
        }
    }

    Ok(stream)
}

fn answer_challenge(
    cfg: &ClientConfig,
    target: &DaemonTarget,
    challenge: &str,
    writer: &mut TcpStream,
) -> Result<(), ClientError> {
    let user = target
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("LOGNAME").ok())
        .ok_or_else(|| {
            ClientError::Auth("supply a username (user@host::module)".to_string())
        })?;

    let password = password::load(cfg.password_file.as_deref())?.ok_or_else(|| {
        ClientError::Auth(format!(
            "module requires a password; set {} or use --password-file",
            password::PASSWORD_ENV
        ))
    })?;

    let response = protocol::auth::challenge_response(&password, challenge);
    writer
        .write_all(format!("{user} {response}\n").as_bytes())
        .and_then(|()| writer.flush())
        .map_err(|err| socket_error("write to", target.host.clone(), err))?;
    Ok(())
}

/// Runs a full daemon transfer in the given direction.
pub(crate) fn run_transfer(
    cfg: &ClientConfig,
    target: &DaemonTarget,
    direction: Direction<'_>,
) -> Result<SessionSummary, ClientError> {
    let module = target
        .path
        .split('/')
        .next()
        .filter(|module| !module.is_empty())
        .ok_or_else(|| ClientError::Usage("missing module name".to_string()))?;

    let mut stream = open_session(cfg, target, module)?;
    let display = format!("{}:{}", target.host, target.port);

    let server_sends = matches!(direction, Direction::Download { .. });
    let args = engine::build_server_args(&cfg.opts, server_sends, &target.path);
    handshake::write_args(&mut stream, &args)
        .and_then(|()| stream.flush())
        .map_err(|err| socket_error("write to", display.clone(), err))?;

    let compat = CompatFlags::from_bits(read_u8(&mut stream)?);
    if !compat.contains(CompatFlags::SAFE_FLIST) {
        return Err(protocol::ProtocolError::MissingCompatFlag("CF_SAFE_FLIST").into());
    }
    if cfg.opts.recursive && !compat.contains(CompatFlags::INC_RECURSE) {
        return Err(protocol::ProtocolError::MissingCompatFlag("CF_INC_RECURSE").into());
    }
    let seed = read_int(&mut stream)?;
    tracing::debug!(compat = %compat, seed, "handshake complete");

    let stats = SessionStats::new();
    let counters = WireCounters::new();
    let mut demux = DemuxReader::new(
        counters.count_reader(
            stream
                .try_clone()
                .map_err(|err| socket_error("clone", display.clone(), err))?,
        ),
        Box::new(PeerMessages::new(Arc::clone(&stats))),
    );
    // The server-to-client direction is multiplexed from here on.
    demux.activate();
    let mut mux = MuxWriter::new(
        counters.count_writer(
            stream
                .try_clone()
                .map_err(|err| socket_error("clone", display.clone(), err))?,
        ),
    );

    let stop = {
        let stream = stream
            .try_clone()
            .map_err(|err| socket_error("clone", display, err))?;
        SessionStop::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        })
    };

    let server_stats = match direction {
        Direction::Download { dest } => {
            std::fs::create_dir_all(dest).map_err(|err| engine::EngineError::Filesystem {
                path: dest.to_path_buf(),
                source: err,
            })?;
            let gen_cfg = GeneratorConfig {
                dest,
                opts: &cfg.opts,
                seed,
                stats: Arc::clone(&stats),
                stop: Arc::clone(&stop),
                server: false,
                filters: &cfg.filters,
                counters,
            };
            let recv_cfg = ReceiverConfig {
                dest,
                opts: &cfg.opts,
                seed,
                stats: Arc::clone(&stats),
                stop,
                server: false,
            };
            engine::run_receiver(&gen_cfg, &recv_cfg, &mut demux, &mut mux)?
        }
        Direction::Upload { source } => {
            let sender_cfg = SenderConfig {
                root: source,
                opts: &cfg.opts,
                seed,
                stats: Arc::clone(&stats),
                stop,
                server: false,
                counters,
                filters: &cfg.filters,
            };
            engine::run_sender(&sender_cfg, &mut demux, &mut mux)?
        }
    };

    if let Some(server) = &server_stats {
        tracing::info!(
            server_read = server.bytes_read,
            server_written = server.bytes_written,
            server_size = server.total_size,
            "server statistics"
        );
    }

    Ok(SessionSummary::from_stats(&stats, server_stats))
}
