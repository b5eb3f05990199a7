//! The serving loop.
//!
//! One thread per connection. Each connection walks the handshake state
//! machine (greeting, module selection or listing, authentication, option
//! exchange, compatibility flags, checksum seed) and then hands the
//! transport to the engine with the server-side role the client asked for.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use engine::{
    GeneratorConfig, PeerMessages, ReceiverConfig, SenderConfig, SessionStats, SessionStop,
    WireCounters, parse_server_args,
};
use protocol::handshake::{self, CompatFlags, DaemonMessage, PROTOCOL_VERSION, read_line};
use protocol::varint::{write_int, write_u8};
use protocol::{DemuxReader, MessageCode, MuxWriter};
use rand::Rng;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::auth;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::restrict::RestrictedPath;

/// IANA port of the rsync daemon.
pub const DEFAULT_PORT: u16 = 873;

/// Per-read socket timeout for daemon sessions.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

/// A running daemon: configuration plus the accept loop.
pub struct Daemon {
    config: Arc<DaemonConfig>,
}

impl Daemon {
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Binds a listening socket with `SO_REUSEADDR`.
    pub fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    }

    /// Accepts connections forever, one session thread each.
    pub fn serve(&self, listener: &TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept()?;
            let config = Arc::clone(&self.config);
            std::thread::spawn(move || {
                let span = tracing::info_span!("session", %peer);
                let _guard = span.enter();
                match handle_connection(&config, stream) {
                    Ok(()) => tracing::info!("session finished"),
                    Err(err) => tracing::warn!(error = %err, "session failed"),
                }
            });
        }
    }
}

/// Runs one daemon session over an accepted connection.
pub fn handle_connection(config: &DaemonConfig, stream: TcpStream) -> Result<(), DaemonError> {
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_nodelay(true)?;

    let mut reader = stream.try_clone()?;
    let mut writer = stream.try_clone()?;

    writer.write_all(handshake::greeting_line().as_bytes())?;
    writer.flush()?;

    match handshake::parse_daemon_line(&read_line(&mut reader)?)? {
        DaemonMessage::Version { major, .. } if major >= PROTOCOL_VERSION => {}
        DaemonMessage::Version { major, .. } => {
            writer.write_all(
                handshake::error_line(&format!("protocol version {major} is not supported"))
                    .as_bytes(),
            )?;
            return Err(protocol::ProtocolError::UnsupportedVersion(major).into());
        }
        other => {
            return Err(protocol::ProtocolError::UnexpectedDaemonLine(format!("{other:?}")).into());
        }
    }

    let module_line = read_line(&mut reader)?;
    let module_name = module_line.trim();
    if module_name.is_empty() || module_name == "#list" {
        return send_module_list(config, &mut writer);
    }

    let Some(module) = config.module(module_name) else {
        writer.write_all(
            handshake::error_line(&format!("unknown module {module_name:?}")).as_bytes(),
        )?;
        writer.flush()?;
        return Err(DaemonError::UnknownModule(module_name.to_string()));
    };

    if module.requires_auth() {
        let challenge = auth::generate_challenge();
        writer.write_all(handshake::auth_required_line(&challenge).as_bytes())?;
        writer.flush()?;

        let answer = read_line(&mut reader)?;
        let (user, response) = answer.split_once(' ').ok_or_else(|| {
            protocol::ProtocolError::UnexpectedDaemonLine(answer.clone())
        })?;
        if let Err(err) = auth::verify(module, &challenge, user.trim(), response.trim()) {
            writer.write_all(
                handshake::error_line(&format!("auth failed on module {}", module.name))
                    .as_bytes(),
            )?;
            writer.flush()?;
            return Err(err);
        }
        tracing::info!(user, module = %module.name, "authenticated");
    }

    writer.write_all(handshake::ok_line().as_bytes())?;
    writer.flush()?;

    let args = handshake::read_args(&mut reader)?;
    let request = parse_server_args(&args)?;

    let compat = CompatFlags::INC_RECURSE | CompatFlags::SAFE_FLIST;
    write_u8(&mut writer, compat.bits())?;
    let seed: i32 = rand::thread_rng().r#gen();
    write_int(&mut writer, seed)?;
    writer.flush()?;

    // From here the server-to-client direction is multiplexed; handshake
    // errors become tagged messages instead of `@ERROR` lines.
    let stats = SessionStats::new();
    let counters = WireCounters::new();
    let mut demux = DemuxReader::new(
        counters.count_reader(reader),
        Box::new(PeerMessages::new(Arc::clone(&stats))),
    );
    let mut mux = MuxWriter::new(counters.count_writer(writer));
    mux.activate().map_err(protocol::ProtocolError::from)?;

    let restricted = RestrictedPath::new(module.name.clone(), module.path.clone())?;
    let root = match restricted.resolve(&request.path) {
        Ok(root) => root,
        Err(err) => {
            let _ = mux.send_message(
                MessageCode::Error,
                format!("requested path is not available: {err}\n").as_bytes(),
            );
            return Err(err);
        }
    };

    let denied = if request.server_sends {
        (!module.is_readable).then_some("readable")
    } else {
        (!module.is_writable).then_some("writable")
    };
    if let Some(access) = denied {
        let _ = mux.send_message(
            MessageCode::Error,
            format!("module {} is not {access}\n", module.name).as_bytes(),
        );
        return Err(DaemonError::AccessDenied {
            module: module.name.clone(),
            access,
        });
    }

    let stop = {
        let stream = stream.try_clone()?;
        SessionStop::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        })
    };

    let filters = filters::FilterSet::new();
    if request.server_sends {
        let cfg = SenderConfig {
            root: &root,
            opts: &request.opts,
            seed,
            stats: Arc::clone(&stats),
            stop,
            server: true,
            counters,
            filters: &filters,
        };
        engine::run_sender(&cfg, &mut demux, &mut mux)?;
    } else {
        std::fs::create_dir_all(&root)?;
        let gen_cfg = GeneratorConfig {
            dest: &root,
            opts: &request.opts,
            seed,
            stats: Arc::clone(&stats),
            stop: Arc::clone(&stop),
            server: true,
            filters: &filters,
            counters,
        };
        let recv_cfg = ReceiverConfig {
            dest: &root,
            opts: &request.opts,
            seed,
            stats: Arc::clone(&stats),
            stop,
            server: true,
        };
        engine::run_receiver(&gen_cfg, &recv_cfg, &mut demux, &mut mux)?;
    }

    tracing::info!(
        module = %module.name,
        files = stats.get(&stats.num_files),
        transferred = stats.get(&stats.num_transferred),
        errors = stats.get(&stats.errors),
        "transfer complete"
    );
    Ok(())
}

/// Answers an empty module request with the listing and `@RSYNCD: EXIT`.
fn send_module_list(config: &DaemonConfig, writer: &mut TcpStream) -> Result<(), DaemonError> {
    for module in config.modules() {
        writer.write_all(format!("{:<15}\t{}\n", module.name, module.comment).as_bytes())?;
    }
    writer.write_all(handshake::exit_line().as_bytes())?;
    writer.flush()?;
    Ok(())
}
