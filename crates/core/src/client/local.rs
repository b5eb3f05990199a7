//! Local-to-local copies.
//!
//! Both endpoints on this machine still run the full three-role engine:
//! the two halves talk over a loopback socket pair, so the delta
//! algorithm, verification and metadata paths are identical to a remote
//! session.

use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

use engine::{
    GeneratorConfig, PeerMessages, ReceiverConfig, SenderConfig, SessionStats, SessionStop,
    WireCounters,
};
use protocol::{DemuxReader, MuxWriter};

use crate::client::{ClientConfig, SessionSummary};
use crate::error::{ClientError, socket_error};

pub(crate) fn run_local_copy(
    cfg: &ClientConfig,
    source: &Path,
    dest: &Path,
) -> Result<SessionSummary, ClientError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|err| socket_error("bind", "loopback", err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| socket_error("inspect", "loopback", err))?;

    let seed = std::process::id() as i32;
    let stats = SessionStats::new();
    let sender_stats = SessionStats::new();

    std::thread::scope(|scope| {
        let sender = scope.spawn(|| -> Result<(), ClientError> {
            let (stream, _) = listener
                .accept()
                .map_err(|err| socket_error("accept on", "loopback", err))?;
            let counters = WireCounters::new();
            let mut demux = DemuxReader::new(
                counters.count_reader(
                    stream
                        .try_clone()
                        .map_err(|err| socket_error("clone", "loopback", err))?,
                ),
                Box::new(PeerMessages::new(Arc::clone(&sender_stats))),
            );
            let stop = {
                let stream = stream
                    .try_clone()
                    .map_err(|err| socket_error("clone", "loopback", err))?;
                SessionStop::new(move || {
                    let _ = stream.shutdown(Shutdown::Both);
                })
            };
            let mut mux = MuxWriter::new(counters.count_writer(stream));
            let sender_cfg = SenderConfig {
                root: source,
                opts: &cfg.opts,
                seed,
                stats: Arc::clone(&sender_stats),
                stop,
                server: true,
                counters,
                filters: &cfg.filters,
            };
            engine::run_sender(&sender_cfg, &mut demux, &mut mux)?;
            Ok(())
        });

        let stream =
            TcpStream::connect(addr).map_err(|err| socket_error("connect to", "loopback", err))?;
        let counters = WireCounters::new();
        let mut demux = DemuxReader::new(
            counters.count_reader(
                stream
                    .try_clone()
                    .map_err(|err| socket_error("clone", "loopback", err))?,
            ),
            Box::new(PeerMessages::new(Arc::clone(&stats))),
        );
        let stop = {
            let stream = stream
                .try_clone()
                .map_err(|err| socket_error("clone", "loopback", err))?;
            SessionStop::new(move || {
                let _ = stream.shutdown(Shutdown::Both);
            })
        };
        let mut mux = MuxWriter::new(counters.count_writer(stream));

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
        let server_stats = engine::run_receiver(&gen_cfg, &recv_cfg, &mut demux, &mut mux)?;

        match sender.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(ClientError::Engine(engine::EngineError::Cancelled));
            }
        }

        let mut summary = SessionSummary::from_stats(&stats, server_stats);
        summary.errors += sender_stats.get(&sender_stats.errors);
        Ok(summary)
    })
}
