//! Role execution.
//!
//! The sender role runs synchronously on the calling thread. The receiver
//! role runs the generator and receiver concurrently over one shared
//! connection: the receiver owns the inbound half, the generator the
//! outbound half, and a channel of [`RecvEvent`]s carries list arrivals,
//! redo requests and phase transitions between them. A shared
//! [`SessionStop`](crate::session::SessionStop) token propagates the first
//! failure by shutting the transport down, which unblocks the sibling.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use flist::{FileInfo, SharedFilelist};
use protocol::{DemuxReader, MessageCode, MuxWriter};

use crate::error::EngineError;
use crate::generator::{self, GeneratorConfig};
use crate::receiver::{self, ReceiverConfig};
use crate::sender::{self, SenderConfig, ServerStats};

/// Events flowing from the receiver thread to the generator thread.
#[derive(Debug)]
pub enum RecvEvent {
    /// A file-list segment was added to the shared list.
    Segment {
        /// The sender's announcement index (echoed back as the ack).
        announce: i32,
        /// First global index of the segment.
        start: usize,
        /// One past the last global index.
        end: usize,
        /// The directory the segment expands, `None` for the root.
        parent: Option<Arc<FileInfo>>,
    },
    /// The sender announced the end of the file list.
    FlistEof,
    /// A rebuilt file failed verification and gets its one retry.
    Redo {
        /// Global index of the file.
        ndx: i32,
        /// The entry itself, kept alive past segment retirement.
        file: Arc<FileInfo>,
    },
    /// Control text the receiver wants forwarded to the peer.
    Message {
        /// Message code to forward under.
        code: MessageCode,
        /// Line-oriented payload text.
        text: String,
    },
    /// The receiver consumed a phase-ending index.
    PhaseDone,
    /// The receiver is completely done; the generator may finish up.
    AllDone,
}

/// Runs the sender role on the calling thread.
pub fn run_sender<R: Read, W: Write>(
    cfg: &SenderConfig<'_>,
    input: &mut DemuxReader<R>,
    output: &mut MuxWriter<W>,
) -> Result<Option<ServerStats>, EngineError> {
    let result = sender::run(cfg, input, output);
    if result.is_err() {
        cfg.stop.stop();
    }
    result
}

/// Runs the receiving endpoint: generator and receiver threads sharing
/// one connection.
///
/// Either role's failure trips the stop token, closing the transport and
/// unblocking the other; the receiver's error wins when both fail.
pub fn run_receiver<R, W>(
    gen_cfg: &GeneratorConfig<'_>,
    recv_cfg: &ReceiverConfig<'_>,
    input: &mut DemuxReader<R>,
    output: &mut MuxWriter<W>,
) -> Result<Option<ServerStats>, EngineError>
where
    R: Read + Send,
    W: Write + Send,
{
    let list = SharedFilelist::new();
    let (events_tx, events_rx) = unbounded();

    thread::scope(|scope| {
        let generator_list = list.clone();
        let generator = scope.spawn(move || {
            let result = generator::run(gen_cfg, &generator_list, &events_rx, output);
            if result.is_err() {
                gen_cfg.stop.stop();
            }
            result
        });

        let received = receiver::run(recv_cfg, &list, &events_tx, input);
        if received.is_err() {
            recv_cfg.stop.stop();
        }
        // A generator already gone means the events channel is closed; the
        // receiver surfaces that as Cancelled and the generator's own error
        // is the interesting one.
        drop(events_tx);

        let generated = generator.join().unwrap_or_else(|_| {
            recv_cfg.stop.stop();
            Err(EngineError::Cancelled)
        });

        match (received, generated) {
            (Ok(stats), Ok(())) => Ok(stats),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::session::{SessionOptions, SessionStats, SessionStop};

    /// Drives a full sender/receiver pair over an in-process socket pair,
    /// exercising the executor exactly as the client and daemon do.
    fn transfer(opts: &SessionOptions, src: &Path, dest: &Path) -> (u64, u64, u64) {
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let seed = 0x5EED;
        let sender_stats = SessionStats::new();
        let recv_stats = SessionStats::new();

        let sender_side = {
            let stats = Arc::clone(&sender_stats);
            let opts = *opts;
            let src = src.to_path_buf();
            std::thread::spawn(move || {
                let stream = TcpStream::connect(addr).expect("connect");
                let mut input = DemuxReader::new(
                    stream.try_clone().expect("clone"),
                    Box::new(crate::session::PeerMessages::new(Arc::clone(&stats))),
                );
                let mut output = MuxWriter::new(stream);
                let filters = filters::FilterSet::new();
                let cfg = SenderConfig {
                    root: &src,
                    opts: &opts,
                    seed,
                    stats,
                    stop: SessionStop::detached(),
                    server: true,
                    counters: crate::session::WireCounters::new(),
                    filters: &filters,
                };
                run_sender(&cfg, &mut input, &mut output).expect("sender role");
            })
        };

        let (stream, _) = listener.accept().expect("accept");
        let counters = crate::session::WireCounters::new();
        let mut input = DemuxReader::new(
            counters.count_reader(stream.try_clone().expect("clone")),
            Box::new(crate::session::PeerMessages::new(Arc::clone(&recv_stats))),
        );
        let mut output = MuxWriter::new(counters.count_writer(stream));

        let filters = filters::FilterSet::new();
        let stop = SessionStop::detached();
        let gen_cfg = GeneratorConfig {
            dest,
            opts,
            seed,
            stats: Arc::clone(&recv_stats),
            stop: Arc::clone(&stop),
            server: false,
            filters: &filters,
            counters: counters.clone(),
        };
        let recv_cfg = ReceiverConfig {
            dest,
            opts,
            seed,
            stats: Arc::clone(&recv_stats),
            stop,
            server: false,
        };

        run_receiver(&gen_cfg, &recv_cfg, &mut input, &mut output).expect("receiver role");
        sender_side.join().expect("sender thread");

        (
            recv_stats.get(&recv_stats.num_files),
            recv_stats.get(&recv_stats.num_transferred),
            recv_stats.get(&recv_stats.errors),
        )
    }

    #[test]
    fn empty_directory_transfers_only_the_dot_dir() {
        let src = tempfile::tempdir().expect("tempdir");
        let dest = tempfile::tempdir().expect("tempdir");
        let opts = SessionOptions {
            recursive: true,
            ..SessionOptions::default()
        };

        let (files, transferred, errors) = transfer(&opts, src.path(), dest.path());
        assert_eq!(files, 1);
        assert_eq!(transferred, 0);
        assert_eq!(errors, 0);
    }

    #[test]
    fn tree_with_content_arrives_intact() {
        let src = tempfile::tempdir().expect("tempdir");
        let dest = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("top.txt"), b"top content").expect("write");
        std::fs::create_dir(src.path().join("sub")).expect("mkdir");
        std::fs::write(src.path().join("sub").join("inner.txt"), b"inner").expect("write");

        let opts = SessionOptions {
            recursive: true,
            preserve_times: true,
            ..SessionOptions::default()
        };
        let (files, transferred, errors) = transfer(&opts, src.path(), dest.path());

        assert_eq!(files, 4); // dot dir, top.txt, sub/, sub/inner.txt
        assert_eq!(transferred, 2);
        assert_eq!(errors, 0);
        assert_eq!(
            std::fs::read(dest.path().join("top.txt")).expect("read"),
            b"top content"
        );
        assert_eq!(
            std::fs::read(dest.path().join("sub").join("inner.txt")).expect("read"),
            b"inner"
        );
    }

    #[test]
    fn unchanged_files_are_elided_on_the_second_pass() {
        let src = tempfile::tempdir().expect("tempdir");
        let dest = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("stable"), b"stable bytes").expect("write");

        let opts = SessionOptions {
            recursive: true,
            preserve_times: true,
            ..SessionOptions::default()
        };
        let (_, first_pass, _) = transfer(&opts, src.path(), dest.path());
        assert_eq!(first_pass, 1);

        let (_, second_pass, errors) = transfer(&opts, src.path(), dest.path());
        assert_eq!(second_pass, 0);
        assert_eq!(errors, 0);
    }

    #[test]
    fn deletion_removes_extraneous_destination_entries() {
        let src = tempfile::tempdir().expect("tempdir");
        let dest = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("keep"), b"k").expect("write");
        std::fs::write(dest.path().join("stale"), b"s").expect("write");

        let opts = SessionOptions {
            recursive: true,
            delete: true,
            ..SessionOptions::default()
        };
        transfer(&opts, src.path(), dest.path());

        assert!(dest.path().join("keep").exists());
        assert!(!dest.path().join("stale").exists());
    }
}
