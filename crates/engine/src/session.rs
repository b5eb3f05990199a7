//! Negotiated session state and statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use flist::WireOptions;
use protocol::{MessageCode, MessageHandler, ProtocolError};

/// Option booleans fixed during the handshake.
///
/// Both peers must hold identical values; the file-list codec and the
/// transfer phases derive their framing from them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// `-r`: expand directories into their own segments.
    pub recursive: bool,
    /// `-d`: list directories without recursing.
    pub dirs: bool,
    /// `-t`: apply source mtimes at the destination.
    pub preserve_times: bool,
    /// `-p`: apply source permission bits.
    pub preserve_perms: bool,
    /// `-o`: apply source owners (root only).
    pub preserve_uid: bool,
    /// `-g`: apply source groups.
    pub preserve_gid: bool,
    /// `-l`: recreate symlinks.
    pub preserve_links: bool,
    /// `--delete`: remove destination entries absent from the source.
    pub delete: bool,
    /// `-I`: transfer even when size and mtime agree.
    pub ignore_times: bool,
    /// `--numeric-ids`: skip principal names on the wire.
    pub numeric_ids: bool,
    /// `--defer-write`: skip the final rename when content is unchanged.
    pub defer_write: bool,
    /// Itemize every entry, changed or not.
    pub always_itemize: bool,
}

impl SessionOptions {
    /// Wire-codec view of the options.
    #[must_use]
    pub const fn wire(&self) -> WireOptions {
        WireOptions {
            preserve_uid: self.preserve_uid,
            preserve_gid: self.preserve_gid,
            preserve_links: self.preserve_links,
            numeric_ids: self.numeric_ids,
        }
    }

    /// True when directories appear in the file list at all.
    #[must_use]
    pub const fn lists_dirs(&self) -> bool {
        self.recursive || self.dirs
    }
}

/// Shared session counters.
///
/// Every field is monotone; roles on both threads update them without
/// further coordination.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Entries in the file list (the dot dir included).
    pub num_files: AtomicU64,
    /// Regular files whose content was transferred and verified.
    pub num_transferred: AtomicU64,
    /// Total size of listed regular files.
    pub total_size: AtomicU64,
    /// Literal bytes that crossed the wire.
    pub literal_bytes: AtomicU64,
    /// Bytes reconstructed from the basis file.
    pub matched_bytes: AtomicU64,
    /// Per-file errors; non-zero yields the partial-transfer exit.
    pub errors: AtomicU64,
}

impl SessionStats {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Cooperative cancellation shared by the roles of one endpoint.
///
/// The first failing thread trips the token and shuts the transport down,
/// which unblocks its sibling out of any pending read or write.
pub struct SessionStop {
    stopped: AtomicBool,
    shutdown: Box<dyn Fn() + Send + Sync>,
}

impl SessionStop {
    /// Builds a token around a transport shutdown hook.
    pub fn new(shutdown: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            shutdown: Box::new(shutdown),
        })
    }

    /// A token with no transport attached (local or test use).
    #[must_use]
    pub fn detached() -> Arc<Self> {
        Self::new(|| {})
    }

    /// Trips the token and closes the transport. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            (self.shutdown)();
        }
    }

    /// True once any role failed or the session was cancelled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStop")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Default handler for control messages arriving from the peer.
///
/// Logging codes are surfaced through `tracing`; transfer errors bump the
/// session error counter; `MSG_ERROR` aborts the session.
pub struct PeerMessages {
    stats: Arc<SessionStats>,
}

impl PeerMessages {
    #[must_use]
    pub fn new(stats: Arc<SessionStats>) -> Self {
        Self { stats }
    }
}

impl MessageHandler for PeerMessages {
    fn handle(&mut self, code: MessageCode, payload: &[u8]) -> Result<(), ProtocolError> {
        if code.is_logging() {
            for line in protocol::multiplex::split_lines(payload) {
                let text = String::from_utf8_lossy(line);
                match code {
                    MessageCode::Error | MessageCode::ErrorSocket | MessageCode::ErrorUtf8 => {
                        tracing::error!(target: "peer", "{text}");
                    }
                    MessageCode::ErrorXfer | MessageCode::Warning => {
                        tracing::warn!(target: "peer", "{text}");
                    }
                    _ => tracing::info!(target: "peer", "{text}"),
                }
            }
        }

        match code {
            MessageCode::ErrorXfer => {
                self.stats.bump(&self.stats.errors);
                Ok(())
            }
            MessageCode::Error | MessageCode::ErrorSocket => Err(ProtocolError::Io(
                std::io::Error::other("peer reported a fatal error"),
            )),
            _ => Ok(()),
        }
    }
}

/// Transport byte counters observed below the multiplex layer.
#[derive(Debug, Clone, Default)]
pub struct WireCounters {
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl WireCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Wraps a reader so its traffic lands in these counters.
    pub fn count_reader<R: std::io::Read>(&self, inner: R) -> CountingReader<R> {
        CountingReader {
            inner,
            count: Arc::clone(&self.read),
        }
    }

    /// Wraps a writer so its traffic lands in these counters.
    pub fn count_writer<W: std::io::Write>(&self, inner: W) -> CountingWriter<W> {
        CountingWriter {
            inner,
            count: Arc::clone(&self.written),
        }
    }
}

/// Reader wrapper feeding [`WireCounters`].
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: std::io::Read> std::io::Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Writer wrapper feeding [`WireCounters`].
pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: std::io::Write> std::io::Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn stop_token_fires_the_shutdown_hook_once() {
        let fired = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&fired);
        let stop = SessionStop::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!stop.is_stopped());
        stop.stop();
        stop.stop();
        assert!(stop.is_stopped());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wire_counters_track_both_directions() {
        let counters = WireCounters::new();
        let mut writer = counters.count_writer(Vec::new());
        writer.write_all(b"12345").expect("vec write");

        let mut reader = counters.count_reader(&b"abc"[..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).expect("read");

        assert_eq!(counters.bytes_written(), 5);
        assert_eq!(counters.bytes_read(), 3);
    }

    #[test]
    fn transfer_errors_from_the_peer_accumulate() {
        let stats = SessionStats::new();
        let mut handler = PeerMessages::new(Arc::clone(&stats));
        handler
            .handle(MessageCode::ErrorXfer, b"read failed\n")
            .expect("non-fatal");
        handler
            .handle(MessageCode::ErrorXfer, b"another\n")
            .expect("non-fatal");
        assert_eq!(stats.get(&stats.errors), 2);

        assert!(handler.handle(MessageCode::Error, b"fatal\n").is_err());
    }
}
