//! Sender role.
//!
//! Walks the source tree, emits file-list segments and answers the
//! generator's per-file requests with delta streams. Segment emission is
//! paced by the generator: each consumed segment is acknowledged by echoing
//! its announcement index, and only then does the next directory's listing
//! go out, so neither direction can run unboundedly ahead of the other.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use checksums::MD5_SUM_LENGTH;
use filters::FilterSet;
use flist::{EntryEncoder, FileInfo, Filelist};
use protocol::ndx::{NDX_DONE, NDX_FLIST_EOF, NDX_FLIST_OFFSET};
use protocol::varint::{read_var_long, write_var_long};
use protocol::{DemuxReader, MessageCode, MuxWriter};

use crate::delta::{SumLookup, generate_delta};
use crate::error::EngineError;
use crate::metadata::IdCache;
use crate::rules::read_filter_rules;
use crate::session::{SessionOptions, SessionStats, SessionStop, WireCounters};
use crate::walk;

/// Statistics the server reports at end of session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Bytes the server read from the transport.
    pub bytes_read: i64,
    /// Bytes the server wrote to the transport.
    pub bytes_written: i64,
    /// Total size of the server's listed files.
    pub total_size: i64,
}

/// Sender-side configuration.
pub struct SenderConfig<'a> {
    /// Transfer source: a directory whose contents travel, or one file.
    pub root: &'a Path,
    /// Negotiated session options.
    pub opts: &'a SessionOptions,
    /// Checksum seed.
    pub seed: i32,
    /// Shared counters.
    pub stats: Arc<SessionStats>,
    /// Cancellation token.
    pub stop: Arc<SessionStop>,
    /// True on the daemon side of the connection.
    pub server: bool,
    /// Transport counters, reported in the trailing statistics.
    pub counters: WireCounters,
    /// This side's own rules; the peer's arrive over the wire and apply
    /// after them.
    pub filters: &'a FilterSet,
}

/// Runs the sender loop to completion.
///
/// Returns the peer's trailing statistics when running client side.
pub fn run<R: Read, W: Write>(
    cfg: &SenderConfig<'_>,
    input: &mut DemuxReader<R>,
    output: &mut MuxWriter<W>,
) -> Result<Option<ServerStats>, EngineError> {
    let mut sender = Sender {
        cfg,
        list: Filelist::new(),
        pending_dirs: VecDeque::new(),
        ndx_in: protocol::NdxReader::new(),
        ndx_out: protocol::NdxWriter::new(),
        ids: IdCache::new(),
        filters: FilterSet::new(),
        eof_sent: false,
    };
    sender.run(input, output)
}

struct Sender<'a> {
    cfg: &'a SenderConfig<'a>,
    list: Filelist,
    pending_dirs: VecDeque<usize>,
    ndx_in: protocol::NdxReader,
    ndx_out: protocol::NdxWriter,
    ids: IdCache,
    filters: FilterSet,
    eof_sent: bool,
}

impl Sender<'_> {
    fn run<R: Read, W: Write>(
        &mut self,
        input: &mut DemuxReader<R>,
        output: &mut MuxWriter<W>,
    ) -> Result<Option<ServerStats>, EngineError> {
        self.filters = self.cfg.filters.clone();
        self.filters.extend_from(&read_filter_rules(input)?);
        self.emit_root_segment(output)?;

        let mut phase = 0u8;
        loop {
            output.flush().map_err(protocol::ProtocolError::from)?;
            if self.cfg.stop.is_stopped() {
                return Err(EngineError::Cancelled);
            }

            let ndx = self.ndx_in.read_ndx(input)?;
            if ndx == NDX_DONE {
                self.ndx_out.write_ndx(output, NDX_DONE)?;
                output.flush().map_err(protocol::ProtocolError::from)?;
                phase += 1;
                if phase == 2 {
                    break;
                }
            } else if ndx <= NDX_FLIST_OFFSET {
                self.handle_segment_ack(ndx, output)?;
            } else if ndx >= 0 {
                self.serve_file(ndx as usize, input, output)?;
            } else {
                return Err(EngineError::Sequence("unexpected index from the generator"));
            }
        }

        if self.cfg.server {
            let stats = &self.cfg.stats;
            write_var_long(output, self.cfg.counters.bytes_read() as i64, 3)
                .map_err(protocol::ProtocolError::from)?;
            write_var_long(output, self.cfg.counters.bytes_written() as i64, 3)
                .map_err(protocol::ProtocolError::from)?;
            write_var_long(output, stats.get(&stats.total_size) as i64, 3)
                .map_err(protocol::ProtocolError::from)?;
            output.flush().map_err(protocol::ProtocolError::from)?;
            Ok(None)
        } else {
            Ok(Some(ServerStats {
                bytes_read: read_var_long(input, 3)?,
                bytes_written: read_var_long(input, 3)?,
                total_size: read_var_long(input, 3)?,
            }))
        }
    }

    /// Emits the root segment: the dot dir plus the root's children, or a
    /// single entry when the source is one file.
    fn emit_root_segment<W: Write>(&mut self, output: &mut MuxWriter<W>) -> Result<(), EngineError> {
        let meta = std::fs::symlink_metadata(self.cfg.root)
            .map_err(|err| EngineError::fs(self.cfg.root, err))?;

        let mut files = Vec::new();
        if meta.is_dir() {
            files.push(walk::root_entry(self.cfg.root, &mut self.ids)?);
            let listing = walk::list_children(
                self.cfg.root,
                b".",
                self.cfg.opts,
                &self.filters,
                &mut self.ids,
            )?;
            self.report_walk_errors(listing.errors, output)?;
            files.extend(listing.files);
        } else {
            files.push(self.single_file_entry()?);
        }

        self.emit_segment(0, files, output)
    }

    fn single_file_entry(&mut self) -> Result<Arc<FileInfo>, EngineError> {
        let root = self.cfg.root;
        let name = root
            .file_name()
            .map(os_bytes)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                EngineError::fs(
                    root,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unnamed source"),
                )
            })?;

        let parent = root
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let listing = walk::list_children(
            parent,
            b".",
            self.cfg.opts,
            &self.filters,
            &mut self.ids,
        )?;
        listing
            .files
            .into_iter()
            .find(|file| file.name() == name.as_slice())
            .ok_or_else(|| {
                EngineError::fs(
                    root,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "source vanished"),
                )
            })
    }

    /// Writes one segment: announcement, entries, terminator. Newly listed
    /// directories join the expansion queue.
    fn emit_segment<W: Write>(
        &mut self,
        dir_index: usize,
        files: Vec<Arc<FileInfo>>,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        let (start, end) = self.list.add_segment(
            if dir_index == 0 { None } else { Some(dir_index) },
            files,
        );

        self.ndx_out
            .write_ndx(output, NDX_FLIST_OFFSET - dir_index as i32)?;

        let mut encoder = EntryEncoder::new(self.cfg.opts.wire());
        for index in start..end {
            let file = self
                .list
                .get(index)
                .ok_or(EngineError::Sequence("segment entry vanished"))?;
            encoder.write_entry(output, file)?;

            let attrs = file.attrs();
            self.cfg.stats.bump(&self.cfg.stats.num_files);
            if attrs.is_regular() {
                self.cfg
                    .stats
                    .add(&self.cfg.stats.total_size, attrs.size());
            }
            if attrs.is_dir() && !file.is_dot_dir() && self.cfg.opts.recursive {
                self.pending_dirs.push_back(index);
            }
        }
        encoder.write_segment_end(output)?;
        output.flush().map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    /// On a segment acknowledgement, expands the next queued directory or
    /// declares the list complete.
    fn handle_segment_ack<W: Write>(
        &mut self,
        ack: i32,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        let dir_index = (NDX_FLIST_OFFSET - ack) as usize;
        tracing::trace!(dir_index, "segment acknowledged");

        match self.pending_dirs.pop_front() {
            Some(next) => {
                let dir = self
                    .list
                    .get(next)
                    .cloned()
                    .ok_or(EngineError::Sequence("queued directory vanished"))?;
                let path = dir
                    .path()
                    .ok_or(EngineError::Sequence("local entry without a path"))?
                    .to_path_buf();

                let listing = walk::list_children(
                    &path,
                    dir.name(),
                    self.cfg.opts,
                    &self.filters,
                    &mut self.ids,
                )?;
                self.report_walk_errors(listing.errors, output)?;
                self.emit_segment(next, listing.files, output)
            }
            None => {
                if !self.eof_sent {
                    self.eof_sent = true;
                    self.ndx_out.write_ndx(output, NDX_FLIST_EOF)?;
                    output.flush().map_err(protocol::ProtocolError::from)?;
                }
                Ok(())
            }
        }
    }

    /// Answers one file request: index echo, sum-head echo, token stream,
    /// whole-file digest.
    fn serve_file<R: Read, W: Write>(
        &mut self,
        ndx: usize,
        input: &mut DemuxReader<R>,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        let lookup = SumLookup::read(input)?;
        let file = self
            .list
            .get(ndx)
            .cloned()
            .ok_or(EngineError::Sequence("request for an unknown index"))?;
        if !file.attrs().is_regular() {
            return Err(EngineError::Sequence("request for a non-regular file"));
        }
        let path = file
            .path()
            .ok_or(EngineError::Sequence("local entry without a path"))?
            .to_path_buf();

        self.ndx_out.write_ndx(output, ndx as i32)?;
        lookup.head().write(output)?;

        match File::open(&path) {
            Ok(source) => {
                let mut source = BufReader::new(source);
                let (digest, counters) =
                    generate_delta(&mut source, &lookup, self.cfg.seed, output)?;
                output
                    .write_all(&digest)
                    .map_err(protocol::ProtocolError::from)?;

                self.cfg
                    .stats
                    .add(&self.cfg.stats.literal_bytes, counters.literal);
                self.cfg
                    .stats
                    .add(&self.cfg.stats.matched_bytes, counters.matched);
                self.cfg.stats.bump(&self.cfg.stats.num_transferred);
                file.set_transferred();
            }
            Err(err) => {
                // The stream must stay in sync, so the request is answered
                // with an empty body and a digest that cannot verify.
                tracing::warn!(path = %path.display(), error = %err, "cannot read source");
                self.per_file_error(&path, &err, output)?;

                crate::token::write_eof(output)?;
                let poisoned = [0xAAu8; MD5_SUM_LENGTH];
                output
                    .write_all(&poisoned)
                    .map_err(protocol::ProtocolError::from)?;
            }
        }

        output.flush().map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    fn report_walk_errors<W: Write>(
        &self,
        errors: u64,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        if errors == 0 {
            return Ok(());
        }
        self.cfg.stats.add(&self.cfg.stats.errors, errors);
        if output.is_multiplexed() {
            output.send_message(
                MessageCode::IoError,
                format!("{errors} files could not be listed\n").as_bytes(),
            )?;
        }
        Ok(())
    }

    fn per_file_error<W: Write>(
        &self,
        path: &Path,
        err: &std::io::Error,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        self.cfg.stats.bump(&self.cfg.stats.errors);
        if output.is_multiplexed() {
            output.send_message(
                MessageCode::ErrorXfer,
                format!("{}: {err}\n", path.display()).as_bytes(),
            )?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn os_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}
