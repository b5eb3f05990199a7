//! Receiver role.
//!
//! Owns the inbound half of the connection on the receiving endpoint. It
//! feeds incoming file-list segments into the shared list, rebuilds file
//! content from literal/match streams against the local basis, verifies
//! every rebuilt file against the sender's whole-file digest, and applies
//! metadata. Failures are queued for the generator's single redo pass.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use checksums::{FileDigest, MD5_SUM_LENGTH};
use crossbeam_channel::Sender as EventSender;
use flist::{EntryDecoder, FileInfo, SharedFilelist};
use protocol::ndx::{NDX_DONE, NDX_FLIST_EOF, NDX_FLIST_OFFSET};
use protocol::varint::read_var_long;
use protocol::{DemuxReader, MessageCode};

use crate::delta::SumHead;
use crate::error::EngineError;
use crate::exec::RecvEvent;
use crate::metadata::apply_metadata;
use crate::sender::ServerStats;
use crate::session::{SessionOptions, SessionStats, SessionStop};
use crate::token::{self, Token};

/// Receiver-side configuration.
pub struct ReceiverConfig<'a> {
    /// Destination root.
    pub dest: &'a Path,
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
}

/// Runs the receiver loop to completion.
///
/// Returns the peer's trailing statistics when running client side.
pub fn run<R: Read>(
    cfg: &ReceiverConfig<'_>,
    list: &SharedFilelist,
    events: &EventSender<RecvEvent>,
    input: &mut DemuxReader<R>,
) -> Result<Option<ServerStats>, EngineError> {
    let mut receiver = Receiver {
        cfg,
        list,
        events,
        ndx_in: protocol::NdxReader::new(),
        dirs: Vec::new(),
        redo_files: Vec::new(),
        failed_once: HashSet::new(),
        phase: 0,
    };
    receiver.run(input)
}

struct Receiver<'a> {
    cfg: &'a ReceiverConfig<'a>,
    list: &'a SharedFilelist,
    events: &'a EventSender<RecvEvent>,
    ndx_in: protocol::NdxReader,
    /// Directory entries seen, for the final metadata pass.
    dirs: Vec<Arc<FileInfo>>,
    /// Files re-requested in phase 2, addressable after their segments
    /// retire.
    redo_files: Vec<(i32, Arc<FileInfo>)>,
    failed_once: HashSet<i32>,
    phase: u8,
}

impl Receiver<'_> {
    fn run<R: Read>(
        &mut self,
        input: &mut DemuxReader<R>,
    ) -> Result<Option<ServerStats>, EngineError> {
        loop {
            if self.cfg.stop.is_stopped() {
                return Err(EngineError::Cancelled);
            }

            let ndx = self.ndx_in.read_ndx(input)?;
            if ndx == NDX_DONE {
                self.phase += 1;
                self.send_event(RecvEvent::PhaseDone)?;
                if self.phase == 2 {
                    break;
                }
            } else if ndx == NDX_FLIST_EOF {
                self.send_event(RecvEvent::FlistEof)?;
            } else if ndx <= NDX_FLIST_OFFSET {
                self.receive_segment(ndx, input)?;
            } else if ndx >= 0 {
                self.receive_file(ndx, input)?;
            } else {
                return Err(EngineError::Sequence("unexpected index from the sender"));
            }
        }

        let stats = if self.cfg.server {
            None
        } else {
            Some(ServerStats {
                bytes_read: read_var_long(input, 3)?,
                bytes_written: read_var_long(input, 3)?,
                total_size: read_var_long(input, 3)?,
            })
        };

        self.finalize_directories();
        self.send_event(RecvEvent::AllDone)?;
        Ok(stats)
    }

    fn send_event(&self, event: RecvEvent) -> Result<(), EngineError> {
        self.events.send(event).map_err(|_| EngineError::Cancelled)
    }

    /// Decodes one announced segment into the shared list.
    fn receive_segment<R: Read>(
        &mut self,
        announce: i32,
        input: &mut DemuxReader<R>,
    ) -> Result<(), EngineError> {
        let dir_index = (NDX_FLIST_OFFSET - announce) as usize;
        let parent = if dir_index == 0 {
            None
        } else {
            Some(self.list.get(dir_index).ok_or(EngineError::Sequence(
                "segment announced for an unknown directory",
            ))?)
        };
        if parent.as_ref().is_some_and(|dir| !dir.attrs().is_dir()) {
            return Err(EngineError::Sequence("segment announced for a non-directory"));
        }

        let mut decoder = EntryDecoder::new(self.cfg.opts.wire());
        let mut files = Vec::new();
        while let Some(file) = decoder.read_entry(input)? {
            files.push(Arc::new(file));
        }

        for file in &files {
            let attrs = file.attrs();
            self.cfg.stats.bump(&self.cfg.stats.num_files);
            if attrs.is_regular() {
                self.cfg.stats.add(&self.cfg.stats.total_size, attrs.size());
            }
            if attrs.is_dir() {
                self.dirs.push(Arc::clone(file));
            }
        }

        let (start, end) = self.list.with_list(|list| {
            list.add_segment(
                if dir_index == 0 { None } else { Some(dir_index) },
                files,
            )
        });

        tracing::debug!(dir_index, start, end, "segment received");
        self.send_event(RecvEvent::Segment {
            announce,
            start,
            end,
            parent,
        })
    }

    /// Consumes one file's delta stream and installs the rebuilt content.
    fn receive_file<R: Read>(
        &mut self,
        ndx: i32,
        input: &mut DemuxReader<R>,
    ) -> Result<(), EngineError> {
        let head = SumHead::read(input)?;
        let file = self.lookup_file(ndx)?;

        let Some(file) = file.filter(|file| file.attrs().is_regular()) else {
            // Index that matches no live regular file: the stream itself is
            // still well-formed, so drain it and count the failure.
            drain_file_stream(input, &head)?;
            self.per_file_error(Path::new("<unknown>"), "data for an invalid index");
            return Ok(());
        };

        let target = self.cfg.dest.join(file.relative_path());
        match self.rebuild_file(&target, &head, input)? {
            RebuildOutcome::Verified(temp) => {
                self.install_file(temp, &target, &file)?;
            }
            RebuildOutcome::DigestMismatch => {
                if self.phase == 0 && self.failed_once.insert(ndx) {
                    tracing::warn!(path = %target.display(), "checksum mismatch, queueing retry");
                    self.redo_files.push((ndx, Arc::clone(&file)));
                    self.send_event(RecvEvent::Redo { ndx, file })?;
                } else {
                    self.per_file_error(&target, "checksum mismatch after retry");
                }
            }
            RebuildOutcome::LocalFailure(err) => {
                self.per_file_error(&target, &err.to_string());
            }
        }
        Ok(())
    }

    fn lookup_file(&self, ndx: i32) -> Result<Option<Arc<FileInfo>>, EngineError> {
        if ndx < 0 {
            return Err(EngineError::Sequence("negative file index"));
        }
        if let Some(file) = self.list.get(ndx as usize) {
            return Ok(Some(file));
        }
        Ok(self
            .redo_files
            .iter()
            .find(|(redo_ndx, _)| *redo_ndx == ndx)
            .map(|(_, file)| Arc::clone(file)))
    }

    /// Rebuilds one file into a sibling temp file, verifying the digest.
    fn rebuild_file<R: Read>(
        &mut self,
        target: &Path,
        head: &SumHead,
        input: &mut DemuxReader<R>,
    ) -> Result<RebuildOutcome, EngineError> {
        let parent = target.parent().unwrap_or(self.cfg.dest);
        let mut basis = File::open(target).ok();

        let mut temp = match tempfile::Builder::new()
            .prefix(".rrsync-")
            .suffix(".tmp")
            .tempfile_in(parent)
        {
            Ok(temp) => temp,
            Err(err) => {
                drain_file_stream(input, head)?;
                // Sender digest still has to leave the stream.
                return Ok(RebuildOutcome::LocalFailure(err));
            }
        };

        let mut digest = FileDigest::new();
        let mut local_error: Option<std::io::Error> = None;

        loop {
            match token::read_token(input)? {
                Token::Literal(bytes) => {
                    digest.update(&bytes);
                    self.cfg
                        .stats
                        .add(&self.cfg.stats.literal_bytes, bytes.len() as u64);
                    if local_error.is_none() {
                        if let Err(err) = temp.write_all(&bytes) {
                            local_error = Some(err);
                        }
                    }
                }
                Token::Match(index) => {
                    let len = head.block_len_at(index);
                    self.cfg.stats.add(&self.cfg.stats.matched_bytes, len as u64);
                    match read_basis_block(basis.as_mut(), head, index) {
                        Ok(block) => {
                            digest.update(&block);
                            if local_error.is_none() {
                                if let Err(err) = temp.write_all(&block) {
                                    local_error = Some(err);
                                }
                            }
                        }
                        Err(err) => {
                            if local_error.is_none() {
                                local_error = Some(err);
                            }
                        }
                    }
                }
                Token::Eof => break,
            }
        }

        let mut wire_digest = [0u8; MD5_SUM_LENGTH];
        input
            .read_exact(&mut wire_digest)
            .map_err(protocol::ProtocolError::from)?;

        if let Some(err) = local_error {
            return Ok(RebuildOutcome::LocalFailure(err));
        }
        if digest.finish(self.cfg.seed) != wire_digest {
            return Ok(RebuildOutcome::DigestMismatch);
        }
        temp.flush()
            .map_err(|err| EngineError::fs(target, err))?;
        Ok(RebuildOutcome::Verified(temp))
    }

    /// Moves verified content into place and applies metadata.
    fn install_file(
        &mut self,
        mut temp: tempfile::NamedTempFile,
        target: &Path,
        file: &Arc<FileInfo>,
    ) -> Result<(), EngineError> {
        let existed = target.symlink_metadata().is_ok();
        let unchanged = self.cfg.opts.defer_write && contents_match(temp.as_file_mut(), target);
        if unchanged {
            tracing::trace!(path = %target.display(), "defer-write: content unchanged");
            drop(temp);
        } else if let Err(err) = temp.persist(target) {
            self.per_file_error(target, &err.error.to_string());
            return Ok(());
        }

        if !self.cfg.opts.preserve_perms && !existed {
            // A fresh file gets creation-style permissions; the temp file
            // it arrived through was deliberately private.
            let mode = 0o666 & !crate::metadata::process_umask();
            if let Err(err) = crate::metadata::set_mode(target, mode) {
                self.per_file_error(target, &err.to_string());
                return Ok(());
            }
        }

        if let Err(err) = apply_metadata(target, file.attrs(), self.cfg.opts) {
            self.per_file_error(target, &err.to_string());
            return Ok(());
        }

        file.set_transferred();
        self.cfg.stats.bump(&self.cfg.stats.num_transferred);
        tracing::debug!(path = %target.display(), "file installed");
        Ok(())
    }

    /// Applies directory metadata deepest-first, after all content writes.
    fn finalize_directories(&mut self) {
        for dir in self.dirs.iter().rev() {
            if dir.is_pruned() {
                continue;
            }
            let target = if dir.is_dot_dir() {
                self.cfg.dest.to_path_buf()
            } else {
                self.cfg.dest.join(dir.relative_path())
            };
            if let Err(err) = apply_metadata(&target, dir.attrs(), self.cfg.opts) {
                tracing::warn!(path = %target.display(), error = %err, "directory metadata");
                self.cfg.stats.bump(&self.cfg.stats.errors);
            }
        }
    }

    fn per_file_error(&self, path: &Path, reason: &str) {
        tracing::warn!(path = %path.display(), reason, "per-file failure");
        self.cfg.stats.bump(&self.cfg.stats.errors);
        let _ = self.send_event(RecvEvent::Message {
            code: MessageCode::ErrorXfer,
            text: format!("{}: {reason}\n", path.display()),
        });
    }
}

enum RebuildOutcome {
    Verified(tempfile::NamedTempFile),
    DigestMismatch,
    LocalFailure(std::io::Error),
}

/// Reads one basis block for a match token.
fn read_basis_block(
    basis: Option<&mut File>,
    head: &SumHead,
    index: u32,
) -> std::io::Result<Vec<u8>> {
    let basis = basis.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "match token without a basis")
    })?;
    let offset = u64::from(index) * head.block_len as u64;
    let len = head.block_len_at(index);

    basis.seek(SeekFrom::Start(offset))?;
    let mut block = vec![0u8; len];
    basis.read_exact(&mut block)?;
    Ok(block)
}

/// Consumes a file's token stream and digest without acting on it.
fn drain_file_stream<R: Read>(
    input: &mut DemuxReader<R>,
    _head: &SumHead,
) -> Result<(), EngineError> {
    loop {
        if matches!(token::read_token(input)?, Token::Eof) {
            break;
        }
    }
    let mut discard = [0u8; MD5_SUM_LENGTH];
    input
        .read_exact(&mut discard)
        .map_err(protocol::ProtocolError::from)?;
    Ok(())
}

/// Byte-for-byte comparison between the rebuilt temp file and the target.
fn contents_match(temp: &mut File, target: &Path) -> bool {
    let Ok(mut existing) = File::open(target) else {
        return false;
    };
    let (Ok(temp_meta), Ok(existing_meta)) = (temp.metadata(), existing.metadata()) else {
        return false;
    };
    if temp_meta.len() != existing_meta.len() {
        return false;
    }
    if temp.seek(SeekFrom::Start(0)).is_err() {
        return false;
    }

    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let read_a = match temp.read(&mut buf_a) {
            Ok(n) => n,
            Err(_) => return false,
        };
        if read_a == 0 {
            return true;
        }
        if existing.read_exact(&mut buf_b[..read_a]).is_err() {
            return false;
        }
        if buf_a[..read_a] != buf_b[..read_a] {
            return false;
        }
    }
}

