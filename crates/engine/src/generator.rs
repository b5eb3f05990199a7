//! Generator role.
//!
//! Runs on the receiving endpoint, alongside the receiver thread. Walks
//! the incoming file list as segments arrive, mirrors directories and
//! symlinks locally, elides unchanged files, and emits block-checksum
//! tables for everything the sender must transfer. Consumed segments are
//! acknowledged back to the sender, which paces further list emission.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver as EventReceiver;
use filters::FilterSet;
use flist::{FileInfo, SharedFilelist};
use protocol::ndx::{NDX_DONE, NDX_FLIST_OFFSET};
use protocol::varint::write_var_long;
use protocol::{MessageCode, MuxWriter};

use crate::delta::{SumHead, SumTable};
use crate::error::EngineError;
use crate::exec::RecvEvent;
use crate::rules::write_filter_rules;
use crate::session::{SessionOptions, SessionStats, SessionStop, WireCounters};

/// Generator-side configuration.
pub struct GeneratorConfig<'a> {
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
    /// Rules forwarded to the sender before the list starts.
    pub filters: &'a FilterSet,
    /// Transport counters, reported in the trailing statistics.
    pub counters: WireCounters,
}

/// Runs the generator loop to completion.
pub fn run<W: Write>(
    cfg: &GeneratorConfig<'_>,
    list: &SharedFilelist,
    events: &EventReceiver<RecvEvent>,
    output: &mut MuxWriter<W>,
) -> Result<(), EngineError> {
    let mut generator = Generator {
        cfg,
        list,
        ndx_out: protocol::NdxWriter::new(),
        redos: Vec::new(),
        phase_ends_seen: 0,
    };
    generator.run(events, output)
}

struct Generator<'a> {
    cfg: &'a GeneratorConfig<'a>,
    list: &'a SharedFilelist,
    ndx_out: protocol::NdxWriter,
    redos: Vec<(i32, Arc<FileInfo>)>,
    phase_ends_seen: u8,
}

impl Generator<'_> {
    fn run<W: Write>(
        &mut self,
        events: &EventReceiver<RecvEvent>,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        write_filter_rules(output, self.cfg.filters)?;
        output.flush().map_err(protocol::ProtocolError::from)?;

        loop {
            if self.cfg.stop.is_stopped() {
                return Err(EngineError::Cancelled);
            }
            let Ok(event) = events.recv() else {
                // The receiver hung up without AllDone: it failed.
                return Err(EngineError::Cancelled);
            };

            match event {
                RecvEvent::Segment {
                    announce,
                    start,
                    end,
                    parent,
                } => self.process_segment(announce, start, end, parent, output)?,
                RecvEvent::FlistEof => {
                    self.ndx_out.write_ndx(output, NDX_DONE)?;
                    output.flush().map_err(protocol::ProtocolError::from)?;
                }
                RecvEvent::Redo { ndx, file } => self.redos.push((ndx, file)),
                RecvEvent::Message { code, text } => {
                    if output.is_multiplexed() {
                        output.send_message(code, text.as_bytes())?;
                    }
                }
                RecvEvent::PhaseDone => {
                    self.phase_ends_seen += 1;
                    if self.phase_ends_seen == 1 {
                        self.run_redo_phase(output)?;
                    }
                }
                RecvEvent::AllDone => break,
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
        }
        Ok(())
    }

    /// Phase 1 is over: retire the processed segments and request every
    /// failed file once more, as pure literals.
    fn run_redo_phase<W: Write>(&mut self, output: &mut MuxWriter<W>) -> Result<(), EngineError> {
        self.list.with_list(|list| {
            while list.pop_first_segment().is_some() {}
        });

        for (ndx, file) in std::mem::take(&mut self.redos) {
            tracing::info!(name = %String::from_utf8_lossy(file.name()), "retrying file");
            self.ndx_out.write_ndx(output, ndx)?;
            SumTable {
                head: SumHead::empty(),
                blocks: Vec::new(),
            }
            .write(output)?;
        }

        self.ndx_out.write_ndx(output, NDX_DONE)?;
        output.flush().map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    fn process_segment<W: Write>(
        &mut self,
        announce: i32,
        start: usize,
        end: usize,
        parent: Option<Arc<FileInfo>>,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        let dir_index = (NDX_FLIST_OFFSET - announce) as usize;
        tracing::trace!(dir_index, start, end, "processing segment");
        let entries: Vec<(usize, Arc<FileInfo>)> = self.list.with_list(|list| {
            (start..end)
                .filter_map(|index| list.get(index).cloned().map(|file| (index, file)))
                .collect()
        });

        if parent.as_ref().is_some_and(|dir| dir.is_pruned()) {
            for (_, file) in &entries {
                if file.attrs().is_dir() {
                    file.set_pruned();
                }
            }
            self.ack_segment(announce, output)?;
            return Ok(());
        }

        let mut transfers = 0usize;
        for (index, file) in &entries {
            self.process_entry(*index, file, output, &mut transfers)?;
        }

        if self.cfg.opts.delete {
            self.delete_extraneous(parent.as_ref(), &entries, output);
        }

        self.ack_segment(announce, output)?;

        if transfers == 0 {
            // Nothing outstanding: the segment can retire immediately if
            // it is the oldest one alive.
            self.list.with_list(|list| {
                if list
                    .first_segment()
                    .is_some_and(|segment| segment.start() == start)
                {
                    list.pop_first_segment();
                }
            });
        }
        Ok(())
    }

    fn ack_segment<W: Write>(
        &mut self,
        announce: i32,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        self.ndx_out.write_ndx(output, announce)?;
        output.flush().map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    fn process_entry<W: Write>(
        &mut self,
        index: usize,
        file: &Arc<FileInfo>,
        output: &mut MuxWriter<W>,
        transfers: &mut usize,
    ) -> Result<(), EngineError> {
        let attrs = file.attrs();
        if self.cfg.opts.always_itemize {
            tracing::info!(
                target: "itemize",
                mode = attrs.mode(),
                size = attrs.size(),
                "{}",
                String::from_utf8_lossy(file.name()),
            );
        }

        if file.is_dot_dir() {
            fs::create_dir_all(self.cfg.dest)
                .map_err(|err| EngineError::fs(self.cfg.dest, err))?;
            return Ok(());
        }

        let target = self.target_path(file);
        if attrs.is_dir() {
            if let Err(err) = ensure_directory(&target) {
                file.set_pruned();
                self.per_file_error(&target, &err, output);
            }
            return Ok(());
        }

        if attrs.is_symlink() {
            if self.cfg.opts.preserve_links {
                if let Err(err) = recreate_symlink(&target, file) {
                    self.per_file_error(&target, &err, output);
                }
            }
            return Ok(());
        }

        if attrs.is_other() {
            tracing::debug!(name = %String::from_utf8_lossy(file.name()), "skipping special file");
            return Ok(());
        }

        // Regular file: elide when size and mtime already agree.
        let local = fs::metadata(&target).ok();
        if !self.cfg.opts.ignore_times {
            if let Some(local) = &local {
                if local.is_file() && local.len() == attrs.size() && mtime_matches(local, attrs) {
                    tracing::trace!(name = %String::from_utf8_lossy(file.name()), "unchanged");
                    if output.is_multiplexed() {
                        output.send_message(
                            MessageCode::Success,
                            &(index as i32).to_le_bytes(),
                        )?;
                    }
                    return Ok(());
                }
            }
        }

        *transfers += 1;
        self.ndx_out.write_ndx(output, index as i32)?;
        self.write_sum_table(&target, local.map(|meta| meta.len()), output)
    }

    /// Emits the block-checksum table for one basis file; missing or
    /// unreadable bases degrade to the empty table.
    fn write_sum_table<W: Write>(
        &mut self,
        basis: &Path,
        len: Option<u64>,
        output: &mut MuxWriter<W>,
    ) -> Result<(), EngineError> {
        let table = len
            .and_then(|len| {
                let file = File::open(basis).ok()?;
                SumTable::compute(&mut BufReader::new(file), len, self.cfg.seed).ok()
            })
            .unwrap_or_else(|| SumTable {
                head: SumHead::empty(),
                blocks: Vec::new(),
            });
        table.write(output)?;
        output.flush().map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    /// Removes destination entries that no longer exist on the sending
    /// side. Runs per segment, after the segment's entries are known.
    fn delete_extraneous<W: Write>(
        &mut self,
        parent: Option<&Arc<FileInfo>>,
        entries: &[(usize, Arc<FileInfo>)],
        output: &mut MuxWriter<W>,
    ) {
        let (dir_path, prefix_len) = match parent {
            Some(dir) => (
                self.cfg.dest.join(dir.relative_path()),
                dir.name().len(),
            ),
            None => {
                // A single-file transfer has no dot dir and owns nothing
                // else in the destination.
                if !entries.iter().any(|(_, file)| file.is_dot_dir()) {
                    return;
                }
                (self.cfg.dest.to_path_buf(), 0)
            }
        };

        let keep: HashSet<Vec<u8>> = entries
            .iter()
            .filter(|(_, file)| !file.is_dot_dir())
            .filter_map(|(_, file)| file.trimmed_name().get(prefix_len..).map(<[u8]>::to_vec))
            .collect();

        let listing = match fs::read_dir(&dir_path) {
            Ok(listing) => listing,
            Err(_) => return,
        };
        for entry in listing.flatten() {
            let name = os_bytes(&entry.file_name());
            if keep.contains(&name) {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "deleted");
                    if output.is_multiplexed() {
                        let mut payload = name;
                        payload.push(b'\n');
                        let _ = output.send_message(MessageCode::Deleted, &payload);
                    }
                }
                Err(err) => self.per_file_error(&path, &err, output),
            }
        }
    }

    fn target_path(&self, file: &FileInfo) -> PathBuf {
        self.cfg.dest.join(file.relative_path())
    }

    fn per_file_error<W: Write>(
        &self,
        path: &Path,
        err: &std::io::Error,
        output: &mut MuxWriter<W>,
    ) {
        tracing::warn!(path = %path.display(), error = %err, "per-file failure");
        self.cfg.stats.bump(&self.cfg.stats.errors);
        if output.is_multiplexed() {
            let _ = output.send_message(
                MessageCode::ErrorXfer,
                format!("{}: {err}\n", path.display()).as_bytes(),
            );
        }
    }
}

fn ensure_directory(target: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(target)?;
            fs::create_dir(target)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => fs::create_dir(target),
        Err(err) => Err(err),
    }
}

fn recreate_symlink(target: &Path, file: &FileInfo) -> std::io::Result<()> {
    let wanted = file.link_target().unwrap_or_default();

    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = fs::read_link(target)?;
            if os_bytes(current.as_os_str()) == wanted {
                return Ok(());
            }
            fs::remove_file(target)?;
        }
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    make_symlink(wanted, target)
}

#[cfg(unix)]
fn make_symlink(wanted: &[u8], target: &Path) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(wanted), target)
}

#[cfg(not(unix))]
fn make_symlink(_wanted: &[u8], _target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

fn mtime_matches(local: &fs::Metadata, attrs: &flist::FileAttrs) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        local.mtime() == attrs.mtime()
    }
    #[cfg(not(unix))]
    {
        local
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .is_some_and(|d| d.as_secs() as i64 == attrs.mtime())
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
