//! Command-line surface.
//!
//! One binary serves both seats: `rrsync SRC [DEST]` runs a client
//! session (local, upload or download decided by the endpoint forms), and
//! `rrsync --daemon --config FILE` runs the serving loop.

use std::path::PathBuf;

use clap::Parser;
use rsync_core::client::url::parse_endpoint;
use rsync_core::{ClientConfig, ClientError, ExitCode, run_client};
use daemon::{Daemon, DaemonConfig, DEFAULT_PORT};
use engine::SessionOptions;
use filters::FilterSet;
use protocol::TextCodec;

/// A portable implementation of the rsync client and daemon, protocol 30.
#[derive(Debug, Parser)]
#[command(name = "rrsync", version, disable_help_flag = false)]
struct Args {
    /// Recurse into directories
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Transfer directories without recursing
    #[arg(short = 'd', long)]
    dirs: bool,

    /// Copy symlinks as symlinks
    #[arg(short = 'l', long)]
    links: bool,

    /// Preserve modification times
    #[arg(short = 't', long)]
    times: bool,

    /// Preserve permissions
    #[arg(short = 'p', long)]
    perms: bool,

    /// Preserve owner (root only)
    #[arg(short = 'o', long)]
    owner: bool,

    /// Preserve group
    #[arg(short = 'g', long)]
    group: bool,

    /// Archive mode; same as -rlptgo (no -D)
    #[arg(short = 'a', long)]
    archive: bool,

    /// Transfer files even when size and mtime agree
    #[arg(short = 'I', long)]
    ignore_times: bool,

    /// Itemize every file list entry
    #[arg(short = 'i', long = "itemize-changes")]
    itemize_changes: bool,

    /// Delete destination files the source no longer has
    #[arg(long)]
    delete: bool,

    /// Transfer numeric uid/gid instead of names
    #[arg(long)]
    numeric_ids: bool,

    /// Skip the final rename when rebuilt content is unchanged
    #[arg(long)]
    defer_write: bool,

    /// Exclude files matching PATTERN (repeatable, ordered with --include)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Include files matching PATTERN (repeatable, ordered with --exclude)
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,

    /// Read the daemon password from FILE
    #[arg(long, value_name = "FILE")]
    password_file: Option<PathBuf>,

    /// Daemon TCP port
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Charset for daemon text
    #[arg(long, value_name = "NAME")]
    charset: Option<String>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run as a daemon
    #[arg(long)]
    daemon: bool,

    /// Daemon configuration file
    #[arg(long, value_name = "FILE", requires = "daemon")]
    config: Option<PathBuf>,

    /// Source (daemon mode: none)
    #[arg(value_name = "SRC", required_unless_present = "daemon")]
    source: Option<String>,

    /// Destination
    #[arg(value_name = "DEST")]
    dest: Option<String>,
}

impl Args {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            recursive: self.recursive || self.archive,
            dirs: self.dirs,
            preserve_links: self.links || self.archive,
            preserve_times: self.times || self.archive,
            preserve_perms: self.perms || self.archive,
            preserve_uid: self.owner || self.archive,
            preserve_gid: self.group || self.archive,
            ignore_times: self.ignore_times,
            always_itemize: self.itemize_changes,
            delete: self.delete,
            numeric_ids: self.numeric_ids,
            defer_write: self.defer_write,
        }
    }

    fn filter_set(&self) -> Result<FilterSet, ClientError> {
        let mut filters = FilterSet::new();
        // Include rules go first so they can carve exceptions out of the
        // excludes, matching how the two flags are typically combined.
        for pattern in &self.include {
            filters
                .include(pattern)
                .map_err(|err| ClientError::Usage(err.to_string()))?;
        }
        for pattern in &self.exclude {
            filters
                .exclude(pattern)
                .map_err(|err| ClientError::Usage(err.to_string()))?;
        }
        Ok(filters)
    }
}

/// Parses arguments and runs the program; returns the process exit code.
pub fn run<I, T>(argv: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let args = match Args::try_parse_from(argv) {
        Ok(args) => args,
        Err(err) => {
            // clap's own exit codes do not match rsync's convention of 1
            // for usage errors; help and version remain successful.
            let code = if err.use_stderr() { ExitCode::Syntax.as_i32() } else { 0 };
            let _ = err.print();
            return code;
        }
    };

    init_logging(args.verbose);

    if args.daemon {
        return run_daemon(&args);
    }
    run_session(&args)
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn run_daemon(args: &Args) -> i32 {
    let Some(config_path) = &args.config else {
        eprintln!("rrsync: --daemon requires --config");
        return ExitCode::Syntax.as_i32();
    };

    let config = match DaemonConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rrsync: {err}");
            return ExitCode::Syntax.as_i32();
        }
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match Daemon::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("rrsync: cannot listen on {addr}: {err}");
            return ExitCode::SocketIo.as_i32();
        }
    };

    tracing::info!(%addr, "daemon listening");
    match Daemon::new(config).serve(&listener) {
        Ok(()) => ExitCode::Ok.as_i32(),
        Err(err) => {
            eprintln!("rrsync: accept loop failed: {err}");
            ExitCode::SocketIo.as_i32()
        }
    }
}

fn run_session(args: &Args) -> i32 {
    match build_client_config(args).and_then(|cfg| run_client(&cfg)) {
        Ok(summary) => {
            for line in &summary.module_list {
                println!("{line}");
            }
            if args.verbose > 0 && summary.module_list.is_empty() {
                eprintln!(
                    "files: {}  transferred: {}  literal: {}  matched: {}",
                    summary.num_files,
                    summary.num_transferred,
                    summary.literal_bytes,
                    summary.matched_bytes,
                );
            }
            summary.exit_code().as_i32()
        }
        Err(err) => {
            eprintln!("rrsync: {err}");
            err.exit_code().as_i32()
        }
    }
}

fn build_client_config(args: &Args) -> Result<ClientConfig, ClientError> {
    let source_text = args
        .source
        .as_deref()
        .ok_or_else(|| ClientError::Usage("missing source".to_string()))?;

    let source = parse_endpoint(source_text, args.port)?;
    let dest = args
        .dest
        .as_deref()
        .map(|dest| parse_endpoint(dest, args.port))
        .transpose()?;

    let charset = match &args.charset {
        Some(label) => TextCodec::strict(label)
            .ok_or_else(|| ClientError::Usage(format!("unknown charset {label:?}")))?,
        None => TextCodec::utf8(),
    };

    let mut cfg = ClientConfig::new(source, dest);
    cfg.opts = args.session_options();
    cfg.filters = args.filter_set()?;
    cfg.password_file = args.password_file.clone();
    cfg.charset = charset;
    Ok(cfg)
}
