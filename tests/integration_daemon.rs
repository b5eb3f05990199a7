//! End-to-end daemon sessions over loopback TCP.
//!
//! Each test starts a real daemon thread on an ephemeral port and drives
//! it with the real client, so the full stack is exercised: handshake,
//! multiplexing, incremental file lists, delta transfer, verification and
//! metadata.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;

use daemon::{Daemon, DaemonConfig};
use engine::SessionOptions;
use rsync_core::client::url::{DaemonTarget, Endpoint};
use rsync_core::{ClientConfig, ClientError, ExitCode, run_client};

/// Starts a daemon for `config_text` and returns its address.
fn start_daemon(config_text: &str) -> SocketAddr {
    let config = DaemonConfig::parse(config_text).expect("valid daemon config");
    let listener = Daemon::bind(SocketAddr::from(([127, 0, 0, 1], 0))).expect("bind");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        let _ = Daemon::new(config).serve(&listener);
    });
    addr
}

fn module_config(name: &str, path: &Path, writable: bool) -> String {
    format!(
        "[{name}]\npath = {}\ncomment = test module\nis_writable = {}\n",
        path.display(),
        if writable { "yes" } else { "no" },
    )
}

fn daemon_endpoint(addr: SocketAddr, path: &str, user: Option<&str>) -> Endpoint {
    Endpoint::Daemon(DaemonTarget {
        user: user.map(str::to_string),
        host: addr.ip().to_string(),
        port: addr.port(),
        path: path.to_string(),
    })
}

fn client_config(source: Endpoint, dest: Option<Endpoint>, opts: SessionOptions) -> ClientConfig {
    let mut cfg = ClientConfig::new(source, dest);
    cfg.opts = opts;
    cfg
}

fn recursive_with_times() -> SessionOptions {
    SessionOptions {
        recursive: true,
        preserve_times: true,
        ..SessionOptions::default()
    }
}

#[test]
fn empty_directory_upload_reports_one_file() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    let empty = src.path().join("empty");
    fs::create_dir(&empty).expect("mkdir");

    let cfg = client_config(
        Endpoint::Local(empty),
        Some(daemon_endpoint(addr, "Uploads", None)),
        recursive_with_times(),
    );
    let summary = run_client(&cfg).expect("session succeeds");

    assert_eq!(summary.num_files, 1); // just the dot dir
    assert_eq!(summary.num_transferred, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.exit_code(), ExitCode::Ok);
}

#[test]
fn small_file_upload_arrives_with_content_mtime_and_mode() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    let content: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    fs::write(src.path().join("payload.bin"), &content).expect("write");
    filetime::set_file_mtime(
        src.path().join("payload.bin"),
        filetime::FileTime::from_unix_time(1_234_567_000, 0),
    )
    .expect("set mtime");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "Uploads", None)),
        recursive_with_times(),
    );
    let summary = run_client(&cfg).expect("session succeeds");
    assert_eq!(summary.num_transferred, 1);
    assert_eq!(summary.exit_code(), ExitCode::Ok);

    let uploaded = module_root.path().join("payload.bin");
    assert_eq!(fs::read(&uploaded).expect("read"), content);

    let meta = fs::metadata(&uploaded).expect("stat");
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
        1_234_567_000
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let expected = 0o666 & !engine::metadata::process_umask();
        assert_eq!(meta.permissions().mode() & 0o777, expected);
    }
}

#[test]
fn delta_transfer_sends_little_literal_data() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    const LEN: usize = 1 << 20;
    let source: Vec<u8> = (0..LEN).map(|i| (i * 131 % 251) as u8).collect();
    let mut basis = source.clone();
    for byte in &mut basis[100_000..100_100] {
        *byte ^= 0x55;
    }

    fs::write(src.path().join("big.bin"), &source).expect("write");
    fs::write(module_root.path().join("big.bin"), &basis).expect("write");
    // Distinct mtimes, or the quick check would elide the transfer.
    filetime::set_file_mtime(
        src.path().join("big.bin"),
        filetime::FileTime::from_unix_time(1_000_000_000, 0),
    )
    .expect("set mtime");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "Uploads", None)),
        recursive_with_times(),
    );
    let summary = run_client(&cfg).expect("session succeeds");

    assert_eq!(
        fs::read(module_root.path().join("big.bin")).expect("read"),
        source
    );

    // The edit dirties at most two blocks; everything else must arrive as
    // matches against the basis.
    let block = u64::from(engine::delta::block_size(LEN as u64));
    assert!(
        summary.literal_bytes <= 2 * block,
        "literal bytes {} exceed two blocks ({block})",
        summary.literal_bytes
    );
    assert!(
        summary.matched_bytes >= LEN as u64 - 2 * block,
        "matched bytes {} below expectation",
        summary.matched_bytes
    );
}

#[test]
fn download_rebuilds_a_tree() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let dest = tempfile::tempdir().expect("tempdir");
    fs::create_dir(module_root.path().join("sub")).expect("mkdir");
    fs::write(module_root.path().join("top"), b"top bytes").expect("write");
    fs::write(module_root.path().join("sub/leaf"), b"leaf bytes").expect("write");

    let addr = start_daemon(&module_config("data", module_root.path(), false));

    let cfg = client_config(
        daemon_endpoint(addr, "data", None),
        Some(Endpoint::Local(dest.path().to_path_buf())),
        recursive_with_times(),
    );
    let summary = run_client(&cfg).expect("session succeeds");

    assert_eq!(summary.num_files, 4);
    assert_eq!(summary.num_transferred, 2);
    assert_eq!(fs::read(dest.path().join("top")).expect("read"), b"top bytes");
    assert_eq!(
        fs::read(dest.path().join("sub/leaf")).expect("read"),
        b"leaf bytes"
    );
    let server = summary.server_stats.expect("server statistics");
    assert!(server.bytes_written > 0);
}

#[test]
fn module_listing_returns_the_modules() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let config = format!(
        "{}\n{}",
        module_config("alpha", module_root.path(), false),
        module_config("beta", module_root.path(), true),
    );
    let addr = start_daemon(&config);

    let cfg = client_config(
        daemon_endpoint(addr, "", None),
        None,
        SessionOptions::default(),
    );
    let summary = run_client(&cfg).expect("listing succeeds");

    assert_eq!(summary.exit_code(), ExitCode::Ok);
    assert_eq!(summary.module_list.len(), 2);
    assert!(summary.module_list[0].starts_with("alpha"));
    assert!(summary.module_list[1].starts_with("beta"));
}

#[test]
fn unknown_module_is_a_session_setup_error() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("data", module_root.path(), false));

    let dest = tempfile::tempdir().expect("tempdir");
    let cfg = client_config(
        daemon_endpoint(addr, "nosuch", None),
        Some(Endpoint::Local(dest.path().to_path_buf())),
        SessionOptions::default(),
    );
    let err = run_client(&cfg).expect_err("unknown module must fail");
    assert_eq!(err.exit_code(), ExitCode::StartClient);
}

#[test]
fn authentication_accepts_the_right_password_and_rejects_the_wrong_one() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let mut secrets = tempfile::NamedTempFile::new().expect("temp secrets");
    writeln!(secrets, "alice:opensesame").expect("write");

    let config = format!(
        "[vault]\npath = {}\nis_writable = yes\nauth_users = alice\nsecrets_file = {}\n",
        module_root.path().display(),
        secrets.path().display(),
    );
    let addr = start_daemon(&config);

    let src = tempfile::tempdir().expect("tempdir");
    fs::write(src.path().join("doc"), b"secret doc").expect("write");

    // Correct password.
    let mut good = tempfile::NamedTempFile::new().expect("temp password");
    writeln!(good, "opensesame").expect("write");
    let mut cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "vault", Some("alice"))),
        recursive_with_times(),
    );
    cfg.password_file = Some(good.path().to_path_buf());
    let summary = run_client(&cfg).expect("authenticated session succeeds");
    assert_eq!(summary.num_transferred, 1);
    assert_eq!(fs::read(module_root.path().join("doc")).expect("read"), b"secret doc");

    // Wrong password.
    let mut bad = tempfile::NamedTempFile::new().expect("temp password");
    writeln!(bad, "wrong").expect("write");
    let mut cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "vault", Some("alice"))),
        recursive_with_times(),
    );
    cfg.password_file = Some(bad.path().to_path_buf());
    let err = run_client(&cfg).expect_err("wrong password must fail");
    assert_eq!(err.exit_code(), ExitCode::StartClient);
    assert!(matches!(err, ClientError::Daemon(ref text) if text.contains("auth failed")));
}

#[test]
fn read_only_module_rejects_uploads() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("ro", module_root.path(), false));

    let src = tempfile::tempdir().expect("tempdir");
    fs::write(src.path().join("f"), b"x").expect("write");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "ro", None)),
        recursive_with_times(),
    );
    let err = run_client(&cfg).expect_err("upload to read-only module must fail");
    assert_eq!(err.exit_code(), ExitCode::SocketIo);
}

#[test]
fn missing_safe_flist_flag_fails_the_handshake() {
    // A hand-rolled peer that advertises incremental recursion but not
    // safe file lists; the client must abort with a protocol error.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut writer = stream;

        writer.write_all(b"@RSYNCD: 30.0\n").expect("write");
        writer.flush().expect("flush");

        let mut line = String::new();
        reader.read_line(&mut line).expect("client greeting");
        line.clear();
        reader.read_line(&mut line).expect("module request");

        writer.write_all(b"@RSYNCD: OK\n").expect("write");
        writer.flush().expect("flush");

        // Drain the argument vector up to its double-NUL terminator.
        let mut last = 1u8;
        loop {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).expect("args");
            if byte[0] == 0 && last == 0 {
                break;
            }
            if byte[0] == 0 && last != 0 {
                last = 0;
                continue;
            }
            last = byte[0];
        }

        // CF_INC_RECURSE only, then a seed.
        writer.write_all(&[1u8]).expect("compat");
        writer.write_all(&42i32.to_le_bytes()).expect("seed");
        writer.flush().expect("flush");
    });

    let dest = tempfile::tempdir().expect("tempdir");
    let cfg = client_config(
        daemon_endpoint(addr, "data", None),
        Some(Endpoint::Local(dest.path().to_path_buf())),
        SessionOptions {
            recursive: true,
            ..SessionOptions::default()
        },
    );
    let err = run_client(&cfg).expect_err("missing CF_SAFE_FLIST must fail");
    assert_eq!(err.exit_code(), ExitCode::SocketIo);
}

#[test]
fn delete_removes_stale_server_entries() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    fs::write(src.path().join("wanted"), b"w").expect("write");
    fs::write(module_root.path().join("stale"), b"s").expect("write");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "Uploads", None)),
        SessionOptions {
            recursive: true,
            delete: true,
            ..SessionOptions::default()
        },
    );
    run_client(&cfg).expect("session succeeds");

    assert!(module_root.path().join("wanted").exists());
    assert!(!module_root.path().join("stale").exists());
}

#[test]
fn upload_into_a_module_subdirectory() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    fs::write(src.path().join("nested"), b"nested bytes").expect("write");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "Uploads/a/b", None)),
        recursive_with_times(),
    );
    run_client(&cfg).expect("session succeeds");

    assert_eq!(
        fs::read(module_root.path().join("a/b/nested")).expect("read"),
        b"nested bytes"
    );
}

#[test]
fn path_escapes_are_refused() {
    let src = tempfile::tempdir().expect("tempdir");
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("Uploads", module_root.path(), true));

    fs::write(src.path().join("f"), b"x").expect("write");

    let cfg = client_config(
        Endpoint::Local(src.path().to_path_buf()),
        Some(daemon_endpoint(addr, "Uploads/../../etc", None)),
        recursive_with_times(),
    );
    let err = run_client(&cfg).expect_err("escape must fail");
    assert_eq!(err.exit_code(), ExitCode::SocketIo);
}

/// Keeps the handshake honest at the byte level: greeting, listing, EXIT.
#[test]
fn raw_handshake_lines_match_the_grammar() {
    let module_root = tempfile::tempdir().expect("tempdir");
    let addr = start_daemon(&module_config("data", module_root.path(), false));

    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));

    let mut line = String::new();
    reader.read_line(&mut line).expect("greeting");
    assert_eq!(line, "@RSYNCD: 30.0\n");

    stream.write_all(b"@RSYNCD: 30.0\n\n").expect("request listing");
    stream.flush().expect("flush");

    let mut listing = String::new();
    reader.read_to_string(&mut listing).expect("listing");
    assert!(listing.contains("data"));
    assert!(listing.trim_end().ends_with("@RSYNCD: EXIT"));
}
