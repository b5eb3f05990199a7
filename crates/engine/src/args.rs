//! Server-side argument vector.
//!
//! After `@RSYNCD: OK` the client transmits the option subset the server
//! must mirror, rsync style: `--server`, `--sender` when the server is to
//! send, a clustered short-option word, the long options, a lone `.`
//! separator and finally the module-qualified path. Both directions of the
//! grammar live here so client and daemon cannot drift apart.

use crate::error::EngineError;
use crate::session::SessionOptions;

/// Parsed server request.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// Options the session runs under.
    pub opts: SessionOptions,
    /// True when the server side sends (the client downloads).
    pub server_sends: bool,
    /// Module-qualified path (`module[/sub/path]`).
    pub path: String,
}

/// Builds the argument vector the client sends.
#[must_use]
pub fn build_server_args(opts: &SessionOptions, server_sends: bool, path: &str) -> Vec<String> {
    let mut args = vec!["--server".to_string()];
    if server_sends {
        args.push("--sender".to_string());
    }

    let mut short = String::from("-");
    for (flag, ch) in [
        (opts.recursive, 'r'),
        (opts.preserve_links, 'l'),
        (opts.preserve_times, 't'),
        (opts.preserve_perms, 'p'),
        (opts.preserve_uid, 'o'),
        (opts.preserve_gid, 'g'),
        (opts.dirs, 'd'),
        (opts.ignore_times, 'I'),
        (opts.always_itemize, 'i'),
    ] {
        if flag {
            short.push(ch);
        }
    }
    if short.len() > 1 {
        args.push(short);
    }

    if opts.delete {
        args.push("--delete".to_string());
    }
    if opts.numeric_ids {
        args.push("--numeric-ids".to_string());
    }
    if opts.defer_write {
        args.push("--defer-write".to_string());
    }

    args.push(".".to_string());
    args.push(path.to_string());
    args
}

/// Parses an argument vector built by [`build_server_args`].
pub fn parse_server_args(args: &[String]) -> Result<ServerRequest, EngineError> {
    let mut opts = SessionOptions::default();
    let mut server_sends = false;
    let mut saw_server = false;
    let mut path: Option<String> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--server" => saw_server = true,
            "--sender" => server_sends = true,
            "--delete" => opts.delete = true,
            "--numeric-ids" => opts.numeric_ids = true,
            "--defer-write" => opts.defer_write = true,
            "." => {
                let target = iter
                    .next()
                    .ok_or_else(|| EngineError::Args("missing path after '.'".to_string()))?;
                if iter.next().is_some() {
                    return Err(EngineError::Args("trailing arguments".to_string()));
                }
                path = Some(target.clone());
            }
            short if short.starts_with('-') && short.len() > 1 && !short.starts_with("--") => {
                for ch in short.chars().skip(1) {
                    match ch {
                        'r' => opts.recursive = true,
                        'l' => opts.preserve_links = true,
                        't' => opts.preserve_times = true,
                        'p' => opts.preserve_perms = true,
                        'o' => opts.preserve_uid = true,
                        'g' => opts.preserve_gid = true,
                        'd' => opts.dirs = true,
                        'I' => opts.ignore_times = true,
                        'i' => opts.always_itemize = true,
                        'v' => {}
                        _ => {
                            return Err(EngineError::Args(format!("unknown option -{ch}")));
                        }
                    }
                }
            }
            other => {
                return Err(EngineError::Args(format!("unknown argument {other:?}")));
            }
        }
    }

    if !saw_server {
        return Err(EngineError::Args("--server missing".to_string()));
    }
    let path = path.ok_or_else(|| EngineError::Args("no path requested".to_string()))?;

    Ok(ServerRequest {
        opts,
        server_sends,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_round_trip() {
        let opts = SessionOptions {
            recursive: true,
            preserve_times: true,
            preserve_perms: true,
            delete: true,
            defer_write: true,
            ..SessionOptions::default()
        };
        let args = build_server_args(&opts, true, "data/sub");
        let request = parse_server_args(&args).expect("parse");

        assert!(request.server_sends);
        assert_eq!(request.path, "data/sub");
        assert!(request.opts.recursive);
        assert!(request.opts.preserve_times);
        assert!(request.opts.preserve_perms);
        assert!(request.opts.delete);
        assert!(request.opts.defer_write);
        assert!(!request.opts.preserve_links);
    }

    #[test]
    fn upload_omits_the_sender_flag() {
        let args = build_server_args(&SessionOptions::default(), false, "data");
        assert_eq!(args, ["--server", ".", "data"]);
        assert!(!parse_server_args(&args).expect("parse").server_sends);
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let args = vec!["--server".to_string(), "--chown=0:0".to_string()];
        assert!(parse_server_args(&args).is_err());
        let args = vec!["--server".to_string(), "-rQ".to_string()];
        assert!(parse_server_args(&args).is_err());
    }

    #[test]
    fn the_path_is_mandatory() {
        let args = vec!["--server".to_string()];
        assert!(parse_server_args(&args).is_err());
        let args = vec!["--server".to_string(), ".".to_string()];
        assert!(parse_server_args(&args).is_err());
    }
}
