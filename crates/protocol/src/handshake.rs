//! `@RSYNCD` daemon-handshake grammar.
//!
//! The pre-multiplex phase of a daemon session is line oriented: greeting
//! lines carrying the protocol version, a module request, then listing,
//! authentication or acknowledgement lines, followed by the binary argument
//! vector, compatibility flags and checksum seed. This module owns the
//! grammar; the state machines driving it live in the client and daemon
//! crates.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::BitOr;

use crate::error::ProtocolError;
use crate::varint::read_u8;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 30;

/// Sub-protocol version advertised in the greeting.
pub const SUBPROTOCOL_VERSION: u32 = 0;

/// Prefix of every daemon control line.
pub const GREETING_PREFIX: &str = "@RSYNCD: ";

/// Prefix of fatal daemon error lines.
pub const ERROR_PREFIX: &str = "@ERROR";

/// Sanity bound on a single handshake line.
const MAX_LINE_LEN: usize = 1024;

/// Sanity bounds on the received argument vector.
const MAX_ARG_LEN: usize = 4096;
const MAX_ARG_COUNT: usize = 1024;

/// Compatibility flags exchanged after option negotiation.
///
/// Transmitted as a single byte; the bit values are part of the protocol-30
/// wire contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompatFlags(u8);

impl CompatFlags {
    /// Peer supports incremental recursion.
    pub const INC_RECURSE: Self = Self(1);
    /// Peer preserves symlink mtimes.
    pub const SYMLINK_TIMES: Self = Self(2);
    /// Peer converts symlink targets through the negotiated charset.
    pub const SYMLINK_ICONV: Self = Self(4);
    /// Peer transmits self-describing file-list segments. Required.
    pub const SAFE_FLIST: Self = Self(8);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw byte value.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs flags from the wire byte; unknown bits are preserved so
    /// a newer peer's flags survive a round trip.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CompatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CompatFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

/// One parsed daemon control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    /// `@RSYNCD: <major>.<minor>` greeting.
    Version {
        /// Protocol version.
        major: u32,
        /// Sub-protocol version; zero when the peer sent a bare major.
        minor: u32,
    },
    /// `@RSYNCD: OK`: proceed to the argument exchange.
    Ok,
    /// `@RSYNCD: EXIT`: clean termination after a listing.
    Exit,
    /// `@RSYNCD: AUTHREQD <challenge>`: credentials expected next.
    AuthRequired {
        /// Server-chosen challenge string.
        challenge: String,
    },
    /// `@ERROR <text>`: fatal.
    Error(String),
    /// Any other line before OK/EXIT: module listing or MOTD text.
    Line(String),
}

/// Parses one handshake line.
///
/// The grammar is total: lines outside the `@RSYNCD`/`@ERROR` prefixes are
/// listing text, not errors. Malformed `@RSYNCD` payloads are the one
/// exception, since silently treating them as listing output would desync
/// the state machine.
pub fn parse_daemon_line(line: &str) -> Result<DaemonMessage, ProtocolError> {
    if let Some(rest) = line.strip_prefix(GREETING_PREFIX) {
        let rest = rest.trim();
        if rest == "OK" {
            return Ok(DaemonMessage::Ok);
        }
        if rest == "EXIT" {
            return Ok(DaemonMessage::Exit);
        }
        if let Some(challenge) = rest.strip_prefix("AUTHREQD ") {
            return Ok(DaemonMessage::AuthRequired {
                challenge: challenge.to_string(),
            });
        }
        if rest.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
            let (major, minor) = parse_version(rest)?;
            return Ok(DaemonMessage::Version { major, minor });
        }
        return Err(ProtocolError::UnexpectedDaemonLine(line.to_string()));
    }

    if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        let text = rest.trim_start_matches(':').trim();
        return Ok(DaemonMessage::Error(text.to_string()));
    }

    Ok(DaemonMessage::Line(line.to_string()))
}

/// Parses `<major>` or `<major>.<minor>`.
fn parse_version(text: &str) -> Result<(u32, u32), ProtocolError> {
    let malformed = || ProtocolError::UnexpectedDaemonLine(text.to_string());

    match text.split_once('.') {
        Some((major, minor)) => Ok((
            major.parse().map_err(|_| malformed())?,
            minor.parse().map_err(|_| malformed())?,
        )),
        None => Ok((text.parse().map_err(|_| malformed())?, 0)),
    }
}

/// Formats the greeting line for this implementation.
#[must_use]
pub fn greeting_line() -> String {
    format!("{GREETING_PREFIX}{PROTOCOL_VERSION}.{SUBPROTOCOL_VERSION}\n")
}

/// Formats the `OK` acknowledgement line.
#[must_use]
pub fn ok_line() -> String {
    format!("{GREETING_PREFIX}OK\n")
}

/// Formats the `EXIT` line.
#[must_use]
pub fn exit_line() -> String {
    format!("{GREETING_PREFIX}EXIT\n")
}

/// Formats the authentication-required line.
#[must_use]
pub fn auth_required_line(challenge: &str) -> String {
    format!("{GREETING_PREFIX}AUTHREQD {challenge}\n")
}

/// Formats a fatal error line.
#[must_use]
pub fn error_line(text: &str) -> String {
    format!("{ERROR_PREFIX} {text}\n")
}

/// Reads one `\n`-terminated handshake line.
///
/// Reads byte-at-a-time: the bytes after the final handshake line belong to
/// the binary protocol, so the reader must never buffer past the
/// terminator. A trailing `\r` is tolerated and stripped.
pub fn read_line<R: Read>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut line = Vec::new();
    loop {
        let byte = read_u8(reader).map_err(|err| match err {
            ProtocolError::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a handshake line",
                ))
            }
            other => other,
        })?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong);
        }
        line.push(byte);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line).map_err(|err| {
        ProtocolError::UnexpectedDaemonLine(String::from_utf8_lossy(err.as_bytes()).into_owned())
    })
}

/// Writes the client's argument vector: each argument NUL-terminated, the
/// vector ended by one empty NUL.
pub fn write_args<W: Write, S: AsRef<str>>(writer: &mut W, args: &[S]) -> io::Result<()> {
    for arg in args {
        writer.write_all(arg.as_ref().as_bytes())?;
        writer.write_all(&[0])?;
    }
    writer.write_all(&[0])
}

/// Reads an argument vector written by [`write_args`].
pub fn read_args<R: Read>(reader: &mut R) -> Result<Vec<String>, ProtocolError> {
    let mut args = Vec::new();
    loop {
        let mut arg = Vec::new();
        loop {
            let byte = read_u8(reader)?;
            if byte == 0 {
                break;
            }
            if arg.len() >= MAX_ARG_LEN {
                return Err(ProtocolError::LineTooLong);
            }
            arg.push(byte);
        }
        if arg.is_empty() {
            return Ok(args);
        }
        if args.len() >= MAX_ARG_COUNT {
            return Err(ProtocolError::LineTooLong);
        }
        args.push(String::from_utf8(arg).map_err(|err| {
            ProtocolError::UnexpectedDaemonLine(
                String::from_utf8_lossy(err.as_bytes()).into_owned(),
            )
        })?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_carries_major_and_minor() {
        assert_eq!(greeting_line(), "@RSYNCD: 30.0\n");
        let parsed = parse_daemon_line(greeting_line().trim_end()).expect("parse");
        assert_eq!(
            parsed,
            DaemonMessage::Version {
                major: 30,
                minor: 0
            }
        );
    }

    #[test]
    fn bare_major_version_is_accepted() {
        let parsed = parse_daemon_line("@RSYNCD: 29").expect("parse");
        assert_eq!(
            parsed,
            DaemonMessage::Version {
                major: 29,
                minor: 0
            }
        );
    }

    #[test]
    fn control_lines_parse() {
        assert_eq!(parse_daemon_line("@RSYNCD: OK").expect("parse"), DaemonMessage::Ok);
        assert_eq!(
            parse_daemon_line("@RSYNCD: EXIT").expect("parse"),
            DaemonMessage::Exit
        );
        assert_eq!(
            parse_daemon_line("@RSYNCD: AUTHREQD s3kr1t").expect("parse"),
            DaemonMessage::AuthRequired {
                challenge: "s3kr1t".to_string()
            }
        );
    }

    #[test]
    fn error_lines_parse_with_and_without_colon() {
        assert_eq!(
            parse_daemon_line("@ERROR auth failed on module data").expect("parse"),
            DaemonMessage::Error("auth failed on module data".to_string())
        );
        assert_eq!(
            parse_daemon_line("@ERROR: unknown module").expect("parse"),
            DaemonMessage::Error("unknown module".to_string())
        );
    }

    #[test]
    fn listing_lines_pass_through() {
        let parsed = parse_daemon_line("backup\tnightly backups").expect("parse");
        assert_eq!(
            parsed,
            DaemonMessage::Line("backup\tnightly backups".to_string())
        );
    }

    #[test]
    fn malformed_rsyncd_payload_is_rejected() {
        assert!(parse_daemon_line("@RSYNCD: BOGUS go").is_err());
    }

    #[test]
    fn read_line_stops_at_the_terminator() {
        let mut cursor = &b"@RSYNCD: OK\nBINARY"[..];
        assert_eq!(read_line(&mut cursor).expect("line"), "@RSYNCD: OK");
        assert_eq!(cursor, b"BINARY");
    }

    #[test]
    fn read_line_rejects_unterminated_input() {
        let mut cursor = &b"@RSYNCD: OK"[..];
        assert!(read_line(&mut cursor).is_err());
    }

    #[test]
    fn read_line_enforces_the_length_bound() {
        let mut long = vec![b'x'; MAX_LINE_LEN + 1];
        long.push(b'\n');
        let mut cursor = long.as_slice();
        assert!(matches!(
            read_line(&mut cursor),
            Err(ProtocolError::LineTooLong)
        ));
    }

    #[test]
    fn args_round_trip() {
        let args = ["--server", "-ltr", ".", "module/path"];
        let mut wire = Vec::new();
        write_args(&mut wire, &args).expect("vec write");
        assert_eq!(wire.last(), Some(&0));

        let mut cursor = wire.as_slice();
        let decoded = read_args(&mut cursor).expect("decode");
        assert_eq!(decoded, args);
        assert!(cursor.is_empty());
    }

    #[test]
    fn empty_arg_vector_is_one_nul() {
        let mut wire = Vec::new();
        write_args::<_, &str>(&mut wire, &[]).expect("vec write");
        assert_eq!(wire, [0]);
        assert!(read_args(&mut wire.as_slice()).expect("decode").is_empty());
    }

    #[test]
    fn compat_flags_combine_and_test() {
        let flags = CompatFlags::INC_RECURSE | CompatFlags::SAFE_FLIST;
        assert_eq!(flags.bits(), 0b1001);
        assert!(flags.contains(CompatFlags::SAFE_FLIST));
        assert!(!flags.contains(CompatFlags::SYMLINK_TIMES));
        assert_eq!(CompatFlags::from_bits(flags.bits()), flags);
    }
}
