use std::io;

use crate::envelope::EnvelopeError;

/// Errors raised while encoding or decoding the wire protocol.
///
/// Every variant is fatal to the session: once framing is wrong there is no
/// way to resynchronize with the peer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Transport-level failure (read/write error, timeout, EOF mid-frame).
    #[error("wire I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A multiplexed frame header was malformed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A variable-length integer could not be decoded.
    #[error("malformed variable-length integer: {0}")]
    Varint(&'static str),

    /// A file-index delta could not be decoded.
    #[error("malformed file index: {0}")]
    Ndx(&'static str),

    /// The peer sent a daemon-handshake line outside the grammar.
    #[error("unexpected daemon line: {0:?}")]
    UnexpectedDaemonLine(String),

    /// The peer advertised a protocol version we cannot speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// The peer did not advertise a compatibility flag this implementation
    /// requires.
    #[error("peer lacks required compatibility flag {0}")]
    MissingCompatFlag(&'static str),

    /// A handshake line exceeded the sanity bound or lacked a terminator.
    #[error("daemon line too long or unterminated")]
    LineTooLong,

    /// Text could not be represented in the negotiated charset.
    #[error("text not representable in charset {charset}")]
    Charset {
        /// Label of the charset that rejected the text.
        charset: &'static str,
    },
}

impl ProtocolError {
    /// True when the underlying cause is a read timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}
