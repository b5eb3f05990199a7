//! Wire-level building blocks for the rsync protocol, version 30.
//!
//! The crate owns everything that touches raw bytes on the connection:
//! little-endian integer and variable-length codecs, the file-index delta
//! codec, the multiplexed message envelope, the `@RSYNCD` daemon handshake
//! grammar and the filename charset codecs. Higher layers (file lists, the
//! transfer engine, the daemon) compose these primitives; nothing in here
//! knows about files or sessions.

pub mod auth;
pub mod charset;
pub mod envelope;
pub mod handshake;
pub mod multiplex;
pub mod ndx;
pub mod varint;

mod error;

pub use charset::TextCodec;
pub use envelope::{
    EnvelopeError, HEADER_LEN, MAX_PAYLOAD_LENGTH, MPLEX_BASE, MessageCode, MessageHeader,
    PAYLOAD_MASK,
};
pub use error::ProtocolError;
pub use handshake::{
    CompatFlags, DaemonMessage, GREETING_PREFIX, PROTOCOL_VERSION, SUBPROTOCOL_VERSION,
};
pub use multiplex::{DemuxReader, MessageHandler, MuxWriter};
pub use ndx::{NDX_DONE, NDX_FLIST_EOF, NDX_FLIST_OFFSET, NdxReader, NdxWriter};
