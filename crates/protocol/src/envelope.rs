//! Multiplexed message envelope.
//!
//! Once the daemon handshake completes, the multiplexed direction of the
//! connection carries frames: a 4-byte little-endian header whose low 24
//! bits are the payload length and whose high 8 bits are the message tag
//! (`MPLEX_BASE` plus the message code), followed by the payload. `DATA`
//! frames carry application bytes; every other code is a control message.

use std::fmt;
use std::str::FromStr;

/// Offset added to [`MessageCode`] values to form the wire tag.
pub const MPLEX_BASE: u8 = 7;

/// Size of an encoded frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Mask isolating the 24-bit payload length inside a raw header.
pub const PAYLOAD_MASK: u32 = 0x00FF_FFFF;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LENGTH: u32 = PAYLOAD_MASK;

/// Message codes multiplexed alongside the data stream.
///
/// The numeric values match upstream rsync's `enum msgcode` for protocol 30
/// exactly; they are part of the wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    /// Application bytes for the role loop.
    Data = 0,
    /// Non-fatal transfer error; contributes to the partial-transfer exit.
    ErrorXfer = 1,
    /// Informational text for the user.
    Info = 2,
    /// Fatal error text.
    Error = 3,
    /// Warning text.
    Warning = 4,
    /// Socket-level error text.
    ErrorSocket = 5,
    /// Log-only text (daemon log file).
    Log = 6,
    /// Text destined for the client side only.
    Client = 7,
    /// Charset-conversion error text.
    ErrorUtf8 = 8,
    /// The receiver wants the flagged file retransmitted.
    Redo = 9,
    /// An incremental file-list segment follows on the data channel.
    Flist = 20,
    /// No further file-list segments will be sent.
    FlistEof = 21,
    /// The sender hit I/O errors while building the file list.
    IoError = 22,
    /// Keep-alive; carries no payload.
    NoOp = 42,
    /// A role loop finished its final phase.
    Done = 86,
    /// The flagged file was handled without a transfer.
    Success = 100,
    /// The generator deleted the named destination entry.
    Deleted = 101,
    /// The sender refuses to transfer the flagged file.
    NoSend = 102,
}

impl MessageCode {
    const ALL: [Self; 18] = [
        Self::Data,
        Self::ErrorXfer,
        Self::Info,
        Self::Error,
        Self::Warning,
        Self::ErrorSocket,
        Self::Log,
        Self::Client,
        Self::ErrorUtf8,
        Self::Redo,
        Self::Flist,
        Self::FlistEof,
        Self::IoError,
        Self::NoOp,
        Self::Done,
        Self::Success,
        Self::Deleted,
        Self::NoSend,
    ];

    /// All known codes, sorted by numeric value.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &Self::ALL
    }

    /// Numeric wire value of the code (before the `MPLEX_BASE` offset).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Looks a code up by its numeric value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::ErrorXfer),
            2 => Some(Self::Info),
            3 => Some(Self::Error),
            4 => Some(Self::Warning),
            5 => Some(Self::ErrorSocket),
            6 => Some(Self::Log),
            7 => Some(Self::Client),
            8 => Some(Self::ErrorUtf8),
            9 => Some(Self::Redo),
            20 => Some(Self::Flist),
            21 => Some(Self::FlistEof),
            22 => Some(Self::IoError),
            42 => Some(Self::NoOp),
            86 => Some(Self::Done),
            100 => Some(Self::Success),
            101 => Some(Self::Deleted),
            102 => Some(Self::NoSend),
            _ => None,
        }
    }

    /// Upstream identifier of the code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Data => "MSG_DATA",
            Self::ErrorXfer => "MSG_ERROR_XFER",
            Self::Info => "MSG_INFO",
            Self::Error => "MSG_ERROR",
            Self::Warning => "MSG_WARNING",
            Self::ErrorSocket => "MSG_ERROR_SOCKET",
            Self::Log => "MSG_LOG",
            Self::Client => "MSG_CLIENT",
            Self::ErrorUtf8 => "MSG_ERROR_UTF8",
            Self::Redo => "MSG_REDO",
            Self::Flist => "MSG_FLIST",
            Self::FlistEof => "MSG_FLIST_EOF",
            Self::IoError => "MSG_IO_ERROR",
            Self::NoOp => "MSG_NOOP",
            Self::Done => "MSG_DONE",
            Self::Success => "MSG_SUCCESS",
            Self::Deleted => "MSG_DELETED",
            Self::NoSend => "MSG_NO_SEND",
        }
    }

    /// True for codes whose payload is text to surface to the user.
    #[must_use]
    pub const fn is_logging(self) -> bool {
        matches!(
            self,
            Self::ErrorXfer
                | Self::Info
                | Self::Error
                | Self::Warning
                | Self::ErrorSocket
                | Self::Log
                | Self::Client
                | Self::ErrorUtf8
        )
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> Self {
        code.as_u8()
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, EnvelopeError> {
        Self::from_u8(value).ok_or(EnvelopeError::UnknownMessageCode(value))
    }
}

impl FromStr for MessageCode {
    type Err = EnvelopeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.name() == name)
            .ok_or_else(|| EnvelopeError::UnknownMessageName(name.to_string()))
    }
}

/// Errors raised while encoding or decoding frame headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The tag byte was below `MPLEX_BASE`.
    #[error("invalid multiplex tag: {0}")]
    InvalidTag(u8),

    /// The tag byte mapped to no known message code.
    #[error("unknown multiplexed message code: {0}")]
    UnknownMessageCode(u8),

    /// A name lookup missed every known code.
    #[error("unknown multiplexed message code name: {0:?}")]
    UnknownMessageName(String),

    /// Fewer than [`HEADER_LEN`] bytes were available.
    #[error("truncated frame header: {actual} of 4 bytes")]
    TruncatedHeader {
        /// Bytes actually available.
        actual: usize,
    },

    /// The payload length does not fit in 24 bits.
    #[error("payload length {0} exceeds the 24-bit frame limit")]
    OversizedPayload(u32),
}

/// Decoded frame header: message code plus payload length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    code: MessageCode,
    payload_len: u32,
}

impl MessageHeader {
    /// Builds a header, validating the payload length.
    pub const fn new(code: MessageCode, payload_len: u32) -> Result<Self, EnvelopeError> {
        if payload_len > MAX_PAYLOAD_LENGTH {
            return Err(EnvelopeError::OversizedPayload(payload_len));
        }
        Ok(Self { code, payload_len })
    }

    /// Message code carried by the frame.
    #[must_use]
    pub const fn code(self) -> MessageCode {
        self.code
    }

    /// Payload length in bytes.
    #[must_use]
    pub const fn payload_len(self) -> u32 {
        self.payload_len
    }

    /// Payload length as a `usize`.
    #[must_use]
    pub const fn payload_len_usize(self) -> usize {
        self.payload_len as usize
    }

    /// Raw `u32` representation (host order).
    #[must_use]
    pub const fn encode_raw(self) -> u32 {
        ((MPLEX_BASE as u32 + self.code.as_u8() as u32) << 24) | self.payload_len
    }

    /// Little-endian wire representation.
    #[must_use]
    pub const fn encode(self) -> [u8; HEADER_LEN] {
        self.encode_raw().to_le_bytes()
    }

    /// Decodes a raw `u32` representation.
    pub const fn from_raw(raw: u32) -> Result<Self, EnvelopeError> {
        let tag = (raw >> 24) as u8;
        if tag < MPLEX_BASE {
            return Err(EnvelopeError::InvalidTag(tag));
        }
        let code = match MessageCode::from_u8(tag - MPLEX_BASE) {
            Some(code) => code,
            None => return Err(EnvelopeError::UnknownMessageCode(tag - MPLEX_BASE)),
        };
        Ok(Self {
            code,
            payload_len: raw & PAYLOAD_MASK,
        })
    }

    /// Decodes a little-endian wire header.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::TruncatedHeader {
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        Self::from_raw(u32::from_le_bytes(raw))
    }
}

impl TryFrom<[u8; HEADER_LEN]> for MessageHeader {
    type Error = EnvelopeError;

    fn try_from(bytes: [u8; HEADER_LEN]) -> Result<Self, EnvelopeError> {
        Self::decode(&bytes)
    }
}

impl TryFrom<&[u8; HEADER_LEN]> for MessageHeader {
    type Error = EnvelopeError;

    fn try_from(bytes: &[u8; HEADER_LEN]) -> Result<Self, EnvelopeError> {
        Self::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn header_round_trips_for_info_message() {
        let header = MessageHeader::new(MessageCode::Info, 123).expect("constructible header");
        let encoded = header.encode();
        let decoded = MessageHeader::decode(&encoded).expect("decode succeeds");
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_round_trips_for_all_codes_and_sample_lengths() {
        const PAYLOAD_SAMPLES: [u32; 3] = [0, 1, MAX_PAYLOAD_LENGTH];

        for &code in MessageCode::all() {
            for &len in &PAYLOAD_SAMPLES {
                let header = MessageHeader::new(code, len).expect("constructible header");
                let decoded = MessageHeader::decode(&header.encode()).expect("decode succeeds");
                assert_eq!(decoded.code(), code);
                assert_eq!(decoded.payload_len(), len);
            }
        }
    }

    #[test]
    fn encode_uses_little_endian_layout() {
        let payload_len = 0x00A1_B2C3;
        let header = MessageHeader::new(MessageCode::Info, payload_len).expect("valid header");
        let expected_raw =
            ((u32::from(MPLEX_BASE) + u32::from(MessageCode::Info.as_u8())) << 24) | payload_len;
        assert_eq!(header.encode(), expected_raw.to_le_bytes());
    }

    #[test]
    fn new_rejects_oversized_payloads() {
        let err = MessageHeader::new(MessageCode::Info, MAX_PAYLOAD_LENGTH + 1).unwrap_err();
        assert_eq!(err, EnvelopeError::OversizedPayload(MAX_PAYLOAD_LENGTH + 1));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = MessageHeader::decode(&[0u8; 2]).unwrap_err();
        assert_eq!(err, EnvelopeError::TruncatedHeader { actual: 2 });
    }

    #[test]
    fn decode_rejects_tag_without_base_offset() {
        let raw = (u32::from(MPLEX_BASE - 1) << 24) | 1;
        let err = MessageHeader::decode(&raw.to_le_bytes()).unwrap_err();
        assert_eq!(err, EnvelopeError::InvalidTag(MPLEX_BASE - 1));
    }

    #[test]
    fn decode_rejects_unknown_message_codes() {
        let unknown_code = 11u8;
        let tag = u32::from(MPLEX_BASE) + u32::from(unknown_code);
        let raw = (tag << 24) | 5;
        let err = MessageHeader::decode(&raw.to_le_bytes()).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownMessageCode(unknown_code));
    }

    #[test]
    fn from_raw_matches_decode() {
        let header = MessageHeader::new(MessageCode::Done, 0x0055_AA11).expect("valid header");
        let decoded = MessageHeader::from_raw(header.encode_raw()).expect("raw decodes");
        assert_eq!(decoded, header);
    }

    #[test]
    fn message_code_variants_round_trip_through_try_from() {
        for &code in MessageCode::all() {
            let decoded = MessageCode::try_from(code.as_u8()).expect("known code");
            assert_eq!(decoded, code);
        }
    }

    #[test]
    fn message_code_from_u8_rejects_unknown_values() {
        assert_eq!(MessageCode::from_u8(11), None);
        assert_eq!(MessageCode::from_u8(0xFF), None);
    }

    #[test]
    fn message_code_from_str_parses_known_names() {
        for &code in MessageCode::all() {
            let parsed: MessageCode = code.name().parse().expect("known name");
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn message_code_from_str_rejects_unknown_names() {
        let err = "MSG_SOMETHING_ELSE".parse::<MessageCode>().unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::UnknownMessageName("MSG_SOMETHING_ELSE".to_string())
        );
    }

    #[test]
    fn message_code_all_is_sorted_by_numeric_value() {
        for window in MessageCode::all().windows(2) {
            assert!(window[0].as_u8() < window[1].as_u8());
        }
    }

    #[test]
    fn message_codes_are_hashable() {
        let mut set = HashSet::new();
        assert!(set.insert(MessageCode::Data));
        assert!(set.contains(&MessageCode::Data));
        assert!(!set.insert(MessageCode::Data));
    }

    #[test]
    fn logging_classification_matches_upstream_set() {
        const LOGGING_CODES: &[MessageCode] = &[
            MessageCode::ErrorXfer,
            MessageCode::Info,
            MessageCode::Error,
            MessageCode::Warning,
            MessageCode::ErrorSocket,
            MessageCode::Log,
            MessageCode::Client,
            MessageCode::ErrorUtf8,
        ];

        for &code in MessageCode::all() {
            let expected = LOGGING_CODES.contains(&code);
            assert_eq!(code.is_logging(), expected, "mismatch for code {code:?}");
        }
    }
}
