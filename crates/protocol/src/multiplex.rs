//! Multiplex-aware channel halves.
//!
//! [`DemuxReader`] wraps the inbound byte stream: while multiplexing is
//! active it splits the stream into `DATA` chunks (surfaced through the
//! [`Read`] impl) and control messages (dispatched to the injected
//! [`MessageHandler`]). [`MuxWriter`] wraps the outbound stream, buffering
//! writes and framing them as `DATA` when its direction is multiplexed.
//!
//! Only one direction of a protocol-30 daemon connection is multiplexed
//! (server to client); both halves therefore start in plain mode and are
//! switched with [`DemuxReader::activate`] / [`MuxWriter::activate`] once
//! the handshake has fixed the direction's framing.

use std::io::{self, Read, Write};

use crate::envelope::{HEADER_LEN, MAX_PAYLOAD_LENGTH, MessageCode, MessageHeader};
use crate::error::ProtocolError;

/// Outbound buffer size; a full buffer is flushed as one `DATA` frame.
const WRITE_BUFFER_LEN: usize = 16 * 1024;

/// Receives every non-`DATA` frame read off the wire.
///
/// Implementations surface the message (log it, collect statistics, queue a
/// redo) and may return an error to abort the session, which the reader
/// reports as an I/O failure to the blocked role loop.
pub trait MessageHandler: Send {
    /// Handles one control message.
    fn handle(&mut self, code: MessageCode, payload: &[u8]) -> Result<(), ProtocolError>;
}

/// Splits a text payload into lines without copying.
///
/// Control-message payloads may carry several newline-terminated lines in
/// one frame; handlers use this to surface them individually.
pub fn split_lines(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = payload;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match memchr::memchr(b'\n', rest) {
            Some(pos) => {
                let line = &rest[..pos];
                rest = &rest[pos + 1..];
                Some(line)
            }
            None => {
                let line = rest;
                rest = &[];
                Some(line)
            }
        }
    })
}

/// Multiplex-aware reading half of a connection.
pub struct DemuxReader<R> {
    inner: R,
    handler: Box<dyn MessageHandler>,
    /// Bytes left in the currently announced `DATA` chunk.
    remaining: u32,
    multiplexed: bool,
}

impl<R: Read> DemuxReader<R> {
    /// Wraps `inner` in plain (pass-through) mode.
    pub fn new(inner: R, handler: Box<dyn MessageHandler>) -> Self {
        Self {
            inner,
            handler,
            remaining: 0,
            multiplexed: false,
        }
    }

    /// Starts interpreting inbound bytes as multiplexed frames.
    pub fn activate(&mut self) {
        self.multiplexed = true;
    }

    /// True once [`activate`](Self::activate) has been called.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// Shared access to the wrapped stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Consumes the reader, returning the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Positions the reader at the start of the next `DATA` chunk,
    /// dispatching any control frames in between.
    ///
    /// Returns `false` on a clean end-of-stream at a frame boundary.
    fn advance_to_data(&mut self) -> io::Result<bool> {
        while self.remaining == 0 {
            let mut header = [0u8; HEADER_LEN];
            match read_exact_or_eof(&mut self.inner, &mut header)? {
                FrameStart::Eof => return Ok(false),
                FrameStart::Header => {}
            }

            let header = MessageHeader::decode(&header).map_err(io::Error::other)?;
            if header.code() == MessageCode::Data {
                self.remaining = header.payload_len();
                if header.payload_len() == 0 {
                    continue;
                }
                break;
            }

            let mut payload = vec![0u8; header.payload_len_usize()];
            self.inner.read_exact(&mut payload)?;
            self.handler
                .handle(header.code(), &payload)
                .map_err(io::Error::other)?;
        }
        Ok(true)
    }
}

impl<R: Read> Read for DemuxReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.multiplexed {
            return self.inner.read(buf);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.advance_to_data()? {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining as usize);
        let got = self.inner.read(&mut buf[..want])?;
        if got == 0 {
            // The peer announced a chunk it never delivered.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a data chunk",
            ));
        }
        self.remaining -= got as u32;
        Ok(got)
    }
}

enum FrameStart {
    Header,
    Eof,
}

/// Reads a full header, distinguishing clean EOF (no bytes at all) from a
/// truncated header (a protocol error).
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<FrameStart> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(FrameStart::Eof),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                ));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(FrameStart::Header)
}

/// Multiplex-aware writing half of a connection.
pub struct MuxWriter<W> {
    inner: W,
    buf: Vec<u8>,
    multiplexed: bool,
}

impl<W: Write> MuxWriter<W> {
    /// Wraps `inner` in plain (buffered pass-through) mode.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(WRITE_BUFFER_LEN),
            multiplexed: false,
        }
    }

    /// Starts framing buffered application bytes as `DATA`.
    ///
    /// Pending plain bytes are flushed first so handshake output never ends
    /// up inside a frame.
    pub fn activate(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.multiplexed = true;
        Ok(())
    }

    /// True once [`activate`](Self::activate) has been called.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// Shared access to the wrapped stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Sends a control message, flushing buffered data first so frame order
    /// matches write order.
    pub fn send_message(&mut self, code: MessageCode, payload: &[u8]) -> Result<(), ProtocolError> {
        debug_assert!(self.multiplexed, "control messages require multiplexing");
        self.flush_buffer()?;

        let header = MessageHeader::new(code, payload.len() as u32)?;
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Flushes the application-byte buffer without flushing the underlying
    /// stream.
    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.multiplexed {
            for chunk in self.buf.chunks(MAX_PAYLOAD_LENGTH as usize) {
                let header = MessageHeader::new(MessageCode::Data, chunk.len() as u32)
                    .map_err(io::Error::other)?;
                self.inner.write_all(&header.encode())?;
                self.inner.write_all(chunk)?;
            }
        } else {
            self.inner.write_all(&self.buf)?;
        }
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for MuxWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= WRITE_BUFFER_LEN {
            self.flush_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Arc<Mutex<Vec<(MessageCode, Vec<u8>)>>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&mut self, code: MessageCode, payload: &[u8]) -> Result<(), ProtocolError> {
            self.messages
                .lock()
                .expect("recorder lock")
                .push((code, payload.to_vec()));
            Ok(())
        }
    }

    fn frame(code: MessageCode, payload: &[u8]) -> Vec<u8> {
        let header = MessageHeader::new(code, payload.len() as u32).expect("constructible header");
        let mut bytes = Vec::from(header.encode());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn plain_mode_passes_bytes_through() {
        let mut reader = DemuxReader::new(&b"abc"[..], Box::new(Recorder::default()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"abc");
    }

    #[test]
    fn data_frames_surface_as_application_bytes() {
        let mut wire = frame(MessageCode::Data, b"hello ");
        wire.extend(frame(MessageCode::Data, b"world"));

        let mut reader = DemuxReader::new(wire.as_slice(), Box::new(Recorder::default()));
        reader.activate();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn control_frames_reach_the_handler_between_chunks() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let mut wire = frame(MessageCode::Data, b"ab");
        wire.extend(frame(MessageCode::Info, b"note\n"));
        wire.extend(frame(MessageCode::Data, b"cd"));

        let handler = Recorder {
            messages: Arc::clone(&messages),
        };
        let mut reader = DemuxReader::new(wire.as_slice(), Box::new(handler));
        reader.activate();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");

        assert_eq!(out, b"abcd");
        let seen = messages.lock().expect("recorder lock");
        assert_eq!(seen.as_slice(), &[(MessageCode::Info, b"note\n".to_vec())]);
    }

    #[test]
    fn zero_length_data_frames_are_skipped() {
        let mut wire = frame(MessageCode::Data, b"");
        wire.extend(frame(MessageCode::Data, b"xy"));

        let mut reader = DemuxReader::new(wire.as_slice(), Box::new(Recorder::default()));
        reader.activate();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"xy");
    }

    #[test]
    fn eof_inside_a_chunk_is_an_error() {
        let mut wire = frame(MessageCode::Data, b"abcdef");
        wire.truncate(wire.len() - 3);

        let mut reader = DemuxReader::new(wire.as_slice(), Box::new(Recorder::default()));
        reader.activate();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).expect_err("truncated chunk");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn eof_inside_a_header_is_an_error() {
        let wire = frame(MessageCode::Data, b"ab");
        let mut reader = DemuxReader::new(&wire[..2], Box::new(Recorder::default()));
        reader.activate();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).expect_err("truncated header");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_frames_buffered_bytes_on_flush() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.activate().expect("activate");
        writer.write_all(b"hello").expect("write");
        writer.flush().expect("flush");

        assert_eq!(writer.get_ref().as_slice(), frame(MessageCode::Data, b"hello"));
    }

    #[test]
    fn send_message_flushes_pending_data_first() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.activate().expect("activate");
        writer.write_all(b"data").expect("write");
        writer
            .send_message(MessageCode::Warning, b"careful\n")
            .expect("message");

        let mut expected = frame(MessageCode::Data, b"data");
        expected.extend(frame(MessageCode::Warning, b"careful\n"));
        assert_eq!(writer.get_ref().as_slice(), expected);
    }

    #[test]
    fn plain_writer_emits_raw_bytes() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.write_all(b"@RSYNCD: 30.0\n").expect("write");
        writer.flush().expect("flush");
        assert_eq!(writer.get_ref().as_slice(), b"@RSYNCD: 30.0\n");
    }

    #[test]
    fn activation_flushes_handshake_bytes_unframed() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.write_all(b"tail-of-handshake").expect("write");
        writer.activate().expect("activate");
        writer.write_all(b"framed").expect("write");
        writer.flush().expect("flush");

        let mut expected = b"tail-of-handshake".to_vec();
        expected.extend(frame(MessageCode::Data, b"framed"));
        assert_eq!(writer.get_ref().as_slice(), expected);
    }

    #[test]
    fn split_lines_handles_trailing_fragment() {
        let lines: Vec<&[u8]> = split_lines(b"one\ntwo\nthree").collect();
        assert_eq!(lines, [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()]);
    }

    #[test]
    fn handler_errors_abort_the_read() {
        struct Failing;
        impl MessageHandler for Failing {
            fn handle(&mut self, _: MessageCode, _: &[u8]) -> Result<(), ProtocolError> {
                Err(ProtocolError::Varint("boom"))
            }
        }

        let wire = frame(MessageCode::Error, b"fatal\n");
        let mut reader = DemuxReader::new(wire.as_slice(), Box::new(Failing));
        reader.activate();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
