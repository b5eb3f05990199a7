//! Filename and message text codecs.
//!
//! Path names travel the wire as raw byte strings; the session's negotiated
//! charset (UTF-8 unless `--charset` overrides it) decides how they map to
//! local strings. Strict codecs fail on unrepresentable text; replacement
//! codecs substitute and carry on, which is what user-facing listings want.

use encoding_rs::{Encoding, UTF_8};

use crate::error::ProtocolError;

/// Conversion mode between wire bytes and strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Unrepresentable text is an error.
    Strict,
    /// Unrepresentable text is replaced (U+FFFD / `?`).
    Replacing,
}

/// Byte/string codec over a named charset.
#[derive(Clone, Copy, Debug)]
pub struct TextCodec {
    encoding: &'static Encoding,
    mode: Mode,
}

impl TextCodec {
    /// Strict UTF-8 codec, the protocol default.
    #[must_use]
    pub const fn utf8() -> Self {
        Self {
            encoding: UTF_8,
            mode: Mode::Strict,
        }
    }

    /// Strict codec for a charset label, `None` if the label is unknown.
    #[must_use]
    pub fn strict(label: &str) -> Option<Self> {
        Encoding::for_label(label.as_bytes()).map(|encoding| Self {
            encoding,
            mode: Mode::Strict,
        })
    }

    /// Replacement-mode codec for a charset label.
    #[must_use]
    pub fn replacing(label: &str) -> Option<Self> {
        Encoding::for_label(label.as_bytes()).map(|encoding| Self {
            encoding,
            mode: Mode::Replacing,
        })
    }

    /// Replacement-mode variant of this codec.
    #[must_use]
    pub const fn into_replacing(self) -> Self {
        Self {
            encoding: self.encoding,
            mode: Mode::Replacing,
        }
    }

    /// Canonical name of the charset.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encodes a string into wire bytes.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, ProtocolError> {
        let (bytes, _, had_errors) = self.encoding.encode(text);
        if had_errors && self.mode == Mode::Strict {
            return Err(ProtocolError::Charset {
                charset: self.name(),
            });
        }
        Ok(bytes.into_owned())
    }

    /// Decodes wire bytes into a string.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        match self.mode {
            Mode::Strict => self
                .encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(std::borrow::Cow::into_owned)
                .ok_or(ProtocolError::Charset {
                    charset: self.name(),
                }),
            Mode::Replacing => {
                let (text, _) = self.encoding.decode_without_bom_handling(bytes);
                Ok(text.into_owned())
            }
        }
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::utf8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_round_trips() {
        let codec = TextCodec::utf8();
        let bytes = codec.encode("héllo").expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), "héllo");
    }

    #[test]
    fn strict_utf8_rejects_invalid_bytes() {
        let codec = TextCodec::utf8();
        assert!(codec.decode(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn replacing_utf8_substitutes_invalid_bytes() {
        let codec = TextCodec::utf8().into_replacing();
        let text = codec.decode(&[b'a', 0xFF, b'b']).expect("decode");
        assert_eq!(text, "a\u{FFFD}b");
    }

    #[test]
    fn strict_latin1_rejects_unmappable_text() {
        let codec = TextCodec::strict("iso-8859-1").expect("known label");
        // ISO-8859-1 (windows-1252 in the encoding standard) cannot carry
        // CJK text.
        assert!(codec.encode("\u{4E16}\u{754C}").is_err());
    }

    #[test]
    fn unknown_labels_are_rejected() {
        assert!(TextCodec::strict("ebcdic-37").is_none());
    }
}
