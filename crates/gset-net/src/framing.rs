//! Message framing for the stdio transport
//!
//! Envelopes travel as newline-delimited JSON: one object per line, no
//! embedded newlines. A line that fails to parse is surfaced as an item
//! rather than a stream error, so one bad message never ends the stream.

use bytes::{Buf, BufMut, BytesMut};
use gset_core::Envelope;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum line size (16 MB)
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Line too large: {0} bytes")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A complete line that is not a valid envelope. `request` holds a
    /// stand-in for the sender's request when enough of it could be read.
    #[error("Malformed message: {source}")]
    Malformed {
        source: gset_core::Error,
        request: Option<Box<Envelope>>,
    },
}

/// Result of decoding one line: an envelope, or the reason it was rejected
pub type DecodedLine = Result<Envelope, FrameError>;

/// Codec for newline-delimited JSON envelopes
///
/// Wire format:
/// - N bytes: UTF-8 JSON object
/// - 1 byte: `\n`
///
/// A line longer than the limit is reported once as [`FrameError::TooLarge`]
/// and its remaining bytes are skipped up to the next newline.
#[derive(Debug)]
pub struct EnvelopeCodec {
    /// Bytes already scanned for a newline
    scanned: usize,
    /// Skipping the tail of an oversized line
    discarding: bool,
    max_line: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            scanned: 0,
            discarding: false,
            max_line,
        }
    }

    fn parse_line(raw: &[u8]) -> DecodedLine {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        Envelope::parse(line).map_err(|source| FrameError::Malformed {
            source,
            request: Envelope::salvage(line).map(Box::new),
        })
    }
}

impl Decoder for EnvelopeCodec {
    type Item = DecodedLine;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

            if self.discarding {
                self.scanned = 0;
                match newline {
                    Some(offset) => {
                        src.advance(offset + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(offset) = newline else {
                if src.len() > self.max_line {
                    let seen = src.len();
                    src.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Ok(Some(Err(FrameError::TooLarge(seen))));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let line = src.split_to(end + 1);
            if end > self.max_line {
                return Ok(Some(Err(FrameError::TooLarge(end))));
            }
            let raw = &line[..end];

            // blank lines carry nothing
            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Ok(Some(Self::parse_line(raw)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.scanned = 0;
        self.discarding = false;
        if src.iter().all(|b| b.is_ascii_whitespace()) {
            src.clear();
            return Ok(None);
        }
        let line = src.split_to(src.len());
        Ok(Some(Self::parse_line(&line)))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| FrameError::Serialization(e.to_string()))?;
        if json.len() + 1 > self.max_line {
            return Err(FrameError::TooLarge(json.len() + 1));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gset_core::{Body, Payload, Value};

    fn read_request() -> Envelope {
        Envelope::new("c1".into(), "n1".into(), Body::request(1, Payload::Read))
    }

    #[test]
    fn test_line_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let env = read_request();

        let mut buf = BytesMut::new();
        codec.encode(env.clone(), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"src":"c1","dest":"n1","#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#""body":{"type":"read","msg_id":1}}"#);
        buf.extend_from_slice(b"\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded.payload(), &Payload::Read);
    }

    #[test]
    fn test_malformed_line_does_not_poison_stream() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{oops}\n\n");
        buf.extend_from_slice(
            br#"{"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":2,"message":4}}"#,
        );
        buf.extend_from_slice(b"\n");

        assert!(codec.decode(&mut buf).unwrap().unwrap().is_err());
        let next = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(next.payload(), &Payload::broadcast(Value(4)));
    }

    #[test]
    fn test_eof_without_newline() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"src":"c1","dest":"n1","body":{"type":"read"}}"#[..]);
        let decoded = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded.payload(), &Payload::Read);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut codec = EnvelopeCodec::with_max_line(64);
        let mut buf = BytesMut::from(&[b'x'; 100][..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(Err(FrameError::TooLarge(100))))
        ));
        assert!(buf.is_empty());

        // the rest of the long line arrives, then a good one
        buf.extend_from_slice(&[b'x'; 30]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"xx\n");
        buf.extend_from_slice(br#"{"src":"c1","dest":"n1","body":{"type":"read"}}"#);
        buf.extend_from_slice(b"\n");

        let next = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(next.payload(), &Payload::Read);
    }

    #[test]
    fn test_complete_oversized_line() {
        let mut codec = EnvelopeCodec::with_max_line(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'y'; 40]);
        buf.extend_from_slice(b"\n{}\n");

        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(Err(FrameError::TooLarge(40))))
        ));
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(Err(FrameError::Malformed { request: None, .. })))
        ));
    }
}
