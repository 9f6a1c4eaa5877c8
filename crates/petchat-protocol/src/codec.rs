//! Framing for worker stdout.
//!
//! Workers are expected to write one JSON object per line, but real workers
//! also print banners, progress text and occasionally pretty-printed objects
//! spread over several lines. The codec yields every complete JSON object it
//! can find and drops everything else, one line at a time.

use std::io;

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use serde_json::Value;
use tokio_util::codec::Decoder;

/// Largest object the codec will buffer before giving up on it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Longest excerpt of discarded output written to the log.
const LOG_EXCERPT_CHARS: usize = 200;

/// Decoder that turns a worker's stdout byte stream into JSON objects.
///
/// Decoding never fails: unparseable input is logged and skipped so a noisy
/// worker cannot terminate the reader.
#[derive(Debug, Clone)]
pub struct JsonObjectCodec {
    max_length: usize,
    /// Set after an oversized object was dropped; input is skipped until the
    /// next newline.
    discarding: bool,
}

impl JsonObjectCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Drop input through the next newline. Returns false if no newline is
    /// buffered yet.
    fn skip_line(src: &mut BytesMut) -> bool {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                log_discarded(&line);
                true
            }
            None => false,
        }
    }

    fn overflow(&mut self, src: &mut BytesMut) {
        warn!(
            "Worker output exceeded {} bytes without a complete JSON object, discarding",
            self.max_length
        );
        src.clear();
        self.discarding = true;
    }
}

impl Default for JsonObjectCodec {
    fn default() -> Self {
        Self::new()
    }
}

enum Scan {
    Object(Value, usize),
    Incomplete,
    Invalid(String),
}

fn scan(src: &[u8]) -> Scan {
    let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Scan::Object(value, stream.byte_offset()),
        Some(Err(err)) if err.is_eof() => Scan::Incomplete,
        Some(Err(err)) => Scan::Invalid(err.to_string()),
        None => Scan::Incomplete,
    }
}

fn log_discarded(bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let excerpt: String = text.chars().take(LOG_EXCERPT_CHARS).collect();
    debug!("Discarding non-JSON worker output: {}", excerpt);
}

impl Decoder for JsonObjectCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, io::Error> {
        loop {
            if self.discarding {
                if !Self::skip_line(src) {
                    src.clear();
                    return Ok(None);
                }
                self.discarding = false;
            }

            let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(leading);
            if src.is_empty() {
                return Ok(None);
            }

            if src[0] != b'{' {
                if Self::skip_line(src) {
                    continue;
                }
                if src.len() > self.max_length {
                    self.overflow(src);
                }
                return Ok(None);
            }

            match scan(src) {
                Scan::Object(value, consumed) => {
                    src.advance(consumed);
                    return Ok(Some(value));
                }
                Scan::Incomplete => {
                    if src.len() > self.max_length {
                        self.overflow(src);
                    }
                    return Ok(None);
                }
                Scan::Invalid(reason) => {
                    debug!("Malformed JSON from worker: {}", reason);
                    if Self::skip_line(src) {
                        continue;
                    }
                    if src.len() > self.max_length {
                        self.overflow(src);
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, io::Error> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if !src.is_empty() {
            log_discarded(src);
            src.clear();
        }
        self.discarding = false;
        Ok(None)
    }
}
