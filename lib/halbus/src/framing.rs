//! Incremental extraction of complete JSON values from a TCP byte stream.
//!
//! The transport delivers arbitrary chunks: one buffer may hold several
//! envelopes glued together (with or without separating whitespace), or only
//! the front half of one. The framer yields every complete value and retains
//! the unfinished tail for the next feed. It performs no I/O.

use serde_json::{Deserializer, Value};

use crate::shared::HalError;

/// Upper bound on bytes retained while waiting for the rest of a split
/// frame. A peer that exceeds it is not speaking this protocol.
const MAX_RESIDUAL: usize = 64 * 1024;

/// One complete JSON value, together with its exact bytes on the wire.
#[derive(Debug)]
pub struct Frame {
    pub value: Value,
    pub raw: Vec<u8>,
}

#[derive(Default)]
pub struct Framer {
    residual: Vec<u8>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer { residual: Vec::new() }
    }

    /// Bytes held over from a previous feed.
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    /// Feeds one received buffer and returns the values completed by it.
    ///
    /// A hard parse error reports the byte offset and offending byte; the
    /// remainder of the buffer is dropped and the framer resynchronises on
    /// the next feed. Values parsed before the error are still returned.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Frame>, Option<HalError>) {
        let mut buf = std::mem::replace(&mut self.residual, Vec::new());
        buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        let mut stream = Deserializer::from_slice(&buf).into_iter::<Value>();

        loop {
            match stream.next() {
                None => return (frames, None),
                Some(Ok(value)) => {
                    let end = stream.byte_offset();
                    let start = consumed + leading_whitespace(&buf[consumed..end]);
                    frames.push(Frame {
                        value,
                        raw: buf[start..end].to_vec(),
                    });
                    consumed = end;
                }
                Some(Err(ref err)) if err.is_eof() => {
                    let tail = &buf[consumed..];
                    if tail.len() > MAX_RESIDUAL {
                        let offset = consumed;
                        return (
                            frames,
                            Some(HalError::Parse {
                                offset,
                                byte: buf.get(offset).copied(),
                            }),
                        );
                    }
                    self.residual = tail.to_vec();
                    return (frames, None);
                }
                Some(Err(err)) => {
                    let offset = error_offset(&buf, err.line(), err.column());
                    return (
                        frames,
                        Some(HalError::Parse {
                            offset,
                            byte: buf.get(offset).copied(),
                        }),
                    );
                }
            }
        }
    }
}

fn leading_whitespace(slice: &[u8]) -> usize {
    slice.iter().take_while(|byte| byte.is_ascii_whitespace()).count()
}

/// Translates serde's line/column (1-based, relative to the fed buffer) back
/// to a byte offset.
fn error_offset(buf: &[u8], line: usize, column: usize) -> usize {
    let mut start = 0;
    let mut remaining = line.saturating_sub(1);
    if remaining > 0 {
        for (index, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    start = index + 1;
                    break;
                }
            }
        }
    }
    let offset = start + column.saturating_sub(1);
    offset.min(buf.len().saturating_sub(1))
}
