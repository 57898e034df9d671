use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

/// First value minted by a sequence counter, and the value it wraps back to.
pub const SEQ_START: u32 = 100;

/// Largest value a sequence counter reaches before wrapping.
pub const SEQ_MAX: u32 = i32::max_value() as u32;

/// Size of a single transport read.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

pub type HalResult<T> = Result<T, HalError>;

#[derive(Debug, PartialEq)]
pub enum HalError {
    InvalidArgument(&'static str),
    Config(String),
    Transport(io::ErrorKind),
    Parse { offset: usize, byte: Option<u8> },
    Timeout,
    NotFound,
    SchemaViolation,
    AlreadyRegistered(String),
    EventAckFailed,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HalError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            HalError::Config(detail) => write!(f, "configuration error: {}", detail),
            HalError::Transport(kind) => write!(f, "transport error: {:?}", kind),
            HalError::Parse { offset, byte } => match byte {
                Some(byte) => write!(f, "parse error at offset {} ({:?})", offset, char::from(*byte)),
                None => write!(f, "parse error at offset {}", offset),
            },
            HalError::Timeout => write!(f, "timed out"),
            HalError::NotFound => write!(f, "not found"),
            HalError::SchemaViolation => write!(f, "reply rejected by schema"),
            HalError::AlreadyRegistered(action) => write!(f, "action already registered: {}", action),
            HalError::EventAckFailed => write!(f, "subscriber rejected the event"),
        }
    }
}

impl std::error::Error for HalError {}

impl From<io::Error> for HalError {
    #[inline]
    fn from(err: io::Error) -> Self {
        HalError::Transport(err.kind())
    }
}

/// Advances a sequence counter, wrapping back to `SEQ_START` past `SEQ_MAX`.
///
/// Identifiers only need to be unique among overlapping requests, so reuse
/// after a wrap is permitted.
pub fn next_seq(counter: &AtomicU32) -> u32 {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = if current >= SEQ_MAX { SEQ_START } else { current + 1 };
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

/// Writes the entire buffer, retrying on interruption. Any other failed
/// write fails the message; the connection itself is left alone.
pub(crate) fn send_all<W: io::Write>(writer: &mut W, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match writer.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(count) => bytes = &bytes[count..],
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
