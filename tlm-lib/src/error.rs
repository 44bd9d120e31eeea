use crate::spacepacket::Apid;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Bytes do not form a valid 6-byte primary header.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The header declares more packet data than the buffer holds.
    ///
    /// Retryable at the stream level; the caller should wait for more bytes
    /// rather than drop any.
    #[error("truncated packet: header declares {declared} data bytes, {available} available")]
    TruncatedPacket { declared: usize, available: usize },

    /// A packet data field that does not match the header declaration.
    #[error("data field mismatch: header declares {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// No parameter definitions exist for an APID in strict mode.
    #[error("no parameter definitions for apid {0}")]
    UnknownApid(Apid),

    /// A defined field that does not fit within a packet's user data.
    #[error("field {name} needs {needed} bytes at offset {offset}, user data is {available}")]
    ShortUserData {
        name: String,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A raw value that cannot be coerced to a number for calibration.
    #[error("raw value for {0} is not numeric")]
    CalibrationTypeMismatch(String),

    /// A parameter or calibration definition that can never be applied.
    #[error("invalid definition for {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// External sink failure writing a batch.
    #[error("sink: {0}")]
    Sink(String),

    #[error("invalid timecode config: {0}")]
    TimecodeConfig(String),

    #[error("not enough bytes: got {actual}, need {minimum}")]
    NotEnoughData { actual: usize, minimum: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
