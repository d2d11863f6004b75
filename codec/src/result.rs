//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

/// Result Type for Codec Operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Represents possible errors that can occur while encoding or decoding packets.
///
/// Every variant describes malformed or truncated input. The codec never substitutes
/// a default value for data it could not read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A pop operation needed more bytes than the packet had left.
    #[error("Insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData {
        /// Number of bytes required
        needed: usize,
        /// Number of bytes available
        available: usize,
    },

    /// A compact index decoded to a magnitude that does not fit an `i32`.
    #[error("Compact index overflows a 32-bit integer")]
    CompactIndexOverflow,

    /// A string began with an indicator byte outside the known layouts.
    #[error("Invalid string indicator 0x{0:02X}")]
    InvalidStringIndicator(u8),

    /// A terminated string ran to the end of the buffer without a terminator.
    #[error("String terminator not found")]
    MissingTerminator,

    /// A wide string contained unpaired surrogates.
    #[error("Invalid UTF-16 in wide string")]
    InvalidUtf16,

    /// A length or element count was negative.
    #[error("Negative length {0}")]
    NegativeLength(i32),

    /// A field held a value outside its permitted domain.
    #[error("Invalid value {value} for field {field}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// The value that was read
        value: i64,
    },

    /// A message decoded completely but bytes were left over.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A stream frame declared a length of zero.
    #[error("Empty frame")]
    EmptyFrame,

    /// A stream frame exceeded the configured maximum length.
    #[error("Frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// An I/O error occurred while reading from or writing to the underlying stream.
    #[error("I/O error during {operation}: {kind:?}")]
    IOError {
        /// The kind of I/O error that occurred
        kind: std::io::ErrorKind,
        /// Description of the operation that failed
        operation: String,
    },
}

impl CodecError {
    /// Returns `true` when the error was caused by running out of input.
    pub fn is_truncation(&self) -> bool {
        matches!(
            self,
            CodecError::InsufficientData { .. } | CodecError::MissingTerminator
        )
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::IOError {
            kind: err.kind(),
            operation: err.to_string(),
        }
    }
}
