//! Byte-for-byte checks of device responses against oracle bytes.

use crate::error::{ByteAt, TransactionError};
use std::fmt;

/// Offset of the first byte where the two buffers differ, counting a length difference as a
/// divergence at the end of the shorter one.
pub fn first_divergence(expected: &[u8], received: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(received)
        .position(|(e, r)| e != r)
        .or_else(|| {
            if expected.len() == received.len() {
                None
            } else {
                Some(expected.len().min(received.len()))
            }
        })
}

/// Checks a completed read against the bytes the oracle expects.
///
/// A read that is a strict prefix of `expected` is a [`TransactionError::ShortRead`]; any other
/// difference is a [`TransactionError::DataMismatch`] at the first diverging offset.
pub fn check_response(expected: &[u8], received: &[u8]) -> Result<(), TransactionError> {
    let offset = match first_divergence(expected, received) {
        None => return Ok(()),
        Some(offset) => offset,
    };
    if offset == received.len() {
        return Err(TransactionError::ShortRead {
            expected: expected.len(),
            received: received.len(),
        });
    }
    Err(TransactionError::DataMismatch {
        offset,
        expected: ByteAt(expected.get(offset).copied()),
        received: ByteAt(received.get(offset).copied()),
    })
}

/// Hex rendering for log lines.
pub struct Hex<'a>(pub &'a [u8]);

impl<'a> fmt::Display for Hex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
