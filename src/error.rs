use crate::bus::SimTime;
use crate::packet::Pid;
use failure::Fail;
use std::fmt;

/// A byte at some offset of a transfer, or the end of the data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteAt(pub Option<u8>);

impl fmt::Display for ByteAt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(byte) => write!(f, "0x{:02x}", byte),
            None => f.write_str("end of data"),
        }
    }
}

/// Ways a transaction can break protocol order or framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    DataToggle { endpoint: u8, expected: Pid, received: Pid },
    StatusBeforeDataComplete { remaining: u16 },
    SetupMidTransaction,
    NoControlTransfer { endpoint: u8 },
    OutOfOrder { expected: &'static str },
    OversizedPacket { endpoint: u8, length: usize, max_packet_size: u16 },
    PayloadLength { payload: usize, w_length: u16 },
    DataInsteadOfHandshake { received: Pid },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Violation::DataToggle {
                endpoint,
                expected,
                received,
            } => write!(
                f,
                "endpoint {} sent {} where {} was due",
                endpoint, received, expected
            ),
            Violation::StatusBeforeDataComplete { remaining } => write!(
                f,
                "status stage attempted with {} data bytes outstanding",
                remaining
            ),
            Violation::SetupMidTransaction => {
                f.write_str("SETUP issued while a control transfer is in progress")
            }
            Violation::NoControlTransfer { endpoint } => write!(
                f,
                "data phase on endpoint {} without a preceding SETUP",
                endpoint
            ),
            Violation::OutOfOrder { expected } => {
                write!(f, "control pipe expects {} next", expected)
            }
            Violation::OversizedPacket {
                endpoint,
                length,
                max_packet_size,
            } => write!(
                f,
                "endpoint {} sent {} bytes, max packet size is {}",
                endpoint, length, max_packet_size
            ),
            Violation::PayloadLength { payload, w_length } => write!(
                f,
                "payload of {} bytes does not match wLength {}",
                payload, w_length
            ),
            Violation::DataInsteadOfHandshake { received } => {
                write!(f, "received {} where a handshake was required", received)
            }
        }
    }
}

/// Failure of a single logical USB transaction.
#[derive(Debug, Fail)]
pub enum TransactionError {
    #[fail(
        display = "timed out waiting for {} on endpoint {} (deadline {})",
        waiting_for, endpoint, deadline
    )]
    Timeout {
        waiting_for: &'static str,
        endpoint: u8,
        deadline: SimTime,
    },

    #[fail(
        display = "endpoint {} answered {} where {} was required",
        endpoint, received, expected
    )]
    UnexpectedHandshake {
        endpoint: u8,
        expected: Pid,
        received: Pid,
    },

    #[fail(
        display = "data mismatch at offset {}: expected {}, received {}",
        offset, expected, received
    )]
    DataMismatch {
        offset: usize,
        expected: ByteAt,
        received: ByteAt,
    },

    #[fail(display = "protocol violation: {}", _0)]
    ProtocolViolation(Violation),

    #[fail(
        display = "short read: {} of {} expected bytes received",
        received, expected
    )]
    ShortRead { expected: usize, received: usize },
}

impl From<Violation> for TransactionError {
    fn from(violation: Violation) -> Self {
        TransactionError::ProtocolViolation(violation)
    }
}
