//! Packet identifiers and the packets exchanged over a [`BusChannel`](crate::bus::BusChannel).

use bit_field::BitField;
use std::fmt;

/// USB packet identifier, stored as its on-the-wire byte: the PID in the low nibble and its
/// one's complement in the high nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pid {
    Out = 0xe1,
    In = 0x69,
    Sof = 0xa5,
    Setup = 0x2d,
    Data0 = 0xc3,
    Data1 = 0x4b,
    Data2 = 0x87,
    MData = 0x0f,
    Ack = 0xd2,
    Nak = 0x5a,
    Stall = 0x1e,
    Nyet = 0x96,
    Pre = 0x3c,
    Split = 0x78,
    Ping = 0xb4,
}

const ALL_PIDS: [Pid; 15] = [
    Pid::Out,
    Pid::In,
    Pid::Sof,
    Pid::Setup,
    Pid::Data0,
    Pid::Data1,
    Pid::Data2,
    Pid::MData,
    Pid::Ack,
    Pid::Nak,
    Pid::Stall,
    Pid::Nyet,
    Pid::Pre,
    Pid::Split,
    Pid::Ping,
];

impl Pid {
    /// Decodes a PID byte, rejecting bytes whose check nibble is not the complement.
    pub fn from_byte(byte: u8) -> Option<Pid> {
        if byte.get_bits(0..4) ^ byte.get_bits(4..8) != 0x0f {
            return None;
        }
        ALL_PIDS.iter().copied().find(|&pid| pid as u8 == byte)
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn is_token(self) -> bool {
        matches!(self, Pid::Out | Pid::In | Pid::Sof | Pid::Setup)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1 | Pid::Data2 | Pid::MData)
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, Pid::Ack | Pid::Nak | Pid::Stall | Pid::Nyet)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Pid::Out => "OUT",
            Pid::In => "IN",
            Pid::Sof => "SOF",
            Pid::Setup => "SETUP",
            Pid::Data0 => "DATA0",
            Pid::Data1 => "DATA1",
            Pid::Data2 => "DATA2",
            Pid::MData => "MDATA",
            Pid::Ack => "ACK",
            Pid::Nak => "NAK",
            Pid::Stall => "STALL",
            Pid::Nyet => "NYET",
            Pid::Pre => "PRE",
            Pid::Split => "SPLIT",
            Pid::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// DATA0/DATA1 alternation state of one endpoint direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    pub fn pid(self) -> Pid {
        match self {
            DataToggle::Data0 => Pid::Data0,
            DataToggle::Data1 => Pid::Data1,
        }
    }

    pub fn flip(&mut self) {
        *self = match *self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        };
    }

    pub fn from_pid(pid: Pid) -> Option<Self> {
        match pid {
            Pid::Data0 => Some(DataToggle::Data0),
            Pid::Data1 => Some(DataToggle::Data1),
            _ => None,
        }
    }
}

impl Default for DataToggle {
    fn default() -> Self {
        DataToggle::Data0
    }
}

/// A packet received from the device: a handshake (no payload) or a data packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub pid: Pid,
    pub data: Option<Vec<u8>>,
}

impl Packet {
    pub fn handshake(pid: Pid) -> Self {
        Packet { pid, data: None }
    }

    pub fn data(toggle: DataToggle, payload: &[u8]) -> Self {
        Packet {
            pid: toggle.pid(),
            data: Some(payload.to_vec()),
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} [{} bytes]", self.pid, data.len()),
            None => write!(f, "{}", self.pid),
        }
    }
}
