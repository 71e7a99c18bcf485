//! The transport seam between the transaction engine and the simulated link.

use crate::packet::{Packet, Pid};
use async_trait::async_trait;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// A point on the simulated timeline, in nanoseconds since simulation start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: SimTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    duration.as_secs() * 1_000_000_000 + u64::from(duration.subsec_nanos())
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_add(duration_nanos(rhs)))
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.since(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}us", self.0 / 1000, self.0 % 1000)
    }
}

/// Packet-level access to the simulated link.
///
/// Every operation is a discrete bus event that consumes simulated time; implementations may
/// suspend the caller until the transport has completed it. There is exactly one driver per
/// channel, so the trait is not `Send`.
#[async_trait(?Send)]
pub trait BusChannel {
    /// Current simulated time.
    fn now(&self) -> SimTime;

    /// Drives SE0 reset signaling for `duration`.
    async fn drive_reset(&mut self, duration: Duration);

    /// Asserts device presence (pull-up) on the bus.
    async fn connect(&mut self);

    /// Broadcasts a start-of-frame token.
    async fn send_sof(&mut self, frame_number: u16);

    async fn send_token(&mut self, pid: Pid, address: u8, endpoint: u8);

    async fn send_data(&mut self, pid: Pid, bytes: &[u8]);

    async fn send_handshake(&mut self, pid: Pid);

    /// Waits for the device's reply; `None` when the bus turnaround timer expires first.
    async fn receive_packet(&mut self) -> Option<Packet>;

    /// Lets the bus idle for `duration`.
    async fn advance_time(&mut self, duration: Duration);
}
