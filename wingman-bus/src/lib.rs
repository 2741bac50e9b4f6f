//! wingman-bus: actuator bus for the wingman pan/tilt mount
//!
//! Speaks Protocol 2.0 over a half-duplex serial bus. The client is
//! transport-agnostic: a real serial port (feature `serial-transport`) or the
//! in-process [`SimulatedBus`].

pub mod error;
pub mod protocol;
pub mod transport;
pub mod client;
pub mod sim;

pub use error::{BusError, DeviceError};
pub use protocol::{table, Instruction, PacketReader, RawPacket, Register, BROADCAST_ID};
pub use transport::Transport;
#[cfg(feature = "serial-transport")]
pub use transport::SerialTransport;
pub use client::{BusClient, SyncWrite};
pub use sim::SimulatedBus;
