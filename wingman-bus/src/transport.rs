//! Byte transports underneath the bus client

use crate::error::BusError;

/// A half-duplex byte link to the actuator bus.
///
/// `read` must not block for longer than a few milliseconds; the client
/// enforces the transaction deadline by polling.
pub trait Transport: Send {
    /// Human-readable transport name, used in logs
    fn name(&self) -> &str;

    /// Write a complete buffer
    fn write_all(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Read whatever is available into `buf`; `Ok(0)` means nothing arrived
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError>;

    /// Drop stale input left over from an earlier transaction
    fn clear_input(&mut self) -> Result<(), BusError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), BusError> {
        (**self).write_all(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        (**self).read(buf)
    }

    fn clear_input(&mut self) -> Result<(), BusError> {
        (**self).clear_input()
    }
}

#[cfg(feature = "serial-transport")]
pub use serial::SerialTransport;

#[cfg(feature = "serial-transport")]
mod serial {
    use super::Transport;
    use crate::error::BusError;
    use serialport::{ClearBuffer, SerialPort};
    use std::io::{ErrorKind, Read, Write};
    use std::time::Duration;
    use tracing::info;

    /// Poll interval of a single serial read
    const READ_TIMEOUT: Duration = Duration::from_millis(2);

    /// Serial port transport (USB-to-RS485 adapters and the like)
    pub struct SerialTransport {
        name: String,
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        pub fn open(path: &str, baudrate: u32) -> Result<Self, BusError> {
            let port = serialport::new(path, baudrate)
                .timeout(READ_TIMEOUT)
                .open()?;
            info!("Opened serial bus {} at {} baud", path, baudrate);
            Ok(Self {
                name: path.to_string(),
                port,
            })
        }
    }

    impl Transport for SerialTransport {
        fn name(&self) -> &str {
            &self.name
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), BusError> {
            self.port.write_all(data)?;
            self.port.flush()?;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(BusError::Io(e)),
            }
        }

        fn clear_input(&mut self) -> Result<(), BusError> {
            self.port.clear(ClearBuffer::Input)?;
            Ok(())
        }
    }
}
