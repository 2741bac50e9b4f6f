//! Blocking actuator bus client.
//!
//! Every transaction is bounded by the client's deadline. Goal positions go
//! out as one sync write per cycle and present positions come back through one
//! sync read, so a cycle never costs more than two round trips.

use crate::error::{BusError, DeviceError};
use crate::protocol::{
    decode_i32, read_params, table, write_params, Instruction, PacketReader, RawPacket, Register,
    BROADCAST_ID,
};
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wingman_core::{AxisConfig, GoalPosition, OperatingMode, PidGains};

/// Idle wait between polls of an empty transport
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Encode a register value at the register's width
pub fn encode_value(register: Register, value: i32) -> Result<Vec<u8>, BusError> {
    let out_of_range = || {
        BusError::InvalidRequest(format!(
            "value {} does not fit register {} ({} bytes)",
            value, register.address, register.width
        ))
    };
    match register.width {
        1 => Ok(vec![u8::try_from(value).map_err(|_| out_of_range())?]),
        2 => Ok(u16::try_from(value)
            .map_err(|_| out_of_range())?
            .to_le_bytes()
            .to_vec()),
        4 => Ok(value.to_le_bytes().to_vec()),
        _ => Err(out_of_range()),
    }
}

/// One register written to several actuators in a single packet
#[derive(Debug, Clone)]
pub struct SyncWrite {
    register: Register,
    entries: Vec<(u8, Vec<u8>)>,
}

impl SyncWrite {
    pub fn new(register: Register) -> Self {
        Self {
            register,
            entries: Vec::new(),
        }
    }

    /// Add a value for one actuator; each id may appear once
    pub fn add(&mut self, id: u8, value: i32) -> Result<(), BusError> {
        if self.entries.iter().any(|(existing, _)| *existing == id) {
            return Err(BusError::InvalidRequest(format!(
                "actuator {} appears twice in one sync write",
                id
            )));
        }
        self.entries.push((id, encode_value(self.register, value)?));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn to_packet(&self) -> RawPacket {
        let mut params = read_params(self.register);
        for (id, data) in &self.entries {
            params.push(*id);
            params.extend_from_slice(data);
        }
        RawPacket::new(BROADCAST_ID, Instruction::SyncWrite, params)
    }
}

pub struct BusClient<T: Transport> {
    transport: T,
    reader: PacketReader,
    timeout: Duration,
}

impl<T: Transport> BusClient<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        info!(
            "Bus client on {} with {:?} transaction deadline",
            transport.name(),
            timeout
        );
        Self {
            transport,
            reader: PacketReader::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, packet: &RawPacket) -> Result<(), BusError> {
        let bytes = packet.encode()?;
        self.transport.clear_input()?;
        self.reader.clear();
        self.transport.write_all(&bytes)
    }

    /// Wait for the next status packet from `id`
    fn receive_status(&mut self, id: u8, deadline: Instant) -> Result<Vec<u8>, BusError> {
        let mut buf = [0u8; 256];
        loop {
            loop {
                match self.reader.next_packet() {
                    Ok(Some(packet)) if packet.id == id => {
                        let (error, params) = packet.as_status()?;
                        check_status(id, error)?;
                        return Ok(params.to_vec());
                    }
                    Ok(Some(packet)) => {
                        debug!("Ignoring packet from {} while waiting for {}", packet.id, id)
                    }
                    Ok(None) => break,
                    Err(e) => debug!("Dropping corrupt bus data: {}", e),
                }
            }

            if Instant::now() >= deadline {
                return Err(BusError::Timeout {
                    after: self.timeout,
                    waiting_for: format!("status from actuator {}", id),
                });
            }

            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                self.reader.push(&buf[..n]);
            }
        }
    }

    fn transact(&mut self, packet: RawPacket) -> Result<Vec<u8>, BusError> {
        if packet.id == BROADCAST_ID {
            return Err(BusError::InvalidRequest(
                "broadcast has no single status".to_string(),
            ));
        }
        self.send(&packet)?;
        let deadline = Instant::now() + self.timeout;
        self.receive_status(packet.id, deadline)
    }

    /// Ping an actuator, returning its model number
    pub fn ping(&mut self, id: u8) -> Result<u16, BusError> {
        let params = self.transact(RawPacket::new(id, Instruction::Ping, Vec::new()))?;
        if params.len() < 2 {
            return Err(BusError::Malformed(format!(
                "ping reply from {} has {} parameter bytes",
                id,
                params.len()
            )));
        }
        Ok(u16::from_le_bytes([params[0], params[1]]))
    }

    pub fn read(&mut self, id: u8, register: Register) -> Result<i32, BusError> {
        let data = self.transact(RawPacket::new(id, Instruction::Read, read_params(register)))?;
        if data.len() != register.width as usize {
            return Err(BusError::Malformed(format!(
                "expected {} bytes from register {} of {}, got {}",
                register.width,
                register.address,
                id,
                data.len()
            )));
        }
        decode_i32(&data)
    }

    pub fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<(), BusError> {
        self.transact(RawPacket::new(id, Instruction::Write, write_params(address, data)))?;
        Ok(())
    }

    pub fn write_register(&mut self, id: u8, register: Register, value: i32) -> Result<(), BusError> {
        let data = encode_value(register, value)?;
        self.write(id, register.address, &data)
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<(), BusError> {
        debug!(id, enabled, "torque");
        self.write_register(id, table::TORQUE_ENABLE, enabled as i32)
    }

    /// Torque must be off; the mode register is locked otherwise
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<(), BusError> {
        self.write_register(id, table::OPERATING_MODE, mode.register_value() as i32)
    }

    pub fn set_speed(&mut self, id: u8, speed: u32) -> Result<(), BusError> {
        let value = i32::try_from(speed)
            .map_err(|_| BusError::InvalidRequest(format!("speed {} out of range", speed)))?;
        self.write_register(id, table::GOAL_SPEED, value)
    }

    /// Write D, I and P gains in one transaction
    pub fn set_pid_gains(&mut self, id: u8, gains: PidGains) -> Result<(), BusError> {
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&gains.kd.to_le_bytes());
        data.extend_from_slice(&gains.ki.to_le_bytes());
        data.extend_from_slice(&gains.kp.to_le_bytes());
        self.write(id, table::POSITION_D_GAIN.address, &data)
    }

    pub fn set_goal_current(&mut self, id: u8, current: u16) -> Result<(), BusError> {
        self.write_register(id, table::GOAL_CURRENT, current as i32)
    }

    /// Write mode, speed, optional gains and current limit, then enable torque.
    ///
    /// Every step is attempted; the failures are returned in order.
    pub fn configure_axis(&mut self, axis: &AxisConfig, speed: u32) -> Vec<(&'static str, BusError)> {
        let id = axis.id;
        let mut failures = Vec::new();
        let mut record = |what: &'static str, result: Result<(), BusError>| {
            if let Err(e) = result {
                failures.push((what, e));
            }
        };

        // Mode and limits are locked while torque is on
        record("disable torque", self.set_torque(id, false));
        record("set operating mode", self.set_operating_mode(id, axis.operating_mode));
        record("set speed", self.set_speed(id, speed));
        if let Some(gains) = axis.pid_gains {
            record("set PID gains", self.set_pid_gains(id, gains));
        }
        if let Some(current) = axis.goal_current {
            record("set goal current", self.set_goal_current(id, current));
        }
        record("enable torque", self.set_torque(id, true));
        failures
    }

    /// Command goal positions with one sync write. Broadcast packets carry
    /// no status, so success only means the packet left the host.
    pub fn set_goal_positions(&mut self, goals: &[GoalPosition]) -> Result<(), BusError> {
        let mut sync = SyncWrite::new(table::GOAL_POSITION);
        for goal in goals {
            sync.add(goal.axis_id(), goal.value())?;
        }
        if sync.is_empty() {
            return Ok(());
        }
        self.send(&sync.to_packet())
    }

    /// Read present positions of `ids` with one sync read
    pub fn get_present_positions(&mut self, ids: &[u8]) -> Result<BTreeMap<u8, i32>, BusError> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let register = table::PRESENT_POSITION;
        let mut params = read_params(register);
        params.extend_from_slice(ids);
        self.send(&RawPacket::new(BROADCAST_ID, Instruction::SyncRead, params))?;

        let deadline = Instant::now() + self.timeout;
        let mut positions = BTreeMap::new();
        for &id in ids {
            let data = self.receive_status(id, deadline)?;
            if data.len() != register.width as usize {
                return Err(BusError::Malformed(format!(
                    "present position of {} has {} bytes",
                    id,
                    data.len()
                )));
            }
            positions.insert(id, decode_i32(&data)?);
        }
        Ok(positions)
    }
}

fn check_status(id: u8, error: u8) -> Result<(), BusError> {
    if let Some(error) = DeviceError::from_status(error) {
        return Err(BusError::Protocol { id, error });
    }
    if error & DeviceError::ALERT_BIT != 0 {
        warn!(id, "actuator reports a hardware alert");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_value_widths() {
        assert_eq!(encode_value(table::TORQUE_ENABLE, 1).unwrap(), vec![1]);
        assert_eq!(encode_value(table::GOAL_CURRENT, 300).unwrap(), vec![0x2C, 0x01]);
        assert_eq!(
            encode_value(table::GOAL_POSITION, -1).unwrap(),
            vec![0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert!(encode_value(table::TORQUE_ENABLE, 256).is_err());
        assert!(encode_value(table::GOAL_CURRENT, -1).is_err());
    }

    #[test]
    fn test_sync_write_rejects_duplicate_ids() {
        let mut sync = SyncWrite::new(table::GOAL_POSITION);
        sync.add(1, 100).unwrap();
        assert!(matches!(sync.add(1, 200), Err(BusError::InvalidRequest(_))));
        assert_eq!(sync.len(), 1);
    }

    #[test]
    fn test_sync_write_packet_layout() {
        let mut sync = SyncWrite::new(table::GOAL_POSITION);
        sync.add(1, 2048).unwrap();
        sync.add(2, 1100).unwrap();
        let packet = sync.to_packet();
        assert_eq!(packet.id, BROADCAST_ID);
        assert_eq!(
            packet.payload,
            vec![116, 0, 4, 0, 1, 0x00, 0x08, 0, 0, 2, 0x4C, 0x04, 0, 0]
        );
    }

    #[test]
    fn test_check_status_alert_only_is_ok() {
        assert!(check_status(1, 0x80).is_ok());
        assert!(matches!(
            check_status(1, 0x86),
            Err(BusError::Protocol { id: 1, error: DeviceError::DataLimit })
        ));
    }
}
