//! In-process actuator bus.
//!
//! [`SimulatedBus`] speaks the same wire protocol as the hardware, so the
//! client, the control loop and the CLI run unchanged against it. Every clone
//! shares one bus: hand one clone to the client and keep another to inspect
//! and perturb the servos.

use crate::error::{BusError, DeviceError};
use crate::protocol::{table, Instruction, PacketReader, RawPacket, Register, BROADCAST_ID};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

const TABLE_SIZE: usize = 256;
const SIM_MODEL_NUMBER: u16 = 311;
const SIM_FIRMWARE: u8 = 48;
/// Goal limits of single-turn position mode
const SINGLE_TURN_RANGE: (i32, i32) = (0, 4095);
/// Operating mode register value of single-turn position mode
const POSITION_MODE: u8 = 3;

struct SimServo {
    table: [u8; TABLE_SIZE],
    unresponsive: bool,
    fault: Option<DeviceError>,
}

impl SimServo {
    fn new() -> Self {
        let mut servo = Self {
            table: [0; TABLE_SIZE],
            unresponsive: false,
            fault: None,
        };
        servo.store(table::MODEL_NUMBER, SIM_MODEL_NUMBER as i32);
        servo.store(table::FIRMWARE_VERSION, SIM_FIRMWARE as i32);
        servo.store(table::OPERATING_MODE, POSITION_MODE as i32);
        servo
    }

    fn load(&self, register: Register) -> i32 {
        let start = register.address as usize;
        let bytes = &self.table[start..start + register.width as usize];
        match bytes.len() {
            1 => bytes[0] as i32,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            _ => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    fn store(&mut self, register: Register, value: i32) {
        let start = register.address as usize;
        let width = register.width as usize;
        let bytes = value.to_le_bytes();
        self.table[start..start + width].copy_from_slice(&bytes[..width]);
    }

    fn torque_enabled(&self) -> bool {
        self.load(table::TORQUE_ENABLE) != 0
    }

    fn read(&self, address: u16, length: u16) -> Result<Vec<u8>, DeviceError> {
        let start = address as usize;
        let end = start + length as usize;
        if end > TABLE_SIZE {
            return Err(DeviceError::DataRange);
        }
        Ok(self.table[start..end].to_vec())
    }

    /// Apply a write; returns the new goal position when one was accepted.
    fn write(&mut self, address: u16, data: &[u8]) -> Result<Option<i32>, DeviceError> {
        let start = address as usize;
        let end = start + data.len();
        if data.is_empty() || end > TABLE_SIZE {
            return Err(DeviceError::DataRange);
        }

        let touches = |register: Register| {
            let reg_start = register.address as usize;
            start < reg_start + register.width as usize && reg_start < end
        };

        // EEPROM area is locked while torque is on
        if self.torque_enabled() && start < table::TORQUE_ENABLE.address as usize {
            return Err(DeviceError::Access);
        }

        let goal = if touches(table::GOAL_POSITION) {
            if data.len() < table::GOAL_POSITION.width as usize
                || start != table::GOAL_POSITION.address as usize
            {
                return Err(DeviceError::DataLength);
            }
            let value = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            if self.load(table::OPERATING_MODE) == POSITION_MODE as i32
                && (value < SINGLE_TURN_RANGE.0 || value > SINGLE_TURN_RANGE.1)
            {
                return Err(DeviceError::DataLimit);
            }
            Some(value)
        } else {
            None
        };

        self.table[start..end].copy_from_slice(data);

        // The simulated horn reaches its goal instantly
        if let Some(value) = goal {
            if self.torque_enabled() {
                self.store(table::PRESENT_POSITION, value);
            }
        }
        Ok(goal)
    }
}

#[derive(Default)]
struct SimState {
    servos: BTreeMap<u8, SimServo>,
    reader: PacketReader,
    outbound: VecDeque<u8>,
    goal_history: Vec<(u8, i32)>,
    sync_writes: usize,
}

impl SimState {
    fn respond(&mut self, packet: RawPacket) {
        match packet.encode() {
            Ok(bytes) => self.outbound.extend(bytes),
            Err(e) => debug!("Simulated servo failed to encode status: {}", e),
        }
    }

    fn responsive(&self, id: u8) -> bool {
        self.servos.get(&id).map_or(false, |s| !s.unresponsive)
    }

    fn handle(&mut self, packet: RawPacket) {
        let Some(instruction) = packet.kind() else {
            debug!("Simulated bus ignoring instruction 0x{:02X}", packet.instruction);
            return;
        };
        trace!(id = packet.id, ?instruction, "simulated bus packet");

        match instruction {
            Instruction::Ping => self.handle_ping(packet.id),
            Instruction::Read => self.handle_read(packet.id, &packet.payload),
            Instruction::Write => self.handle_write(packet.id, &packet.payload),
            Instruction::SyncRead => self.handle_sync_read(&packet.payload),
            Instruction::SyncWrite => self.handle_sync_write(&packet.payload),
            Instruction::Status => {}
        }
    }

    fn targets(&self, id: u8) -> Vec<u8> {
        if id == BROADCAST_ID {
            self.servos.keys().copied().filter(|id| self.responsive(*id)).collect()
        } else if self.responsive(id) {
            vec![id]
        } else {
            Vec::new()
        }
    }

    fn fault(&self, id: u8) -> Option<DeviceError> {
        self.servos.get(&id).and_then(|s| s.fault)
    }

    fn handle_ping(&mut self, id: u8) {
        for target in self.targets(id) {
            let mut params = (SIM_MODEL_NUMBER).to_le_bytes().to_vec();
            params.push(SIM_FIRMWARE);
            self.respond(RawPacket::status(target, 0, &params));
        }
    }

    fn handle_read(&mut self, id: u8, params: &[u8]) {
        if !self.responsive(id) || params.len() != 4 {
            return;
        }
        let address = u16::from_le_bytes([params[0], params[1]]);
        let length = u16::from_le_bytes([params[2], params[3]]);
        let reply = self.read_status(id, address, length);
        self.respond(reply);
    }

    fn read_status(&self, id: u8, address: u16, length: u16) -> RawPacket {
        if let Some(fault) = self.fault(id) {
            return RawPacket::status(id, fault.code(), &[]);
        }
        match self.servos.get(&id).map(|s| s.read(address, length)) {
            Some(Ok(data)) => RawPacket::status(id, 0, &data),
            Some(Err(e)) => RawPacket::status(id, e.code(), &[]),
            None => RawPacket::status(id, DeviceError::ResultFail.code(), &[]),
        }
    }

    fn apply_write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<(), DeviceError> {
        if let Some(fault) = self.fault(id) {
            return Err(fault);
        }
        let servo = self.servos.get_mut(&id).ok_or(DeviceError::ResultFail)?;
        if let Some(goal) = servo.write(address, data)? {
            self.goal_history.push((id, goal));
        }
        Ok(())
    }

    fn handle_write(&mut self, id: u8, params: &[u8]) {
        if params.len() < 3 {
            return;
        }
        let address = u16::from_le_bytes([params[0], params[1]]);
        let data = params[2..].to_vec();
        for target in self.targets(id) {
            let error = match self.apply_write(target, address, &data) {
                Ok(()) => 0,
                Err(e) => e.code(),
            };
            if id != BROADCAST_ID {
                self.respond(RawPacket::status(target, error, &[]));
            }
        }
    }

    fn handle_sync_read(&mut self, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        let address = u16::from_le_bytes([params[0], params[1]]);
        let length = u16::from_le_bytes([params[2], params[3]]);
        for &id in &params[4..] {
            if self.responsive(id) {
                let reply = self.read_status(id, address, length);
                self.respond(reply);
            }
        }
    }

    fn handle_sync_write(&mut self, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        self.sync_writes += 1;
        let address = u16::from_le_bytes([params[0], params[1]]);
        let length = u16::from_le_bytes([params[2], params[3]]) as usize;
        for chunk in params[4..].chunks(length + 1) {
            if chunk.len() != length + 1 {
                debug!("Simulated bus dropping truncated sync write entry");
                break;
            }
            let id = chunk[0];
            if !self.responsive(id) {
                continue;
            }
            // Sync write carries no status; a rejected entry only changes nothing
            if let Err(e) = self.apply_write(id, address, &chunk[1..]) {
                debug!(id, "Simulated servo rejected sync write: {}", e);
            }
        }
    }
}

/// A simulated bus with any number of servos
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedBus")
            .field("servos", &state.servos.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servos(ids: &[u8]) -> Self {
        let bus = Self::new();
        for &id in ids {
            bus.add_servo(id);
        }
        bus
    }

    pub fn add_servo(&self, id: u8) {
        self.state.lock().servos.insert(id, SimServo::new());
    }

    /// Stop (or resume) answering for one servo
    pub fn set_unresponsive(&self, id: u8, unresponsive: bool) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.unresponsive = unresponsive;
        }
    }

    /// Make every subsequent read and write on a servo fail with `error`
    pub fn inject_error(&self, id: u8, error: DeviceError) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.fault = Some(error);
        }
    }

    pub fn clear_error(&self, id: u8) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.fault = None;
        }
    }

    pub fn register(&self, id: u8, register: Register) -> Option<i32> {
        self.state.lock().servos.get(&id).map(|s| s.load(register))
    }

    pub fn goal_position(&self, id: u8) -> Option<i32> {
        self.register(id, table::GOAL_POSITION)
    }

    pub fn present_position(&self, id: u8) -> Option<i32> {
        self.register(id, table::PRESENT_POSITION)
    }

    /// Move a horn by hand
    pub fn set_present_position(&self, id: u8, value: i32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.store(table::PRESENT_POSITION, value);
        }
    }

    pub fn torque_enabled(&self, id: u8) -> Option<bool> {
        self.state.lock().servos.get(&id).map(|s| s.torque_enabled())
    }

    pub fn operating_mode(&self, id: u8) -> Option<u8> {
        self.register(id, table::OPERATING_MODE).map(|v| v as u8)
    }

    /// Every accepted goal position, in order
    pub fn goal_history(&self) -> Vec<(u8, i32)> {
        self.state.lock().goal_history.clone()
    }

    pub fn sync_write_count(&self) -> usize {
        self.state.lock().sync_writes
    }
}

impl Transport for SimulatedBus {
    fn name(&self) -> &str {
        "simulated"
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.reader.push(data);
        loop {
            match state.reader.next_packet() {
                Ok(Some(packet)) => state.handle(packet),
                Ok(None) => break,
                Err(e) => debug!("Simulated bus discarding packet: {}", e),
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<(), BusError> {
        self.state.lock().outbound.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transact(bus: &mut SimulatedBus, packet: RawPacket) -> Vec<RawPacket> {
        bus.write_all(&packet.encode().unwrap()).unwrap();
        let mut buf = [0u8; 512];
        let n = bus.read(&mut buf).unwrap();
        let mut reader = PacketReader::new();
        reader.push(&buf[..n]);
        let mut packets = Vec::new();
        while let Some(p) = reader.next_packet().unwrap() {
            packets.push(p);
        }
        packets
    }

    #[test]
    fn test_debug_lists_servos() {
        let bus = SimulatedBus::with_servos(&[2, 1]);
        assert_eq!(format!("{:?}", bus), "SimulatedBus { servos: [1, 2] }");
    }

    #[test]
    fn test_ping_reports_model() {
        let mut bus = SimulatedBus::with_servos(&[1]);
        let replies = transact(&mut bus, RawPacket::new(1, Instruction::Ping, vec![]));
        assert_eq!(replies.len(), 1);
        let (error, params) = replies[0].as_status().unwrap();
        assert_eq!(error, 0);
        assert_eq!(u16::from_le_bytes([params[0], params[1]]), SIM_MODEL_NUMBER);
    }

    #[test]
    fn test_unknown_id_is_silent() {
        let mut bus = SimulatedBus::with_servos(&[1]);
        let replies = transact(&mut bus, RawPacket::new(9, Instruction::Ping, vec![]));
        assert!(replies.is_empty());
    }

    #[test]
    fn test_eeprom_locked_with_torque_on() {
        let mut servo = SimServo::new();
        servo.store(table::TORQUE_ENABLE, 1);
        assert_eq!(servo.write(11, &[4]), Err(DeviceError::Access));
        servo.store(table::TORQUE_ENABLE, 0);
        assert_eq!(servo.write(11, &[4]), Ok(None));
        assert_eq!(servo.load(table::OPERATING_MODE), 4);
    }

    #[test]
    fn test_goal_limit_in_position_mode() {
        let mut servo = SimServo::new();
        assert_eq!(
            servo.write(116, &5000i32.to_le_bytes()),
            Err(DeviceError::DataLimit)
        );
        servo.store(table::OPERATING_MODE, 4);
        assert_eq!(servo.write(116, &5000i32.to_le_bytes()), Ok(Some(5000)));
    }

    #[test]
    fn test_goal_moves_horn_only_with_torque() {
        let mut servo = SimServo::new();
        servo.write(116, &1000i32.to_le_bytes()).unwrap();
        assert_eq!(servo.load(table::PRESENT_POSITION), 0);
        servo.store(table::TORQUE_ENABLE, 1);
        servo.write(116, &1500i32.to_le_bytes()).unwrap();
        assert_eq!(servo.load(table::PRESENT_POSITION), 1500);
    }
}
