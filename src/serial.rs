//! Host-side driver for the block-transfer ports, working only through I/O space registers.

use std::{
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    block_transfer::{latin1_to_string, Response, BLOCK_SIZE, END_OF_SEND_BLOCK},
    disk_error::DeviceStatusCode,
    error::{BusError, SerialError},
    io_space::{BLOCK_STATUS, CONTROL, PEER_STATUS_CODE, PORT_BUFFERS, PORT_COUNT},
    port::BlockStatus,
};

const SEND_TRIGGER: u8 = 0b1110;
const READ_TRIGGER: u8 = 0b0110;

/// Bounds for waiting on a port's ready bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1,
            timeout_ms: 5000,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub fn is_ready_byte(control: u8) -> bool {
    control & 0b111 == 0b011
}

/// Anything that exposes the I/O space registers.
pub trait MmioAccess {
    fn mmio_read(&mut self, addr: u32) -> Option<u8>;
    fn mmio_write(&mut self, addr: u32, value: u8);

    /// Blocks until the port reports a connected, ready, idle peer.
    fn wait_for_ready(&mut self, port: usize, poll: &PollConfig) -> Result<(), SerialError> {
        let addr = CONTROL + port as u32;
        if self.mmio_read(addr).is_some_and(is_ready_byte) {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            thread::sleep(poll.interval());
            if self.mmio_read(addr).is_some_and(is_ready_byte) {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= poll.timeout() {
                return Err(SerialError::Timeout { port, waited });
            }
        }
    }
}

impl MmioAccess for crate::bus::Bus {
    fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        crate::bus::Bus::mmio_read(self, addr)
    }

    fn mmio_write(&mut self, addr: u32, value: u8) {
        crate::bus::Bus::mmio_write(self, addr, value)
    }
}

/// Decoded `DEVSTU` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: u8,
    pub message: String,
}

impl DeviceStatus {
    pub fn status(&self) -> Option<DeviceStatusCode> {
        DeviceStatusCode::from_u8(self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= 128
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialHelper {
    pub poll: PollConfig,
}

impl SerialHelper {
    pub fn new(poll: PollConfig) -> Self {
        Self { poll }
    }

    fn check_port(port: usize) -> Result<(), SerialError> {
        if port >= PORT_COUNT {
            return Err(BusError::InvalidPort(port).into());
        }
        Ok(())
    }

    fn control(io: &mut impl MmioAccess, port: usize) -> u8 {
        io.mmio_read(CONTROL + port as u32).unwrap_or(0)
    }

    pub fn is_device_present(&self, io: &mut impl MmioAccess, port: usize) -> bool {
        port < PORT_COUNT && Self::control(io, port) & 1 == 1
    }

    pub fn is_device_ready(&self, io: &mut impl MmioAccess, port: usize) -> bool {
        port < PORT_COUNT && is_ready_byte(Self::control(io, port))
    }

    /// Peer's status byte.
    pub fn get_status_code(&self, io: &mut impl MmioAccess, port: usize) -> Result<u8, SerialError> {
        Self::check_port(port)?;
        Ok(io.mmio_read(PEER_STATUS_CODE + port as u32).unwrap_or(0))
    }

    fn write_status(io: &mut impl MmioAccess, port: usize, status: BlockStatus) {
        let [low, high] = status.encode().to_le_bytes();
        let addr = BLOCK_STATUS + 2 * port as u32;
        io.mmio_write(addr, low);
        io.mmio_write(addr + 1, high);
    }

    fn read_status(io: &mut impl MmioAccess, port: usize) -> BlockStatus {
        let addr = BLOCK_STATUS + 2 * port as u32;
        let low = io.mmio_read(addr).unwrap_or(0);
        let high = io.mmio_read(addr + 1).unwrap_or(0);
        BlockStatus::decode(u16::from_le_bytes([low, high]))
    }

    fn get_ready(io: &mut impl MmioAccess, port: usize) {
        let flags = Self::control(io, port);
        io.mmio_write(CONTROL + port as u32, (flags & 0b1111_0001) | 0b0000_0010);
    }

    /// Sends `message` in 4096-byte blocks. An empty message still goes out as one empty block.
    pub fn send_message(
        &self,
        io: &mut impl MmioAccess,
        port: usize,
        message: &[u8],
    ) -> Result<(), SerialError> {
        Self::check_port(port)?;
        if !self.is_device_present(io, port) {
            return Err(SerialError::DeviceNotConnected(port));
        }

        let chunks: Vec<&[u8]> = if message.is_empty() {
            vec![message]
        } else {
            message.chunks(BLOCK_SIZE).collect()
        };
        tracing::debug!(
            "[SERIAL] Port {}: sending {} bytes in {} block(s)",
            port,
            message.len(),
            chunks.len()
        );

        let buffer = PORT_BUFFERS + (port * BLOCK_SIZE) as u32;
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            for k in 0..BLOCK_SIZE {
                io.mmio_write(buffer + k as u32, chunk.get(k).copied().unwrap_or(0));
            }
            Self::write_status(io, port, BlockStatus::new(chunk.len(), i < last));
            io.mmio_write(CONTROL + port as u32, SEND_TRIGGER);
            io.wait_for_ready(port, &self.poll)?;
        }

        Self::get_ready(io, port);
        Ok(())
    }

    /// Reads blocks until the peer stops announcing more.
    pub fn pull_message(&self, io: &mut impl MmioAccess, port: usize) -> Result<Vec<u8>, SerialError> {
        Self::check_port(port)?;
        if !self.is_device_present(io, port) {
            return Err(SerialError::DeviceNotConnected(port));
        }

        let buffer = PORT_BUFFERS + (port * BLOCK_SIZE) as u32;
        let mut message = Vec::new();
        loop {
            io.mmio_write(CONTROL + port as u32, READ_TRIGGER);
            io.wait_for_ready(port, &self.poll)?;

            let status = Self::read_status(io, port);
            for k in 0..status.len.min(BLOCK_SIZE) {
                message.push(io.mmio_read(buffer + k as u32).unwrap_or(0));
            }

            if !status.more {
                break;
            }
        }

        Self::get_ready(io, port);
        tracing::debug!("[SERIAL] Port {}: pulled {} bytes", port, message.len());
        Ok(message)
    }

    /// The whole receive buffer, zero padding included.
    pub fn fetch_response(&self, io: &mut impl MmioAccess, port: usize) -> Result<Vec<u8>, SerialError> {
        Self::check_port(port)?;
        let buffer = PORT_BUFFERS + (port * BLOCK_SIZE) as u32;
        Ok((0..BLOCK_SIZE as u32)
            .map(|k| io.mmio_read(buffer + k).unwrap_or(0))
            .collect())
    }

    pub fn send_message_get_bytes(
        &self,
        io: &mut impl MmioAccess,
        port: usize,
        message: &[u8],
    ) -> Result<Vec<u8>, SerialError> {
        self.send_message(io, port, message)?;
        io.wait_for_ready(port, &self.poll)?;
        self.fetch_response(io, port)
    }

    pub fn get_device_status(
        &self,
        io: &mut impl MmioAccess,
        port: usize,
    ) -> Result<DeviceStatus, SerialError> {
        let command = [b"DEVSTU".as_slice(), &[END_OF_SEND_BLOCK]].concat();
        let reply = self.send_message_get_bytes(io, port, &command)?;
        let response = Response::parse(&reply).ok_or(SerialError::MalformedResponse(port))?;

        let code = response
            .fields
            .first()
            .and_then(|field| field.first())
            .copied()
            .ok_or(SerialError::MalformedResponse(port))?;
        let message = response
            .fields
            .get(1)
            .map(|field| latin1_to_string(field))
            .unwrap_or_default();

        Ok(DeviceStatus { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_byte() {
        assert!(is_ready_byte(0b0010_0011));
        assert!(is_ready_byte(0b0000_1011));
        assert!(!is_ready_byte(0b0000_0111));
        assert!(!is_ready_byte(0b0000_0010));
        assert!(!is_ready_byte(0b0000_0001));
    }

    #[test]
    fn test_poll_config() {
        let poll = PollConfig {
            interval_ms: 0,
            timeout_ms: 20,
        };
        assert_eq!(poll.interval(), Duration::from_millis(1));
        assert_eq!(poll.timeout(), Duration::from_millis(20));
    }
}
