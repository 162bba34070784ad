//! Slot 0: the I/O register file.
//!
//! Keyboard and mouse registers, installed memory size, clock latches, a scratch area, four
//! block-transfer ports and forwarding windows onto the MMIO space of slots 1 to 7.

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::{
    block_transfer::{link, lock_endpoint, unlink, BlockTransferInterface, PeerLink, BLOCK_SIZE},
    error::BusError,
    keyboard::Keyboard,
    port::BlockTransferPort,
    slot::{SlotType, MMIO_SIZE},
};

pub const PORT_COUNT: usize = 4;
pub const SCRATCH_SIZE: usize = 1024;
pub const HYVE_START: u32 = 92;
pub const HYVE_END: u32 = 127;

pub const KEYBOARD_DEQUEUE: u32 = 37;
pub const KEYBOARD_REQUEST: u32 = 38;
pub const RAW_INPUT_LATCH: u32 = 39;
pub const MEMSIZE: u32 = 64;
pub const CLOCK_LATCH: u32 = 68;
pub const SCRATCH_START: u32 = 1024;
pub const OWN_STATUS_CODE: u32 = 4076;
pub const PEER_STATUS_CODE: u32 = 4080;
pub const BLOCK_STATUS: u32 = 4084;
pub const CONTROL: u32 = 4092;
pub const PORT_BUFFERS: u32 = 4096;
pub const FORWARD_START: u32 = MMIO_SIZE;
pub const FORWARD_END: u32 = 8 * MMIO_SIZE - 1;

pub type SharedPort = Arc<Mutex<BlockTransferPort>>;

pub struct IoSpace {
    ram_size: u32,
    pub keyboard: Keyboard,
    pub mouse_x: i16,
    pub mouse_y: i16,
    pub mouse_down: bool,
    booted_at: OffsetDateTime,
    uptime_ms: u64,
    rtc_ms: u64,
    scratch: Vec<u8>,
    hyve: [u8; (HYVE_END - HYVE_START + 1) as usize],
    ports: [SharedPort; PORT_COUNT],
    attached: [Option<PeerLink>; PORT_COUNT],
}

impl std::fmt::Debug for IoSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSpace")
            .field("ram_size", &self.ram_size)
            .field("keyboard", &self.keyboard.len())
            .field("mouse", &(self.mouse_x, self.mouse_y, self.mouse_down))
            .field(
                "attached",
                &self.attached.iter().map(Option::is_some).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl IoSpace {
    pub fn new(ram_size: u32) -> Self {
        Self {
            ram_size,
            keyboard: Keyboard::new(),
            mouse_x: 0,
            mouse_y: 0,
            mouse_down: false,
            booted_at: OffsetDateTime::now_utc(),
            uptime_ms: 0,
            rtc_ms: 0,
            scratch: vec![0; SCRATCH_SIZE],
            hyve: [0; (HYVE_END - HYVE_START + 1) as usize],
            ports: std::array::from_fn(|i| Arc::new(Mutex::new(BlockTransferPort::new(i)))),
            attached: Default::default(),
        }
    }

    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    pub fn port(&self, index: usize) -> Result<SharedPort, BusError> {
        self.ports
            .get(index)
            .cloned()
            .ok_or(BusError::InvalidPort(index))
    }

    pub fn attached_device(&self, index: usize) -> Option<PeerLink> {
        self.attached.get(index).cloned().flatten()
    }

    /// Plugs `device` into port `index`, unplugging whatever was there. The I/O space keeps the
    /// device alive until it is detached.
    pub fn attach_device(&mut self, index: usize, device: PeerLink) -> Result<(), BusError> {
        let port: PeerLink = self.port(index)?;
        let port_id = lock_endpoint(&port).state().id();
        let device_id = lock_endpoint(&device).state().id();
        if port_id == device_id {
            return Err(BusError::SelfAttach);
        }

        if self.detach_device(index)?.is_some() {
            tracing::info!("[IO] Hot-swapping the device on port {}", index);
        }
        unlink(&port);
        unlink(&device);
        lock_endpoint(&self.ports[index]).clear_inbox();
        self.clear_looped_port(device_id);
        link(&port, &device);
        self.attached[index] = Some(device);

        tracing::info!("[IO] Device attached to port {}", index);
        Ok(())
    }

    pub fn detach_device(&mut self, index: usize) -> Result<Option<PeerLink>, BusError> {
        let port: PeerLink = self.port(index)?;
        unlink(&port);
        lock_endpoint(&self.ports[index]).clear_inbox();
        let device = self.attached[index].take();
        if let Some(device) = &device {
            let device_id = lock_endpoint(device).state().id();
            self.clear_looped_port(device_id);
            tracing::debug!("[IO] Device detached from port {}", index);
        }
        Ok(device)
    }

    /// A device that is one of our own ports keeps no blocks from the link it just left.
    fn clear_looped_port(&self, device_id: u64) {
        for port in &self.ports {
            let mut port = lock_endpoint(port);
            if port.state().id() == device_id {
                port.clear_inbox();
            }
        }
    }

    /// Loops port `a` back onto port `b` of the same I/O space.
    pub fn connect_ports(&mut self, a: usize, b: usize) -> Result<(), BusError> {
        let other = self.port(b)?;
        self.detach_device(b)?;
        self.attach_device(a, other)
    }

    /// Host keystrokes are only taken while the guest has asked for input.
    pub fn key_typed(&mut self, key: u8) {
        if !self.keyboard.input_requested || key == 0 {
            tracing::trace!("[IO] Key {:#04X} ignored", key);
            return;
        }
        self.keyboard.key_typed(key);
    }

    pub fn set_mouse(&mut self, x: i16, y: i16, down: bool) {
        self.mouse_x = x;
        self.mouse_y = y;
        self.mouse_down = down;
    }

    pub fn latch_raw_input(&mut self) {
        self.keyboard.latch_key_events();
    }

    fn latch_clocks(&mut self, bits: u8) {
        let now = OffsetDateTime::now_utc();
        if bits & 0b01 != 0 {
            let uptime = (now - self.booted_at).whole_milliseconds();
            self.uptime_ms = u64::try_from(uptime).unwrap_or(0);
        }
        if bits & 0b10 != 0 {
            let rtc = now.unix_timestamp_nanos() / 1_000_000;
            self.rtc_ms = u64::try_from(rtc).unwrap_or(0);
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    pub fn rtc_ms(&self) -> u64 {
        self.rtc_ms
    }

    pub fn mmio_read(&mut self, addr: u32, cards: &mut [SlotType]) -> Option<u8> {
        let offset = addr as usize;
        match addr {
            0..=31 => Some(self.keyboard.peek(offset).unwrap_or(0xFF)),
            32..=33 => Some(self.mouse_x.to_le_bytes()[offset - 32]),
            34..=35 => Some(self.mouse_y.to_le_bytes()[offset - 34]),
            36 => Some(u8::from(self.mouse_down)),
            KEYBOARD_DEQUEUE => Some(self.keyboard.pop().unwrap_or(0xFF)),
            KEYBOARD_REQUEST => Some(u8::from(self.keyboard.input_requested)),
            // raw input is captured as soon as it is latched
            RAW_INPUT_LATCH => Some(0),
            40..=47 => Some(self.keyboard.key_event(offset - 40)),
            64..=67 => Some(self.ram_size.to_le_bytes()[offset - 64]),
            CLOCK_LATCH => Some(0),
            72..=79 => Some(self.uptime_ms.to_le_bytes()[offset - 72]),
            80..=87 => Some(self.rtc_ms.to_le_bytes()[offset - 80]),
            HYVE_START..=HYVE_END => Some(self.hyve[offset - HYVE_START as usize]),
            1024..=2047 => self.scratch.get(offset - 1024).copied(),
            4076..=4079 => {
                Some(lock_endpoint(&self.ports[offset - 4076]).state().status_code)
            }
            4080..=4083 => Some(lock_endpoint(&self.ports[offset - 4080]).your_status_code()),
            4084..=4091 => {
                let rel = offset - BLOCK_STATUS as usize;
                let status = lock_endpoint(&self.ports[rel / 2]).status_register();
                Some(status.to_le_bytes()[rel % 2])
            }
            4092..=4095 => Some(lock_endpoint(&self.ports[offset - 4092]).control_byte()),
            4096..=20479 => {
                let rel = offset - PORT_BUFFERS as usize;
                Some(lock_endpoint(&self.ports[rel / BLOCK_SIZE]).rx()[rel % BLOCK_SIZE])
            }
            FORWARD_START..=FORWARD_END => {
                let slot = (addr / MMIO_SIZE) as usize;
                cards.get_mut(slot - 1)?.mmio_read(addr % MMIO_SIZE)
            }
            _ => {
                tracing::trace!("[IO] Unmapped register read {:#X}", addr);
                None
            }
        }
    }

    pub fn mmio_write(&mut self, addr: u32, value: u8, cards: &mut [SlotType]) {
        let offset = addr as usize;
        match addr {
            KEYBOARD_DEQUEUE => self.keyboard.key_typed(value),
            KEYBOARD_REQUEST => {
                self.keyboard.input_requested = value != 0;
                if value != 0 {
                    self.keyboard.clear();
                }
            }
            RAW_INPUT_LATCH => {
                if value != 0 {
                    self.latch_raw_input();
                }
            }
            40..=47 => self.keyboard.set_key_event(offset - 40, value),
            CLOCK_LATCH => self.latch_clocks(value),
            HYVE_START..=HYVE_END => self.hyve[offset - HYVE_START as usize] = value,
            1024..=2047 => self.scratch[offset - 1024] = value,
            4076..=4079 => {
                lock_endpoint(&self.ports[offset - 4076])
                    .state_mut()
                    .status_code = value
            }
            4084..=4091 => {
                let rel = offset - BLOCK_STATUS as usize;
                lock_endpoint(&self.ports[rel / 2]).write_status_byte(rel % 2 == 1, value);
            }
            4092..=4095 => {
                lock_endpoint(&self.ports[offset - 4092]).write_control_byte(value);
            }
            4096..=20479 => {
                let rel = offset - PORT_BUFFERS as usize;
                lock_endpoint(&self.ports[rel / BLOCK_SIZE]).tx_mut()[rel % BLOCK_SIZE] = value;
            }
            FORWARD_START..=FORWARD_END => {
                let slot = (addr / MMIO_SIZE) as usize;
                if let Some(card) = cards.get_mut(slot - 1) {
                    card.mmio_write(addr % MMIO_SIZE, value);
                }
            }
            _ => tracing::trace!("[IO] Ignored register write {:#X} = {:02X}", addr, value),
        }
    }

    pub fn reset(&mut self) {
        self.keyboard = Keyboard::new();
        self.set_mouse(0, 0, false);
        self.scratch.fill(0);
        self.hyve.fill(0);
        for port in &self.ports {
            lock_endpoint(port).reset();
        }
    }

    pub fn dispose(&mut self) {
        for index in 0..PORT_COUNT {
            // indices are always in range here
            let _ = self.detach_device(index);
        }
    }

    pub(crate) fn ports(&self) -> &[SharedPort; PORT_COUNT] {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memsize() {
        let mut io = IoSpace::new(0x0012_3456);
        let bytes: Vec<_> = (64..68).map(|a| io.mmio_read(a, &mut []).unwrap()).collect();
        assert_eq!(bytes, vec![0x56, 0x34, 0x12, 0x00]);
    }

    #[test]
    fn test_unmapped_registers() {
        let mut io = IoSpace::new(1024);
        assert_eq!(io.mmio_read(48, &mut []), None);
        assert_eq!(io.mmio_read(3000, &mut []), None);
        io.mmio_write(3000, 1, &mut []);
    }

    #[test]
    fn test_scratch_area() {
        let mut io = IoSpace::new(1024);
        io.mmio_write(1024, 0x11, &mut []);
        io.mmio_write(2047, 0x22, &mut []);
        assert_eq!(io.mmio_read(1024, &mut []), Some(0x11));
        assert_eq!(io.mmio_read(2047, &mut []), Some(0x22));
    }

    #[test]
    fn test_hyve_area() {
        let mut io = IoSpace::new(1024);
        io.mmio_write(HYVE_START, 0x92, &mut []);
        io.mmio_write(HYVE_END, 0x7F, &mut []);
        assert_eq!(io.mmio_read(HYVE_START, &mut []), Some(0x92));
        assert_eq!(io.mmio_read(HYVE_END, &mut []), Some(0x7F));
        assert_eq!(io.mmio_read(91, &mut []), None);
        assert_eq!(io.mmio_read(128, &mut []), None);

        io.reset();
        assert_eq!(io.mmio_read(HYVE_START, &mut []), Some(0));
    }

    #[test]
    fn test_key_typed_needs_request() {
        let mut io = IoSpace::new(1024);
        io.key_typed(b'x');
        assert_eq!(io.mmio_read(KEYBOARD_DEQUEUE, &mut []), Some(0xFF));

        io.mmio_write(KEYBOARD_REQUEST, 1, &mut []);
        io.key_typed(0);
        io.key_typed(b'x');
        assert_eq!(io.mmio_read(KEYBOARD_DEQUEUE, &mut []), Some(b'x'));
        assert_eq!(io.mmio_read(KEYBOARD_DEQUEUE, &mut []), Some(0xFF));
    }

    #[test]
    fn test_clock_latch() {
        let mut io = IoSpace::new(1024);
        io.mmio_write(CLOCK_LATCH, 0b10, &mut []);
        assert!(io.rtc_ms() > 0);
        assert_eq!(io.uptime_ms(), 0);
    }

    #[test]
    fn test_self_attach_rejected() {
        let mut io = IoSpace::new(1024);
        assert_eq!(io.connect_ports(1, 1), Err(BusError::SelfAttach));
        assert_eq!(io.connect_ports(4, 1), Err(BusError::InvalidPort(4)));
    }
}
