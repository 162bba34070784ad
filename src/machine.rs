use std::{
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use crate::{
    block_transfer::{lock_endpoint, PeerLink},
    bus::{clamp_to_mapped, Bus},
    config::{MachineConfig, SlotKind},
    disk_drive::VirtualDiskDrive,
    error::{BusError, SerialError},
    internal_state::{InternalState, ReportState},
    io_space::{SharedPort, CONTROL},
    memory::USER_SPACE_SIZE,
    serial::{is_ready_byte, MmioAccess, PollConfig, SerialHelper},
    slot::{Peripheral, PeripheralEntry, RamBank, RomBank, SlotType},
    utils::hexdump,
};

/// One emulated computer: user RAM, the I/O space and seven peripheral slots.
#[derive(Debug)]
pub struct Machine {
    pub bus: Bus,
    strict: bool,
    serial: SerialHelper,
}

impl Machine {
    pub fn new(ram_size: u32) -> Self {
        tracing::info!("[Machine] Initializing with {} bytes of RAM", ram_size);
        Self {
            bus: Bus::new(ram_size),
            strict: false,
            serial: SerialHelper::default(),
        }
    }

    pub fn builder() -> MachineBuilder {
        MachineBuilder::new()
    }

    pub fn ram_size(&self) -> u32 {
        self.bus.ram_size()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn serial(&self) -> SerialHelper {
        self.serial
    }

    pub fn peek(&mut self, addr: i64) -> Option<u8> {
        if !self.strict {
            return self.bus.peek(addr);
        }

        match self.bus.try_peek(addr) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("[Machine] {}", err);
                None
            }
        }
    }

    pub fn poke(&mut self, addr: i64, value: u8) {
        if !self.strict {
            return self.bus.poke(addr, value);
        }

        if let Err(err) = self.bus.try_poke(addr, value) {
            tracing::warn!("[Machine] {}", err);
        }
    }

    pub fn try_peek(&mut self, addr: i64) -> Result<Option<u8>, BusError> {
        self.bus.try_peek(addr)
    }

    pub fn try_poke(&mut self, addr: i64, value: u8) -> Result<(), BusError> {
        self.bus.try_poke(addr, value)
    }

    pub fn load(&mut self, addr: i64, data: &[u8]) {
        self.bus.write_block(addr, data);
    }

    pub fn peripheral_table(&self) -> Vec<PeripheralEntry> {
        self.bus.peripheral_table()
    }

    pub fn port(&self, index: usize) -> Result<SharedPort, BusError> {
        self.bus.io.port(index)
    }

    pub fn attach_device(&mut self, port: usize, device: PeerLink) -> Result<(), BusError> {
        self.bus.io.attach_device(port, device)
    }

    pub fn detach_device(&mut self, port: usize) -> Result<Option<PeerLink>, BusError> {
        self.bus.io.detach_device(port)
    }

    pub fn connect_ports(&mut self, a: usize, b: usize) -> Result<(), BusError> {
        self.bus.io.connect_ports(a, b)
    }

    pub fn key_typed(&mut self, key: u8) {
        self.bus.io.key_typed(key);
    }

    pub fn key_down(&mut self, keycode: u8) {
        self.bus.io.keyboard.key_down(keycode);
    }

    pub fn key_up(&mut self, keycode: u8) {
        self.bus.io.keyboard.key_up(keycode);
    }

    pub fn set_mouse(&mut self, x: i16, y: i16, down: bool) {
        self.bus.io.set_mouse(x, y, down);
    }

    pub fn send_message(&mut self, port: usize, message: &[u8]) -> Result<(), SerialError> {
        let serial = self.serial;
        serial.send_message(self, port, message)
    }

    pub fn pull_message(&mut self, port: usize) -> Result<Vec<u8>, SerialError> {
        let serial = self.serial;
        serial.pull_message(self, port)
    }

    pub fn memory_dump(&mut self, start: i64, end: i64) -> String {
        let (start, end) = clamp_to_mapped(start, end);
        let len = usize::try_from(end - start).unwrap_or(0);
        hexdump(&self.bus.read_block(start, len), start)
    }

    pub fn report_state_json(&mut self) -> anyhow::Result<String> {
        let state = self.report_state()?;
        Ok(serde_json::to_string(&state)?)
    }

    pub fn reset(&mut self) {
        tracing::info!("[Machine] Reset");
        self.bus.reset();
    }

    pub fn dispose(&mut self) {
        tracing::info!("[Machine] Disposing");
        self.bus.dispose();
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new(USER_SPACE_SIZE)
    }
}

impl MmioAccess for Machine {
    fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        self.bus.mmio_read(addr)
    }

    fn mmio_write(&mut self, addr: u32, value: u8) {
        self.bus.mmio_write(addr, value)
    }
}

impl ReportState for Machine {
    fn report_state(&mut self) -> anyhow::Result<InternalState> {
        self.bus.report_state()
    }
}

#[derive(Default)]
pub struct MachineBuilder {
    ram_size: Option<u32>,
    strict: bool,
    poll: PollConfig,
    slots: Vec<(usize, SlotType)>,
    devices: Vec<(usize, PeerLink)>,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from a config, loading ROM images and mounting disk drives along the way.
    pub fn from_config(config: &MachineConfig) -> anyhow::Result<Self> {
        let mut builder = Self::new();
        builder
            .ram_size(config.ram_size)
            .strict_addressing(config.strict_addressing)
            .poll(config.serial);

        for slot in &config.slots {
            match &slot.kind {
                SlotKind::Empty => builder.empty_slot(slot.slot),
                SlotKind::RamBank { banks } => builder.ram_bank(slot.slot, *banks),
                SlotKind::RomBank { path, banks } => {
                    let rom = RomBank::load(PathBuf::from(path), *banks)?;
                    builder.card(slot.slot, SlotType::RomBank(rom))
                }
            };
        }

        for disk in &config.disks {
            let mut drive = VirtualDiskDrive::new(&disk.root, disk.port)?;
            if let Some(name) = &disk.name {
                drive = drive.with_name(name.clone());
            }
            builder.attach_device(disk.port, drive.into_link());
        }

        Ok(builder)
    }

    pub fn ram_size(&mut self, size: u32) -> &mut Self {
        self.ram_size = Some(size);
        self
    }

    pub fn strict_addressing(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    pub fn poll(&mut self, poll: PollConfig) -> &mut Self {
        self.poll = poll;
        self
    }

    pub fn card(&mut self, slot: usize, card: SlotType) -> &mut Self {
        self.slots.push((slot, card));
        self
    }

    pub fn ram_bank(&mut self, slot: usize, banks: u32) -> &mut Self {
        self.card(slot, SlotType::RamBank(RamBank::new(banks)))
    }

    pub fn rom_bank(&mut self, slot: usize, data: &[u8], banks: u32) -> &mut Self {
        self.card(slot, SlotType::RomBank(RomBank::new(data, banks)))
    }

    pub fn peripheral(&mut self, slot: usize, peripheral: Box<dyn Peripheral>) -> &mut Self {
        self.card(slot, SlotType::External(peripheral))
    }

    pub fn empty_slot(&mut self, slot: usize) -> &mut Self {
        self.card(slot, SlotType::Empty)
    }

    pub fn attach_device(&mut self, port: usize, device: PeerLink) -> &mut Self {
        self.devices.push((port, device));
        self
    }

    pub fn build(&mut self) -> Result<Machine, BusError> {
        let mut machine = Machine::new(self.ram_size.unwrap_or(USER_SPACE_SIZE));
        machine.strict = self.strict;
        machine.serial = SerialHelper::new(self.poll);

        for (slot, card) in self.slots.drain(..) {
            machine.bus.install(slot, card)?;
        }
        for (port, device) in self.devices.drain(..) {
            machine.attach_device(port, device)?;
        }

        Ok(machine)
    }
}

/// A machine shared between threads: one in-flight bus call at a time, plus a condition
/// variable signalled after every write so serial waits can sleep instead of polling.
#[derive(Clone)]
pub struct SharedMachine(Arc<(Mutex<Machine>, Condvar)>);

impl SharedMachine {
    pub fn new(machine: Machine) -> Self {
        Self(Arc::new((Mutex::new(machine), Condvar::new())))
    }

    pub fn lock(&self) -> MutexGuard<'_, Machine> {
        lock_endpoint(&self.0 .0)
    }

    /// Runs `f` with exclusive access and wakes any waiter afterwards.
    pub fn with<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> R {
        let result = f(&mut self.lock());
        self.notify();
        result
    }

    pub fn notify(&self) {
        self.0 .1.notify_all();
    }

    pub fn peek(&self, addr: i64) -> Option<u8> {
        self.lock().peek(addr)
    }

    pub fn poke(&self, addr: i64, value: u8) {
        self.with(|machine| machine.poke(addr, value))
    }

    pub fn send_message(&self, port: usize, message: &[u8]) -> Result<(), SerialError> {
        let serial = self.lock().serial();
        serial.send_message(&mut self.clone(), port, message)
    }

    pub fn pull_message(&self, port: usize) -> Result<Vec<u8>, SerialError> {
        let serial = self.lock().serial();
        serial.pull_message(&mut self.clone(), port)
    }
}

impl MmioAccess for SharedMachine {
    fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        self.lock().mmio_read(addr)
    }

    fn mmio_write(&mut self, addr: u32, value: u8) {
        self.with(|machine| machine.mmio_write(addr, value))
    }

    fn wait_for_ready(&mut self, port: usize, poll: &PollConfig) -> Result<(), SerialError> {
        let (lock, condvar) = &*self.0;
        let started = Instant::now();
        let guard = lock_endpoint(lock);
        let addr = CONTROL + port as u32;

        let (_guard, result) = condvar
            .wait_timeout_while(guard, poll.timeout(), |machine| {
                !machine.mmio_read(addr).is_some_and(is_ready_byte)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if result.timed_out() {
            return Err(SerialError::Timeout {
                port,
                waited: started.elapsed(),
            });
        }
        Ok(())
    }
}
