use std::{
    fmt::{self, Debug},
    fs::File,
    io::Read,
    path::PathBuf,
};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// Size of every slot's data window in the signed address space.
pub const SLOT_SIZE: u32 = 1024 * 1024;
/// Size of every slot's control-register window as seen through the I/O space.
pub const MMIO_SIZE: u32 = 128 * 1024;
pub const SLOT_COUNT: usize = 8;

/// Capability implemented by every card that can sit in a peripheral slot.
///
/// Addresses are window-relative offsets: the bus and the I/O space rebase before calling in.
pub trait Peripheral: Send {
    fn peek(&mut self, addr: u32) -> Option<u8>;
    fn poke(&mut self, addr: u32, value: u8);
    fn mmio_read(&mut self, addr: u32) -> Option<u8>;
    fn mmio_write(&mut self, addr: u32, value: u8);
    fn dispose(&mut self) {}

    fn typestring(&self) -> &str;

    fn data_size(&self) -> u32 {
        SLOT_SIZE
    }

    fn mmio_size(&self) -> u32 {
        MMIO_SIZE
    }

    fn interrupt_count(&self) -> u8 {
        0
    }
}

/// What a slot in the peripheral table is populated with.
#[derive(Default)]
pub enum SlotType {
    #[default]
    Empty,
    RamBank(RamBank),
    RomBank(RomBank),
    External(Box<dyn Peripheral>),
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Empty => write!(f, "Empty"),
            SlotType::RamBank(bank) => write!(
                f,
                "RAMB banks={} map0={} map1={}",
                bank.banks, bank.map0, bank.map1
            ),
            SlotType::RomBank(rom) => write!(
                f,
                "ROMB path={:?} banks={} map0={} map1={}",
                rom.rom_path, rom.bank.banks, rom.bank.map0, rom.bank.map1
            ),
            SlotType::External(peripheral) => write!(f, "{}", peripheral.typestring()),
        }
    }
}

impl Debug for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotType({})", self)
    }
}

impl SlotType {
    pub fn peek(&mut self, addr: u32) -> Option<u8> {
        match self {
            SlotType::Empty => None,
            SlotType::RamBank(bank) => bank.peek(addr),
            SlotType::RomBank(rom) => rom.peek(addr),
            SlotType::External(peripheral) => peripheral.peek(addr),
        }
    }

    pub fn poke(&mut self, addr: u32, value: u8) {
        match self {
            SlotType::Empty => {}
            SlotType::RamBank(bank) => bank.poke(addr, value),
            SlotType::RomBank(rom) => rom.poke(addr, value),
            SlotType::External(peripheral) => peripheral.poke(addr, value),
        }
    }

    pub fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        match self {
            SlotType::Empty => None,
            SlotType::RamBank(bank) => bank.mmio_read(addr),
            SlotType::RomBank(rom) => rom.mmio_read(addr),
            SlotType::External(peripheral) => peripheral.mmio_read(addr),
        }
    }

    pub fn mmio_write(&mut self, addr: u32, value: u8) {
        match self {
            SlotType::Empty => {}
            SlotType::RamBank(bank) => bank.mmio_write(addr, value),
            SlotType::RomBank(rom) => rom.mmio_write(addr, value),
            SlotType::External(peripheral) => peripheral.mmio_write(addr, value),
        }
    }

    pub fn dispose(&mut self) {
        match self {
            SlotType::Empty => {}
            SlotType::RamBank(bank) => bank.dispose(),
            SlotType::RomBank(rom) => rom.dispose(),
            SlotType::External(peripheral) => peripheral.dispose(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SlotType::Empty)
    }

    fn as_peripheral(&self) -> Option<&dyn Peripheral> {
        match self {
            SlotType::Empty => None,
            SlotType::RamBank(bank) => Some(bank),
            SlotType::RomBank(rom) => Some(rom),
            SlotType::External(peripheral) => Some(peripheral.as_ref()),
        }
    }

    pub fn entry(&self, slot: usize) -> PeripheralEntry {
        match self.as_peripheral() {
            Some(peripheral) => PeripheralEntry {
                slot,
                kind: Some(peripheral.typestring().to_string()),
                data_size: peripheral.data_size(),
                mmio_size: peripheral.mmio_size(),
                interrupt_count: peripheral.interrupt_count(),
            },
            None => PeripheralEntry {
                slot,
                ..Default::default()
            },
        }
    }
}

/// Descriptive view of one row of the peripheral table.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralEntry {
    pub slot: usize,
    pub kind: Option<String>,
    pub data_size: u32,
    pub mmio_size: u32,
    pub interrupt_count: u8,
}

impl fmt::Display for PeripheralEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {}: {} data={:#X} mmio={:#X} irq={}",
            self.slot,
            self.kind.as_deref().unwrap_or("(empty)"),
            self.data_size,
            self.mmio_size,
            self.interrupt_count
        )
    }
}

pub const BANK_SIZE: u32 = 512 * 1024;

/// Bank-switched memory card. Its data window shows two banks side by side; MMIO registers
/// 0 and 1 pick which bank sits behind each half.
#[derive(Derivative, Serialize, Deserialize, Clone)]
#[derivative(Debug, PartialEq)]
pub struct RamBank {
    pub banks: u32,
    pub map0: u32,
    pub map1: u32,
    #[derivative(Debug = "ignore")]
    pub data: Vec<u8>,
}

impl RamBank {
    pub fn new(banks: u32) -> Self {
        let mut banks = banks.clamp(2, 256);
        if banks % 2 == 1 {
            banks += 1;
        }

        Self {
            banks,
            map0: 0,
            map1: 1,
            data: vec![0; (banks * BANK_SIZE) as usize],
        }
    }

    fn translate_address(&self, addr: u32) -> Option<usize> {
        let bank = match addr {
            a if a < BANK_SIZE => self.map0,
            a if a < 2 * BANK_SIZE => self.map1,
            _ => return None,
        };
        Some((bank * BANK_SIZE + addr % BANK_SIZE) as usize)
    }
}

impl Peripheral for RamBank {
    fn peek(&mut self, addr: u32) -> Option<u8> {
        let index = self.translate_address(addr)?;
        self.data.get(index).copied()
    }

    fn poke(&mut self, addr: u32, value: u8) {
        if let Some(cell) = self
            .translate_address(addr)
            .and_then(|index| self.data.get_mut(index))
        {
            *cell = value;
        }
    }

    fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        match addr {
            0 => Some(self.map0 as u8),
            1 => Some(self.map1 as u8),
            _ => Some(0xFF),
        }
    }

    fn mmio_write(&mut self, addr: u32, value: u8) {
        match addr {
            0 => self.map0 = value as u32 % self.banks,
            1 => self.map1 = value as u32 % self.banks,
            _ => tracing::trace!("[RAMB] Ignored MMIO write {:#X} = {:02X}", addr, value),
        }
    }

    fn dispose(&mut self) {
        self.data = Vec::new();
    }

    fn typestring(&self) -> &str {
        "RAMB"
    }

    fn data_size(&self) -> u32 {
        2 * BANK_SIZE
    }
}

/// Read-only variant of [`RamBank`], preloaded from an image.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct RomBank {
    pub rom_path: Option<PathBuf>,
    pub bank: RamBank,
}

impl RomBank {
    pub fn new(rom: &[u8], banks: u32) -> Self {
        let mut bank = RamBank::new(banks);
        let len = rom.len().min(bank.data.len());
        bank.data[..len].copy_from_slice(&rom[..len]);
        if len < rom.len() {
            tracing::warn!(
                "[ROMB] Image is {} bytes, truncated to {} bytes",
                rom.len(),
                len
            );
        }

        RomBank {
            rom_path: None,
            bank,
        }
    }

    pub fn load(rom_path: PathBuf, banks: u32) -> anyhow::Result<Self> {
        let mut file = File::open(&rom_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut rom = Self::new(&buffer, banks);
        rom.rom_path = Some(rom_path);

        Ok(rom)
    }
}

impl Peripheral for RomBank {
    fn peek(&mut self, addr: u32) -> Option<u8> {
        self.bank.peek(addr)
    }

    fn poke(&mut self, addr: u32, _value: u8) {
        tracing::trace!("Attempt to write to ROM bank offset {:#08X}", addr);
    }

    fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        self.bank.mmio_read(addr)
    }

    fn mmio_write(&mut self, addr: u32, value: u8) {
        self.bank.mmio_write(addr, value)
    }

    fn dispose(&mut self) {
        self.bank.dispose();
    }

    fn typestring(&self) -> &str {
        "ROMB"
    }

    fn data_size(&self) -> u32 {
        2 * BANK_SIZE
    }
}
