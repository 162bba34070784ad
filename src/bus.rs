use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::BusError,
    io_space::IoSpace,
    memory::{UserRam, USER_SPACE_SIZE},
    slot::{PeripheralEntry, SlotType, SLOT_COUNT, SLOT_SIZE},
};

/// Where a bus address lands.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Region {
    UserRam,
    Slot(usize),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::UserRam => write!(f, "user RAM"),
            Region::Slot(slot) => write!(f, "slot {}", slot),
        }
    }
}

/// Maps a signed bus address to its region and the region-relative offset.
///
/// Non-negative addresses below `ram_size` are user RAM. Slot `i` owns the 1 MiB below
/// `-(i * SLOT_SIZE)`, counted downwards so that `-(i * SLOT_SIZE) - 1` is offset 0.
pub fn translate_address(addr: i64, ram_size: u32) -> Option<(Region, u32)> {
    let ram_size = ram_size.min(USER_SPACE_SIZE);
    if addr >= 0 {
        return (addr < i64::from(ram_size)).then_some((Region::UserRam, addr as u32));
    }

    let flat = -1 - addr;
    let slot = flat / i64::from(SLOT_SIZE);
    if slot >= SLOT_COUNT as i64 {
        return None;
    }

    Some((Region::Slot(slot as usize), (flat % i64::from(SLOT_SIZE)) as u32))
}

/// Lowest mapped address: the last byte of slot 7.
pub const MAPPED_LOW: i64 = -(SLOT_COUNT as i64) * SLOT_SIZE as i64;
/// One past the highest address user RAM can reach.
pub const MAPPED_HIGH: i64 = USER_SPACE_SIZE as i64;

/// Narrows `start..end` to the part that lies in `MAPPED_LOW..MAPPED_HIGH`.
pub fn clamp_to_mapped(start: i64, end: i64) -> (i64, i64) {
    let from = start.clamp(MAPPED_LOW, MAPPED_HIGH);
    (from, end.clamp(from, MAPPED_HIGH))
}

/// Address of `offset` within slot `slot`'s data window.
pub fn slot_address(slot: usize, offset: u32) -> i64 {
    -(slot as i64 * i64::from(SLOT_SIZE)) - 1 - i64::from(offset)
}

#[derive(Debug)]
pub struct Bus {
    pub ram: UserRam,
    pub io: IoSpace,

    // slots 1 to 7; slot 0 is `io`
    cards: [SlotType; SLOT_COUNT - 1],
}

impl Bus {
    pub fn new(ram_size: u32) -> Self {
        let ram = UserRam::new(ram_size);
        let io = IoSpace::new(ram.size());
        Self {
            ram,
            io,
            cards: Default::default(),
        }
    }

    pub fn ram_size(&self) -> u32 {
        self.ram.size()
    }

    pub fn translate_address(&self, addr: i64) -> Option<(Region, u32)> {
        translate_address(addr, self.ram.size())
    }

    pub fn peek(&mut self, addr: i64) -> Option<u8> {
        match self.translate_address(addr) {
            Some((Region::UserRam, offset)) => self.ram.read_byte(offset),
            Some((Region::Slot(0), offset)) => self.io.mmio_read(offset, &mut self.cards),
            Some((Region::Slot(slot), offset)) => self.cards[slot - 1].peek(offset),
            None => {
                tracing::trace!("[BUS] Open bus read at {:#X}", addr);
                None
            }
        }
    }

    pub fn poke(&mut self, addr: i64, value: u8) {
        match self.translate_address(addr) {
            Some((Region::UserRam, offset)) => {
                self.ram.write_byte(offset, value);
            }
            Some((Region::Slot(0), offset)) => self.io.mmio_write(offset, value, &mut self.cards),
            Some((Region::Slot(slot), offset)) => self.cards[slot - 1].poke(offset, value),
            None => tracing::trace!("[BUS] Dropped write at {:#X} = {:02X}", addr, value),
        }
    }

    pub fn try_peek(&mut self, addr: i64) -> Result<Option<u8>, BusError> {
        if self.translate_address(addr).is_none() {
            return Err(BusError::IllegalAddress(addr));
        }
        Ok(self.peek(addr))
    }

    pub fn try_poke(&mut self, addr: i64, value: u8) -> Result<(), BusError> {
        if self.translate_address(addr).is_none() {
            return Err(BusError::IllegalAddress(addr));
        }
        self.poke(addr, value);
        Ok(())
    }

    /// Reads `len` bytes starting at `start`, walking upwards. Unmapped bytes read as `0xFF`.
    /// Reads the part of `start..start + len` inside the mapped span. Unbacked addresses read
    /// as 0xFF.
    pub fn read_block(&mut self, start: i64, len: usize) -> Vec<u8> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let (from, to) = clamp_to_mapped(start, start.saturating_add(len));
        (from..to)
            .map(|addr| self.peek(addr).unwrap_or(0xFF))
            .collect()
    }

    pub fn write_block(&mut self, start: i64, data: &[u8]) {
        let mut addr = start;
        for &byte in data {
            self.poke(addr, byte);
            addr = addr.saturating_add(1);
        }
    }

    pub fn mmio_read(&mut self, addr: u32) -> Option<u8> {
        self.io.mmio_read(addr, &mut self.cards)
    }

    pub fn mmio_write(&mut self, addr: u32, value: u8) {
        self.io.mmio_write(addr, value, &mut self.cards)
    }

    fn card_index(slot: usize) -> Result<usize, BusError> {
        match slot {
            0 => Err(BusError::ReservedSlot),
            s if s < SLOT_COUNT => Ok(s - 1),
            s => Err(BusError::InvalidSlot(s)),
        }
    }

    pub fn get_slot(&self, slot: usize) -> Result<&SlotType, BusError> {
        Ok(&self.cards[Self::card_index(slot)?])
    }

    pub fn get_slot_mut(&mut self, slot: usize) -> Result<&mut SlotType, BusError> {
        Ok(&mut self.cards[Self::card_index(slot)?])
    }

    /// Puts `card` into `slot` and hands back what was there before.
    pub fn install(&mut self, slot: usize, card: SlotType) -> Result<SlotType, BusError> {
        let index = Self::card_index(slot)?;
        tracing::info!("[BUS] Slot {}: {}", slot, card);
        Ok(std::mem::replace(&mut self.cards[index], card))
    }

    pub fn remove(&mut self, slot: usize) -> Result<SlotType, BusError> {
        let mut card = self.install(slot, SlotType::Empty)?;
        card.dispose();
        Ok(card)
    }

    pub fn peripheral_entry(&self, slot: usize) -> Result<PeripheralEntry, BusError> {
        match slot {
            0 => Ok(PeripheralEntry {
                slot: 0,
                kind: Some("IO".to_string()),
                data_size: SLOT_SIZE,
                mmio_size: 0,
                interrupt_count: 0,
            }),
            _ => Ok(self.get_slot(slot)?.entry(slot)),
        }
    }

    pub fn peripheral_table(&self) -> Vec<PeripheralEntry> {
        (0..SLOT_COUNT)
            .filter_map(|slot| self.peripheral_entry(slot).ok())
            .collect()
    }

    pub fn reset(&mut self) {
        self.ram.reset();
        self.io.reset();
    }

    pub fn dispose(&mut self) {
        self.io.dispose();
        for card in self.cards.iter_mut() {
            card.dispose();
            *card = SlotType::Empty;
        }
        tracing::debug!("[BUS] Disposed");
    }
}
