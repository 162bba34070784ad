use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{
    block_transfer::{lock_endpoint, BlockTransferInterface, BLOCK_SIZE},
    bus::Bus,
    port::BlockTransferPort,
    slot::PeripheralEntry,
};

/// Snapshot of one block-transfer port.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortState {
    pub index: usize,
    pub control: u8,
    pub status: u16,
    pub outgoing: u16,
    pub status_code: u8,
    pub peer_status_code: u8,
    pub pending_blocks: usize,

    #[serde(with = "BigArray")]
    pub rx: [u8; BLOCK_SIZE],
    #[serde(with = "BigArray")]
    pub tx: [u8; BLOCK_SIZE],
}

impl PortState {
    pub fn capture(port: &BlockTransferPort) -> Self {
        let mut rx = [0; BLOCK_SIZE];
        rx.copy_from_slice(port.rx());
        let mut tx = [0; BLOCK_SIZE];
        tx.copy_from_slice(port.tx());

        Self {
            index: port.index,
            control: port.control_byte(),
            status: port.status_register(),
            outgoing: port.outgoing_register(),
            status_code: port.state().status_code,
            peer_status_code: port.your_status_code(),
            pending_blocks: port.pending_blocks(),
            rx,
            tx,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InternalState {
    pub ram_size: u32,

    // input
    pub keyboard: Vec<u8>,
    pub mouse_x: i16,
    pub mouse_y: i16,
    pub mouse_down: bool,

    // clocks, as last latched
    pub uptime_ms: u64,
    pub rtc_ms: u64,

    pub ports: Vec<PortState>,
    pub peripherals: Vec<PeripheralEntry>,
}

pub trait ReportState {
    fn report_state(&mut self) -> anyhow::Result<InternalState>;
}

impl ReportState for Bus {
    fn report_state(&mut self) -> anyhow::Result<InternalState> {
        let io = &self.io;
        let ports = io
            .ports()
            .iter()
            .map(|port| PortState::capture(&lock_endpoint(port)))
            .collect();

        Ok(InternalState {
            ram_size: self.ram_size(),
            keyboard: io.keyboard.snapshot(),
            mouse_x: io.mouse_x,
            mouse_y: io.mouse_y,
            mouse_down: io.mouse_down,
            uptime_ms: io.uptime_ms(),
            rtc_ms: io.rtc_ms(),
            ports,
            peripherals: self.peripheral_table(),
        })
    }
}
