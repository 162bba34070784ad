use std::collections::VecDeque;

use derivative::Derivative;

use crate::block_transfer::{lock_endpoint, BlockTransferInterface, TransferState, BLOCK_SIZE};

/// How many blocks pushed by the peer may wait in a port before the oldest is dropped.
pub const RECEIVE_QUEUE_CAPACITY: usize = 256;

const SIZE_MASK: u16 = 0x0FFF;
const EMPTY_BLOCK: u16 = 0x1000;
const MORE_BLOCKS: u16 = 0x8000;

/// Size and continuation flag of one block, as packed into a 16-bit status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub len: usize,
    pub more: bool,
}

impl BlockStatus {
    pub fn new(len: usize, more: bool) -> Self {
        Self {
            len: len.min(BLOCK_SIZE),
            more,
        }
    }

    pub fn encode(&self) -> u16 {
        let size = match self.len {
            0 => EMPTY_BLOCK,
            len if len >= BLOCK_SIZE => 0,
            len => len as u16 & SIZE_MASK,
        };
        size | if self.more { MORE_BLOCKS } else { 0 }
    }

    pub fn decode(raw: u16) -> Self {
        let len = if raw & EMPTY_BLOCK != 0 {
            0
        } else {
            match (raw & SIZE_MASK) as usize {
                0 => BLOCK_SIZE,
                len => len,
            }
        };
        Self {
            len,
            more: raw & MORE_BLOCKS != 0,
        }
    }
}

/// A serial port on the I/O space: a 4096-byte transmit buffer, a 4096-byte receive buffer
/// and the queue of blocks the peer pushed in but nobody read yet.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BlockTransferPort {
    pub index: usize,
    state: TransferState,
    #[derivative(Debug = "ignore")]
    tx: Vec<u8>,
    #[derivative(Debug = "ignore")]
    rx: Vec<u8>,
    outgoing: u16,
    received: BlockStatus,
    #[derivative(Debug = "ignore")]
    inbox: VecDeque<Vec<u8>>,
}

impl BlockTransferPort {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: TransferState::new(true, false),
            tx: vec![0; BLOCK_SIZE],
            rx: vec![0; BLOCK_SIZE],
            outgoing: 0,
            received: BlockStatus::default(),
            inbox: VecDeque::new(),
        }
    }

    pub fn tx(&self) -> &[u8] {
        &self.tx
    }

    pub fn tx_mut(&mut self) -> &mut [u8] {
        &mut self.tx
    }

    pub fn rx(&self) -> &[u8] {
        &self.rx
    }

    pub fn received(&self) -> BlockStatus {
        self.received
    }

    pub fn pending_blocks(&self) -> usize {
        self.inbox.len()
    }

    /// What a read of the status register returns: the last block received.
    pub fn status_register(&self) -> u16 {
        self.received.encode()
    }

    /// Raw value the host wrote for the outgoing block.
    pub fn outgoing_register(&self) -> u16 {
        self.outgoing
    }

    pub fn outgoing(&self) -> BlockStatus {
        BlockStatus::decode(self.outgoing)
    }

    /// Status registers are written a byte at a time.
    pub fn write_status_byte(&mut self, high: bool, value: u8) {
        self.outgoing = if high {
            (self.outgoing & 0x00FF) | (u16::from(value) << 8)
        } else {
            (self.outgoing & 0xFF00) | u16::from(value)
        };
    }

    pub fn set_outgoing(&mut self, status: BlockStatus) {
        self.outgoing = status.encode();
    }

    /// Control byte as seen by the host.
    pub fn control_byte(&self) -> u8 {
        let state = &self.state;
        (u8::from(state.is_master) << 5)
            | (u8::from(state.is_slave) << 4)
            | (u8::from(state.sendmode) << 3)
            | (u8::from(state.busy) << 2)
            | (u8::from(self.are_you_ready()) << 1)
            | u8::from(self.cable_connected())
    }

    /// Applies a control byte written by the host. A set busy bit runs the transfer before
    /// returning.
    pub fn write_control_byte(&mut self, bits: u8) {
        self.set_mode(bits & 0b1000 != 0);
        self.state.ready = bits & 0b0010 != 0;

        if bits & 0b0100 != 0 {
            if self.mode() {
                tracing::debug!(
                    "[PORT {}] send {} bytes",
                    self.index,
                    self.outgoing().len
                );
                self.start_send();
            } else {
                tracing::debug!("[PORT {}] read", self.index);
                self.start_read();
            }
        }
    }

    fn store_received(&mut self, block: &[u8], more: bool) {
        let len = block.len().min(BLOCK_SIZE);
        self.rx[..len].copy_from_slice(&block[..len]);
        self.rx[len..].fill(0);
        self.received = BlockStatus::new(len, more);
    }

    /// Drops everything received from the previous peer. Called whenever the cable is pulled.
    pub fn clear_inbox(&mut self) {
        if !self.inbox.is_empty() {
            tracing::debug!(
                "[PORT {}] discarding {} unread blocks",
                self.index,
                self.inbox.len()
            );
        }
        self.inbox.clear();
        self.rx.fill(0);
        self.received = BlockStatus::default();
    }

    pub fn reset(&mut self) {
        self.tx.fill(0);
        self.rx.fill(0);
        self.outgoing = 0;
        self.received = BlockStatus::default();
        self.inbox.clear();
        self.state.sendmode = false;
        self.state.ready = true;
        self.state.busy = false;
        self.state.status_code = 0;
    }
}

impl BlockTransferInterface for BlockTransferPort {
    fn state(&self) -> &TransferState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TransferState {
        &mut self.state
    }

    fn start_send_impl(&mut self, recipient: &mut dyn BlockTransferInterface) -> usize {
        let len = self.outgoing().len;
        let reply = recipient.writeout(&self.tx[..len]);

        if let Some(reply) = reply {
            tracing::trace!("[PORT {}] inline reply of {} bytes", self.index, reply.len());
            self.store_received(&reply, false);
        }

        len
    }

    fn writeout_impl(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.inbox.len() >= RECEIVE_QUEUE_CAPACITY {
            tracing::warn!(
                "[PORT {}] receive queue full, dropping the oldest block",
                self.index
            );
            self.inbox.pop_front();
        }
        self.inbox.push_back(data[..data.len().min(BLOCK_SIZE)].to_vec());
        None
    }

    fn has_next(&self) -> bool {
        self.outgoing().more
    }

    /// Moves the next block into the receive buffer: the oldest queued one, or else whatever
    /// the peer sends when asked.
    fn start_read(&mut self) {
        self.state.begin();

        if self.inbox.is_empty() {
            if let Some(peer) = self.state.peer() {
                lock_endpoint(&peer).send_to(self);
            }
        }

        match self.inbox.pop_front() {
            Some(block) => self.store_received(&block, false),
            None => {
                tracing::trace!("[PORT {}] nothing to read", self.index);
                self.store_received(&[], false);
            }
        }

        self.received.more = !self.inbox.is_empty() || self.do_you_have_next();
        self.state.finish();
    }
}
