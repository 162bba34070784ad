//! The block-transfer handshake shared by ports and the devices plugged into them.
//!
//! Both ends of a link implement [`BlockTransferInterface`]. Data always moves from the sender
//! into the receiver's [`BlockTransferInterface::writeout`]; a read is just a request for the
//! peer to start sending.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

use serde::{Deserialize, Serialize};

pub const BLOCK_SIZE: usize = 4096;

pub const GOOD_NEWS: u8 = 0x06;
pub const BAD_NEWS: u8 = 0x15;
pub const UNIT_SEP: u8 = 0x1F;
pub const END_OF_SEND_BLOCK: u8 = 0x17;

/// Shared handle to one end of a link.
pub type PeerLink = Arc<Mutex<dyn BlockTransferInterface>>;
type WeakPeer = Weak<Mutex<dyn BlockTransferInterface>>;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Handshake flags and the link to the other end.
#[derive(Debug)]
pub struct TransferState {
    id: u64,
    pub is_master: bool,
    pub is_slave: bool,
    pub ready: bool,
    pub busy: bool,
    pub sendmode: bool,
    pub block_size: usize,
    pub status_code: u8,
    peer: Option<WeakPeer>,
    peer_id: Option<u64>,
}

impl TransferState {
    pub fn new(is_master: bool, is_slave: bool) -> Self {
        Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            is_master,
            is_slave,
            ready: true,
            busy: false,
            sendmode: false,
            block_size: 0,
            status_code: 0,
            peer: None,
            peer_id: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<PeerLink> {
        self.peer.as_ref().and_then(Weak::upgrade)
    }

    pub fn peer_id(&self) -> Option<u64> {
        self.peer.as_ref().filter(|peer| peer.strong_count() > 0)?;
        self.peer_id
    }

    pub(crate) fn set_peer(&mut self, peer: Option<(&PeerLink, u64)>) {
        match peer {
            Some((link, id)) => {
                self.peer = Some(Arc::downgrade(link));
                self.peer_id = Some(id);
            }
            None => {
                self.peer = None;
                self.peer_id = None;
            }
        }
    }

    pub(crate) fn begin(&mut self) {
        self.busy = true;
        self.ready = false;
    }

    pub(crate) fn finish(&mut self) {
        self.busy = false;
        self.ready = true;
    }
}

/// One end of a block-transfer link.
///
/// Implementors provide the three `*_impl`-style hooks; the handshake bookkeeping lives in the
/// provided methods. An endpoint that is already borrowed is always handed to its peer as
/// `recipient`, so the peer never has to lock it again.
pub trait BlockTransferInterface: Send {
    fn state(&self) -> &TransferState;
    fn state_mut(&mut self) -> &mut TransferState;

    /// Pushes the staged block into `recipient` and returns how many bytes went over.
    fn start_send_impl(&mut self, recipient: &mut dyn BlockTransferInterface) -> usize;

    /// Consumes a block from the sender. A device answering a command inline returns the reply
    /// frame, which ends up in the sender's receive buffer.
    fn writeout_impl(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Whether this end still holds undrained blocks.
    fn has_next(&self) -> bool;

    /// Sends to the attached peer. Silently does nothing when no peer is attached.
    fn start_send(&mut self) {
        let Some(peer) = self.state().peer() else {
            tracing::trace!("[BTI] start_send without a peer");
            return;
        };
        let mut peer = lock_endpoint(&peer);
        self.send_to(&mut *peer);
    }

    /// Sends to an endpoint the caller already holds.
    fn send_to(&mut self, recipient: &mut dyn BlockTransferInterface) {
        self.state_mut().begin();
        let sent = self.start_send_impl(recipient);
        let state = self.state_mut();
        state.block_size = sent;
        state.finish();
    }

    /// Asks the peer to push its next block into this end. Devices are only ever pushed to,
    /// so the default does nothing.
    fn start_read(&mut self) {
        tracing::trace!("[BTI] start_read on an endpoint that does not pull");
    }

    fn writeout(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let state = self.state_mut();
        state.begin();
        state.block_size = data.len().min(BLOCK_SIZE);
        let reply = self.writeout_impl(data);
        self.state_mut().finish();
        reply
    }

    fn are_you_ready(&self) -> bool {
        self.state()
            .peer()
            .map(|peer| lock_endpoint(&peer).state().ready)
            .unwrap_or(false)
    }

    fn are_you_busy(&self) -> bool {
        self.state()
            .peer()
            .map(|peer| lock_endpoint(&peer).state().busy)
            .unwrap_or(false)
    }

    fn do_you_have_next(&self) -> bool {
        self.state()
            .peer()
            .map(|peer| lock_endpoint(&peer).has_next())
            .unwrap_or(false)
    }

    fn your_block_size(&self) -> usize {
        self.state()
            .peer()
            .map(|peer| lock_endpoint(&peer).state().block_size)
            .unwrap_or(0)
    }

    fn your_status_code(&self) -> u8 {
        self.state()
            .peer()
            .map(|peer| lock_endpoint(&peer).state().status_code)
            .unwrap_or(0)
    }

    fn set_mode(&mut self, sendmode: bool) {
        self.state_mut().sendmode = sendmode;
    }

    fn mode(&self) -> bool {
        self.state().sendmode
    }

    /// True when the peer's link points back at this end.
    fn cable_connected(&self) -> bool {
        let state = self.state();
        match state.peer() {
            Some(peer) => lock_endpoint(&peer).state().peer_id() == Some(state.id()),
            None => false,
        }
    }
}

/// Locks an endpoint, recovering the value if a previous holder panicked.
pub fn lock_endpoint<T: ?Sized>(endpoint: &Mutex<T>) -> MutexGuard<'_, T> {
    endpoint.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cross-links two endpoints. Both ends only keep weak references; whoever attached the
/// device is responsible for keeping it alive.
pub fn link(a: &PeerLink, b: &PeerLink) {
    let a_id = lock_endpoint(a).state().id();
    let b_id = lock_endpoint(b).state().id();
    lock_endpoint(a).state_mut().set_peer(Some((b, b_id)));
    lock_endpoint(b).state_mut().set_peer(Some((a, a_id)));
}

/// Breaks the link on `endpoint` and, if the peer still points back, on the peer too.
pub fn unlink(endpoint: &PeerLink) {
    let (id, peer) = {
        let mut guard = lock_endpoint(endpoint);
        let id = guard.state().id();
        let peer = guard.state().peer();
        guard.state_mut().set_peer(None);
        (id, peer)
    };

    if let Some(peer) = peer {
        let mut peer = lock_endpoint(&peer);
        if peer.state().peer_id() == Some(id) {
            peer.state_mut().set_peer(None);
        }
    }
}

/// Removes trailing NUL padding.
pub fn trim_null(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

/// Bytes are ISO-8859-1 on the wire.
pub fn latin1_to_string(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

pub fn string_to_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn compose_answer(leader: u8, fields: &[&[u8]]) -> Vec<u8> {
    let mut frame = vec![leader];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            frame.push(UNIT_SEP);
        }
        frame.extend_from_slice(field);
    }
    frame.push(END_OF_SEND_BLOCK);
    frame
}

pub fn compose_positive_answer(fields: &[&[u8]]) -> Vec<u8> {
    compose_answer(GOOD_NEWS, fields)
}

pub fn compose_negative_answer(fields: &[&[u8]]) -> Vec<u8> {
    compose_answer(BAD_NEWS, fields)
}

/// A decoded device response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub positive: bool,
    pub fields: Vec<Vec<u8>>,
}

impl Response {
    /// Parses `[ACK|NAK] field (US field)* EOB`, ignoring anything after the terminator.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let (&leader, rest) = frame.split_first()?;
        let positive = match leader {
            GOOD_NEWS => true,
            BAD_NEWS => false,
            _ => return None,
        };
        let end = rest.iter().position(|&b| b == END_OF_SEND_BLOCK)?;
        let fields = rest[..end]
            .split(|&b| b == UNIT_SEP)
            .map(<[u8]>::to_vec)
            .collect();

        Some(Self { positive, fields })
    }
}
