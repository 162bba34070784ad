use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("illegal access at {0:#010x}")]
    IllegalAddress(i64),
    #[error("invalid peripheral slot {0}")]
    InvalidSlot(usize),
    #[error("slot 0 is reserved for the I/O space")]
    ReservedSlot,
    #[error("invalid block transfer port {0}")]
    InvalidPort(usize),
    #[error("a block transfer port cannot be attached to itself")]
    SelfAttach,
}

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("device not connected on port {0}")]
    DeviceNotConnected(usize),
    #[error("port {port} did not become ready within {waited:?}")]
    Timeout { port: usize, waited: Duration },
    #[error("malformed response frame on port {0}")]
    MalformedResponse(usize),
    #[error(transparent)]
    Bus(#[from] BusError),
}
