pub mod block_transfer;
pub mod bus;
pub mod config;
pub mod disk_drive;
pub mod disk_error;
pub mod error;
pub mod internal_state;
pub mod io_space;
pub mod keyboard;
pub mod machine;
pub mod memory;
pub mod port;
pub mod serial;
pub mod slot;
pub mod utils;

pub use block_transfer::{BlockTransferInterface, PeerLink, BLOCK_SIZE};
pub use bus::{Bus, Region};
pub use config::MachineConfig;
pub use disk_drive::VirtualDiskDrive;
pub use disk_error::{DeviceStatusCode, DiskError};
pub use error::{BusError, SerialError};
pub use internal_state::{InternalState, ReportState};
pub use io_space::IoSpace;
pub use machine::{Machine, MachineBuilder, SharedMachine};
pub use serial::{DeviceStatus, MmioAccess, PollConfig, SerialHelper};
pub use slot::{Peripheral, PeripheralEntry, SlotType};
pub use utils::{hexdump, init_logging};

use once_cell::sync::OnceCell;
use wasm_bindgen::prelude::*;

static WASM_LOGGING: OnceCell<()> = OnceCell::new();

#[wasm_bindgen(js_name = Machine)]
pub struct JsMachine(Machine);

#[wasm_bindgen(js_class = Machine)]
impl JsMachine {
    #[wasm_bindgen(constructor)]
    pub fn new(ram_size: u32) -> Self {
        console_error_panic_hook::set_once();
        WASM_LOGGING.get_or_init(tracing_wasm::set_as_global_default);

        Self(Machine::new(ram_size))
    }

    #[wasm_bindgen(getter, js_name = ramSize)]
    pub fn ram_size(&self) -> u32 {
        self.0.ram_size()
    }

    /// Returns `undefined` for unmapped addresses.
    pub fn peek(&mut self, addr: i32) -> Option<u8> {
        self.0.peek(i64::from(addr))
    }

    pub fn poke(&mut self, addr: i32, value: u8) {
        self.0.poke(i64::from(addr), value)
    }

    #[wasm_bindgen(js_name = keyTyped)]
    pub fn key_typed(&mut self, key: u8) {
        self.0.key_typed(key)
    }

    #[wasm_bindgen(js_name = setMouse)]
    pub fn set_mouse(&mut self, x: i16, y: i16, down: bool) {
        self.0.set_mouse(x, y, down)
    }

    /// Receive buffer of a block-transfer port.
    #[wasm_bindgen(js_name = portBuffer)]
    pub fn port_buffer(&self, port: usize) -> Result<js_sys::Uint8Array, JsError> {
        let port = self.0.port(port)?;
        let port = block_transfer::lock_endpoint(&port);
        Ok(js_sys::Uint8Array::from(port.rx()))
    }

    #[wasm_bindgen(js_name = reportState)]
    pub fn report_state(&mut self) -> Result<String, JsError> {
        self.0
            .report_state_json()
            .map_err(|err| JsError::new(&err.to_string()))
    }

    #[wasm_bindgen(js_name = memoryDump)]
    pub fn memory_dump(&mut self, start: i32, end: i32) -> String {
        self.0.memory_dump(i64::from(start), i64::from(end))
    }
}
