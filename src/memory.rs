use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// Hard ceiling for the user RAM arena. The region `[0, USER_SPACE_SIZE)` is reserved for
/// user memory even when less is installed.
pub const USER_SPACE_SIZE: u32 = 8192 * 1024;

/// Contiguous user RAM. Offsets are arena-relative; the bus does the address translation.
#[derive(Derivative, Serialize, Deserialize)]
#[derivative(Clone, Debug, PartialEq)]
pub struct UserRam {
    size: u32,
    #[derivative(Debug = "ignore")]
    pub data: Vec<u8>,
}

impl Default for UserRam {
    fn default() -> Self {
        Self::new(USER_SPACE_SIZE)
    }
}

impl UserRam {
    pub fn new(size: u32) -> Self {
        let size = size.min(USER_SPACE_SIZE);
        Self {
            size,
            data: vec![0; size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    pub fn read_byte(&self, offset: u32) -> Option<u8> {
        self.data.get(offset as usize).copied()
    }

    pub fn write_byte(&mut self, offset: u32, value: u8) -> bool {
        match self.data.get_mut(offset as usize) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Copies `data` starting at `offset`, clipped at the end of the arena.
    /// Returns the number of bytes written.
    pub fn load(&mut self, offset: u32, data: &[u8]) -> usize {
        let start = (offset as usize).min(self.data.len());
        let end = (start + data.len()).min(self.data.len());
        self.data[start..end].copy_from_slice(&data[..end - start]);
        end - start
    }

    pub fn slice(&self, start: u32, end: u32) -> &[u8] {
        let end = (end as usize).min(self.data.len());
        let start = (start as usize).min(end);
        &self.data[start..end]
    }
}
