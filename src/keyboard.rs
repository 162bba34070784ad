use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

pub const KEYBOARD_BUFFER_SIZE: usize = 32;
pub const KEY_EVENT_SLOTS: usize = 8;

/// Keyboard side of the I/O space: the typed-character ring buffer, the set of keys held down
/// right now and the key-event snapshot taken when raw input is latched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keyboard {
    buffer: VecDeque<u8>,
    pressed: BTreeSet<u8>,
    key_events: [u8; KEY_EVENT_SLOTS],
    pub input_requested: bool,
}

impl Keyboard {
    pub fn new() -> Self {
        Keyboard::default()
    }

    /// Appends a typed byte, overwriting the oldest one when the buffer is full.
    pub fn key_typed(&mut self, key: u8) {
        if self.buffer.len() == KEYBOARD_BUFFER_SIZE {
            let dropped = self.buffer.pop_front();
            tracing::trace!("[KBD] buffer full, dropped {:?}", dropped);
        }
        self.buffer.push_back(key);
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.buffer.pop_front()
    }

    /// Entry `index` counted from the oldest buffered key.
    pub fn peek(&self, index: usize) -> Option<u8> {
        self.buffer.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn key_down(&mut self, keycode: u8) {
        self.pressed.insert(keycode);
    }

    pub fn key_up(&mut self, keycode: u8) {
        self.pressed.remove(&keycode);
    }

    /// Copies up to eight held keycodes into the key-event slots, zero-filling the rest.
    pub fn latch_key_events(&mut self) {
        self.key_events = [0; KEY_EVENT_SLOTS];
        for (slot, key) in self
            .key_events
            .iter_mut()
            .zip(self.pressed.iter().filter(|&&k| k != 0))
        {
            *slot = *key;
        }
    }

    pub fn key_event(&self, index: usize) -> u8 {
        self.key_events.get(index).copied().unwrap_or(0)
    }

    pub fn set_key_event(&mut self, index: usize, value: u8) {
        if let Some(slot) = self.key_events.get_mut(index) {
            *slot = value;
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrites_oldest() {
        let mut keyboard = Keyboard::new();
        for key in 0..(KEYBOARD_BUFFER_SIZE as u8 + 3) {
            keyboard.key_typed(key);
        }
        assert_eq!(keyboard.len(), KEYBOARD_BUFFER_SIZE);
        assert_eq!(keyboard.peek(0), Some(3));
        assert_eq!(keyboard.pop(), Some(3));
        assert_eq!(keyboard.pop(), Some(4));
    }

    #[test]
    fn test_key_events() {
        let mut keyboard = Keyboard::new();
        for key in 1..=10 {
            keyboard.key_down(key);
        }
        keyboard.key_up(1);
        keyboard.latch_key_events();

        assert_eq!(keyboard.key_event(0), 2);
        assert_eq!(keyboard.key_event(7), 9);
        assert_eq!(keyboard.key_event(8), 0);
    }
}
