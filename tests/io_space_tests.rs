use tracing_subscriber::fmt;
use vmbus::{
    bus::slot_address,
    io_space::{
        BLOCK_STATUS, CLOCK_LATCH, CONTROL, HYVE_END, HYVE_START, KEYBOARD_DEQUEUE,
        KEYBOARD_REQUEST, MEMSIZE, PORT_BUFFERS, RAW_INPUT_LATCH, SCRATCH_START,
    },
    keyboard::KEYBOARD_BUFFER_SIZE,
    port::BlockStatus,
    slot::{RamBank, SlotType, MMIO_SIZE},
    Machine, BLOCK_SIZE,
};

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let fmt_subscriber = fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
        .expect("Unable to set global tracing subscriber");
}

/// Bus address of I/O register `reg`.
fn io(reg: u32) -> i64 {
    slot_address(0, reg)
}

#[test]
fn test_keyboard_buffer() {
    let mut machine = Machine::new(1024);
    assert_eq!(machine.peek(io(0)), Some(0xFF));
    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(0xFF));

    machine.poke(io(KEYBOARD_REQUEST), 1);
    machine.key_typed(b'A');
    machine.key_typed(b'B');
    assert_eq!(machine.peek(io(0)), Some(b'A'));
    assert_eq!(machine.peek(io(1)), Some(b'B'));
    assert_eq!(machine.peek(io(2)), Some(0xFF));

    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(b'A'));
    assert_eq!(machine.peek(io(0)), Some(b'B'));

    // the guest can push keys back in
    machine.poke(io(KEYBOARD_DEQUEUE), b'C');
    assert_eq!(machine.peek(io(1)), Some(b'C'));
}

#[test]
fn test_keyboard_overflow() {
    let mut machine = Machine::new(1024);
    machine.poke(io(KEYBOARD_REQUEST), 1);
    for key in 1..=(KEYBOARD_BUFFER_SIZE as u8 + 5) {
        machine.key_typed(key);
    }

    assert_eq!(machine.peek(io(0)), Some(6));
    assert_eq!(
        machine.peek(io(KEYBOARD_BUFFER_SIZE as u32 - 1)),
        Some(KEYBOARD_BUFFER_SIZE as u8 + 5)
    );
}

#[test]
fn test_keyboard_request_clears() {
    let mut machine = Machine::new(1024);
    assert_eq!(machine.peek(io(KEYBOARD_REQUEST)), Some(0));

    machine.poke(io(KEYBOARD_REQUEST), 1);
    assert_eq!(machine.peek(io(KEYBOARD_REQUEST)), Some(1));
    machine.key_typed(b'x');
    assert_eq!(machine.peek(io(0)), Some(b'x'));

    // asking again starts from an empty buffer
    machine.poke(io(KEYBOARD_REQUEST), 1);
    assert_eq!(machine.peek(io(0)), Some(0xFF));

    machine.poke(io(KEYBOARD_REQUEST), 0);
    assert_eq!(machine.peek(io(KEYBOARD_REQUEST)), Some(0));
}

#[test]
fn test_keys_ignored_until_requested() {
    let mut machine = Machine::new(1024);
    machine.key_typed(b'x');
    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(0xFF));
    assert_eq!(machine.peek(io(0)), Some(0xFF));

    // the guest's own pushes do not need the request
    machine.poke(io(KEYBOARD_DEQUEUE), b'g');
    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(b'g'));

    machine.poke(io(KEYBOARD_REQUEST), 1);
    machine.key_typed(0);
    assert_eq!(machine.peek(io(0)), Some(0xFF));
    machine.key_typed(b'y');
    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(b'y'));

    // dropping the request stops the flow again
    machine.poke(io(KEYBOARD_REQUEST), 0);
    machine.key_typed(b'z');
    assert_eq!(machine.peek(io(KEYBOARD_DEQUEUE)), Some(0xFF));
}

#[test]
fn test_raw_input_latch() {
    let mut machine = Machine::new(1024);
    machine.key_down(30);
    machine.key_down(12);

    // nothing is visible until latched
    assert_eq!(machine.peek(io(40)), Some(0));
    machine.poke(io(RAW_INPUT_LATCH), 1);
    assert_eq!(machine.peek(io(RAW_INPUT_LATCH)), Some(0));
    assert_eq!(machine.peek(io(40)), Some(12));
    assert_eq!(machine.peek(io(41)), Some(30));
    assert_eq!(machine.peek(io(42)), Some(0));

    machine.key_up(12);
    machine.poke(io(RAW_INPUT_LATCH), 1);
    assert_eq!(machine.peek(io(40)), Some(30));
    assert_eq!(machine.peek(io(41)), Some(0));
}

#[test]
fn test_mouse_registers() {
    let mut machine = Machine::new(1024);
    machine.set_mouse(-2, 300, true);

    assert_eq!(machine.peek(io(32)), Some(0xFE));
    assert_eq!(machine.peek(io(33)), Some(0xFF));
    assert_eq!(machine.peek(io(34)), Some(0x2C));
    assert_eq!(machine.peek(io(35)), Some(0x01));
    assert_eq!(machine.peek(io(36)), Some(1));

    machine.set_mouse(0, 0, false);
    assert_eq!(machine.peek(io(36)), Some(0));
}

#[test]
fn test_memsize_register() {
    let mut machine = Machine::new(0x0001_2345);
    let bytes: Vec<_> = (0..4)
        .map(|i| machine.peek(io(MEMSIZE + i)).unwrap())
        .collect();
    assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0x0001_2345);

    // installed size is capped at 8 MiB
    let mut machine = Machine::new(u32::MAX);
    assert_eq!(machine.peek(io(MEMSIZE + 2)), Some(0x80));
}

#[test]
fn test_clock_registers() {
    let mut machine = Machine::new(1024);
    let read_u64 = |machine: &mut Machine, base: u32| {
        let bytes: Vec<_> = (0..8).map(|i| machine.peek(io(base + i)).unwrap()).collect();
        u64::from_le_bytes(bytes.try_into().unwrap())
    };

    assert_eq!(read_u64(&mut machine, 80), 0);
    machine.poke(io(CLOCK_LATCH), 0b11);
    assert_eq!(machine.peek(io(CLOCK_LATCH)), Some(0));

    // some time after 2020-01-01
    assert!(read_u64(&mut machine, 80) > 1_577_836_800_000);
    assert!(read_u64(&mut machine, 72) < 60_000);
}

#[test]
fn test_scratch_and_unmapped() {
    let mut machine = Machine::new(1024);
    machine.poke(io(SCRATCH_START + 5), 0x99);
    assert_eq!(machine.peek(io(SCRATCH_START + 5)), Some(0x99));

    machine.poke(io(HYVE_START), 0x5C);
    machine.poke(io(HYVE_END), 0xC5);
    assert_eq!(machine.peek(io(HYVE_START)), Some(0x5C));
    assert_eq!(machine.peek(io(HYVE_END)), Some(0xC5));

    for reg in [48, 63, 69, 88, 91, 128, 1023, 2048, 4000, 20480, MMIO_SIZE - 1] {
        assert_eq!(machine.peek(io(reg)), None, "register {}", reg);
    }
}

#[test]
fn test_control_byte_mode() {
    let mut machine = Machine::new(1024);
    machine.connect_ports(0, 1).unwrap();

    // master, peer ready, cable connected
    assert_eq!(machine.peek(io(CONTROL)), Some(0b0010_0011));

    machine.poke(io(CONTROL), 0b1010);
    assert_eq!(machine.peek(io(CONTROL)), Some(0b0010_1011));
    machine.poke(io(CONTROL), 0b0010);
    assert_eq!(machine.peek(io(CONTROL)), Some(0b0010_0011));

    // an idle port with nothing attached
    assert_eq!(machine.peek(io(CONTROL + 3)), Some(0b0010_0000));
}

#[test]
fn test_status_register_bytes() {
    let mut machine = Machine::new(1024);
    machine.connect_ports(2, 3).unwrap();

    for (i, byte) in b"abc".iter().enumerate() {
        machine.poke(io(PORT_BUFFERS + 2 * BLOCK_SIZE as u32 + i as u32), *byte);
    }
    let [low, high] = BlockStatus::new(3, false).encode().to_le_bytes();
    machine.poke(io(BLOCK_STATUS + 4), low);
    machine.poke(io(BLOCK_STATUS + 5), high);

    // send on port 2, read on port 3
    machine.poke(io(CONTROL + 2), 0b1110);
    machine.poke(io(CONTROL + 3), 0b0110);

    let status = u16::from_le_bytes([
        machine.peek(io(BLOCK_STATUS + 6)).unwrap(),
        machine.peek(io(BLOCK_STATUS + 7)).unwrap(),
    ]);
    assert_eq!(BlockStatus::decode(status), BlockStatus::new(3, false));

    let rx = PORT_BUFFERS + 3 * BLOCK_SIZE as u32;
    assert_eq!(machine.peek(io(rx)), Some(b'a'));
    assert_eq!(machine.peek(io(rx + 2)), Some(b'c'));
    assert_eq!(machine.peek(io(rx + 3)), Some(0));
}

#[test]
fn test_forwarding_window() {
    let mut machine = Machine::builder()
        .ram_size(1024)
        .ram_bank(3, 4)
        .build()
        .unwrap();

    let window = 3 * MMIO_SIZE;
    assert_eq!(machine.peek(io(window)), Some(0));
    assert_eq!(machine.peek(io(window + 1)), Some(1));

    machine.poke(slot_address(3, 0), 0x77);
    machine.poke(io(window), 2);
    assert_eq!(machine.peek(slot_address(3, 0)), Some(0));
    machine.poke(io(window), 0);
    assert_eq!(machine.peek(slot_address(3, 0)), Some(0x77));

    // the bank count wraps
    machine.poke(io(window + 1), 5);
    assert_eq!(machine.peek(io(window + 1)), Some(1));

    // an empty slot's window reads nothing
    assert_eq!(machine.peek(io(6 * MMIO_SIZE)), None);
    assert_eq!(machine.peek(io(8 * MMIO_SIZE - 1)), None);
}

#[test]
fn test_installed_card_takes_effect() {
    let mut machine = Machine::new(1024);
    assert_eq!(machine.peek(io(MMIO_SIZE)), None);

    machine
        .bus
        .install(1, SlotType::RamBank(RamBank::new(2)))
        .unwrap();
    assert_eq!(machine.peek(io(MMIO_SIZE)), Some(0));

    machine.bus.remove(1).unwrap();
    assert_eq!(machine.peek(io(MMIO_SIZE)), None);
}
