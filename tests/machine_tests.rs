use std::fs;

use tracing_subscriber::fmt;
use vmbus::{
    bus::{slot_address, MAPPED_HIGH, MAPPED_LOW},
    io_space::KEYBOARD_REQUEST,
    slot::{RomBank, SlotType, BANK_SIZE, SLOT_SIZE},
    BusError, InternalState, Machine, MachineBuilder, MachineConfig, ReportState,
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

#[test]
fn test_machine_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let rom_path = dir.path().join("boot.rom");
    fs::write(&rom_path, [0xC3, 0x00, 0x01]).unwrap();
    let disk_root = dir.path().join("disk");

    let json = format!(
        r#"{{
            "ram_size": 4096,
            "slots": [
                {{ "slot": 1, "kind": "ram_bank", "banks": 4 }},
                {{ "slot": 2, "kind": "rom_bank", "path": {:?} }}
            ],
            "disks": [{{ "port": 2, "root": {:?}, "name": "Boot Disk" }}],
            "serial": {{ "timeout_ms": 100 }}
        }}"#,
        rom_path.to_string_lossy(),
        disk_root.to_string_lossy()
    );
    let config = MachineConfig::from_json(&json).unwrap();
    let mut machine = MachineBuilder::from_config(&config)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(machine.ram_size(), 4096);
    assert_eq!(machine.serial().poll.timeout_ms, 100);
    assert!(disk_root.is_dir());

    let table = machine.peripheral_table();
    assert_eq!(table[1].kind.as_deref(), Some("RAMB"));
    assert_eq!(table[2].kind.as_deref(), Some("ROMB"));
    assert_eq!(table[3].kind, None);

    assert_eq!(machine.peek(slot_address(2, 0)), Some(0xC3));
    assert_eq!(machine.peek(slot_address(2, 2)), Some(0x01));

    let serial = machine.serial();
    assert!(serial.is_device_present(&mut machine.bus, 2));
    assert!(!serial.is_device_present(&mut machine.bus, 0));
}

#[test]
fn test_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machine.json");

    let mut config = MachineConfig {
        ram_size: 2048,
        strict_addressing: true,
        ..Default::default()
    };
    config.serial.interval_ms = 2;
    fs::write(&path, config.to_json().unwrap()).unwrap();

    let loaded = MachineConfig::load(&path).unwrap();
    assert_eq!(loaded, config);

    let missing = MachineConfig::load(dir.path().join("nope.json"));
    assert!(missing.is_err());
}

#[test]
fn test_missing_rom_fails_to_build() {
    let config = MachineConfig::from_json(
        r#"{ "slots": [{ "slot": 1, "kind": "rom_bank", "path": "/definitely/not/here.rom" }] }"#,
    )
    .unwrap();
    assert!(MachineBuilder::from_config(&config).is_err());
}

#[test]
fn test_builder_rejects_bad_slots() {
    let result = Machine::builder().ram_bank(0, 2).build();
    assert_eq!(result.err(), Some(BusError::ReservedSlot));

    let result = Machine::builder().empty_slot(9).build();
    assert_eq!(result.err(), Some(BusError::InvalidSlot(9)));
}

#[test]
fn test_builder_rom_and_hot_swap() {
    let mut rom = vec![0u8; BANK_SIZE as usize + 4];
    rom[BANK_SIZE as usize] = 0xAB;
    let mut machine = Machine::builder()
        .ram_size(256)
        .rom_bank(7, &rom, 2)
        .build()
        .unwrap();

    assert_eq!(machine.peek(slot_address(7, BANK_SIZE)), Some(0xAB));

    let old = machine
        .bus
        .install(7, SlotType::RomBank(RomBank::new(&[0x11], 2)))
        .unwrap();
    assert!(matches!(old, SlotType::RomBank(_)));
    assert_eq!(machine.peek(slot_address(7, 0)), Some(0x11));
}

#[test]
fn test_strict_addressing() {
    let mut lenient = Machine::new(256);
    lenient.poke(256, 1);
    assert_eq!(lenient.peek(256), None);
    assert!(!lenient.is_strict());

    let mut strict = Machine::builder()
        .ram_size(256)
        .strict_addressing(true)
        .build()
        .unwrap();
    assert!(strict.is_strict());

    // the lenient calls still answer, the fallible ones report
    assert_eq!(strict.peek(256), None);
    assert_eq!(strict.try_peek(256), Err(BusError::IllegalAddress(256)));
    let below_slots = slot_address(7, SLOT_SIZE - 1) - 1;
    assert_eq!(
        strict.try_poke(below_slots, 0),
        Err(BusError::IllegalAddress(below_slots))
    );
    assert_eq!(strict.try_poke(255, 9), Ok(()));
    assert_eq!(strict.peek(255), Some(9));
}

#[test]
fn test_memory_dump() {
    let mut machine = Machine::new(64);
    machine.load(0, b"Hello, bus!");
    machine.load(60, &[1, 2, 3, 4, 5, 6]);

    let dump = machine.memory_dump(0, 16);
    assert!(dump.starts_with("00000000: 48 65 6c 6c 6f"));
    assert!(dump.trim_end().ends_with("Hello, bus!....."));

    // bytes past the end of RAM read as 0xff
    let dump = machine.memory_dump(48, 72);
    let lines: Vec<_> = dump.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("00 00 00 00 00 00 00 00 00 00 00 00 01 02 03 04"));
    assert!(lines[1].starts_with("00000040: ff ff"));

    assert_eq!(machine.memory_dump(10, 10), "");
    assert_eq!(machine.memory_dump(10, 0), "");
}

#[test]
fn test_memory_dump_far_ranges() {
    let mut machine = Machine::new(64);
    machine.load(0, &[0xAB]);

    assert_eq!(machine.memory_dump(i64::MAX - 10, i64::MAX), "");
    assert_eq!(machine.memory_dump(i64::MIN, i64::MIN + 10), "");

    // open-ended ranges are cut down to the mapped span
    let dump = machine.memory_dump(i64::MIN, MAPPED_LOW + 16);
    assert_eq!(dump.lines().count(), 1);
    assert!(dump.starts_with(&format!("-{:07x}: ff", 8 * SLOT_SIZE)));

    let dump = machine.memory_dump(MAPPED_HIGH - 16, i64::MAX);
    assert_eq!(dump.lines().count(), 1);
    assert!(dump.starts_with(&format!("{:08x}: ff", MAPPED_HIGH - 16)));

    let dump = machine.memory_dump(-16, 16);
    assert!(dump.lines().nth(1).unwrap().starts_with("00000000: ab 00"));
}

#[test]
fn test_report_state() {
    let mut machine = Machine::builder()
        .ram_size(512)
        .ram_bank(1, 2)
        .build()
        .unwrap();
    machine.connect_ports(0, 1).unwrap();
    machine.poke(slot_address(0, KEYBOARD_REQUEST), 1);
    machine.key_typed(b'z');
    machine.set_mouse(10, -10, true);
    machine.send_message(0, b"queued").unwrap();

    let state = machine.report_state().unwrap();
    assert_eq!(state.ram_size, 512);
    assert_eq!(state.keyboard, b"z");
    assert_eq!((state.mouse_x, state.mouse_y, state.mouse_down), (10, -10, true));
    assert_eq!(state.ports.len(), 4);
    assert_eq!(state.ports[1].pending_blocks, 1);
    assert_eq!(&state.ports[0].tx[..6], b"queued");
    assert_eq!(state.peripherals[1].kind.as_deref(), Some("RAMB"));

    let json = machine.report_state_json().unwrap();
    let parsed: InternalState = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, state);
}

#[test]
fn test_reset_and_dispose() {
    let mut machine = Machine::builder()
        .ram_size(128)
        .ram_bank(2, 2)
        .build()
        .unwrap();
    machine.poke(5, 0x55);
    machine.poke(slot_address(0, KEYBOARD_REQUEST), 1);
    machine.key_typed(b'k');
    machine.connect_ports(2, 3).unwrap();

    machine.reset();
    assert_eq!(machine.peek(5), Some(0));
    assert_eq!(machine.report_state().unwrap().keyboard, Vec::<u8>::new());
    // reset leaves cards and cables alone
    assert_eq!(machine.peripheral_table()[2].kind.as_deref(), Some("RAMB"));
    assert!(machine.serial().is_device_present(&mut machine.bus, 2));

    machine.dispose();
    assert_eq!(machine.peripheral_table()[2].kind, None);
    assert!(!machine.serial().is_device_present(&mut machine.bus, 2));
}
