//! Full bus-session walk through the I/O port surface: key, isolation,
//! CSN assignment, logical device selection, and configuration, exactly as
//! PnP firmware would drive it.

use std::cell::RefCell;
use std::rc::Rc;

use beige_isapnp::{
    register_isapnp, CardCallbacks, DeviceConfig, IsaPnpBus, MemRange, ADDRESS_PORT,
    INITIATION_KEY, WRITE_DATA_PORT,
};
use beige_platform::io::IoPortBus;

const ID: [u8; 8] = [0x6D, 0xF8, 0x00, 0x01, 0x78, 0x56, 0x34, 0x12];
const READ_PORT: u16 = 0x203;

fn rom() -> Vec<u8> {
    let mut rom = ID.to_vec();
    rom.push(0x00);
    rom.extend_from_slice(&[0x15, 0x6D, 0xF8, 0x00, 0x01, 0x00]); // logical device 0
    rom.extend_from_slice(&[0x81, 0x09, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0]); // memory, upper limit
    rom.extend_from_slice(&[0x79, 0x00]);
    rom.push(0x00);
    rom
}

struct Harness {
    io: IoPortBus,
    configs: Rc<RefCell<Vec<(u8, DeviceConfig)>>>,
    csns: Rc<RefCell<Vec<u8>>>,
}

impl Harness {
    fn new() -> Self {
        let configs: Rc<RefCell<Vec<(u8, DeviceConfig)>>> = Rc::new(RefCell::new(Vec::new()));
        let csns: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let callbacks = CardCallbacks {
            config_changed: Some(Box::new({
                let configs = configs.clone();
                move |device, config| configs.borrow_mut().push((device, *config))
            })),
            csn_changed: Some(Box::new({
                let csns = csns.clone();
                move |csn| csns.borrow_mut().push(csn)
            })),
            ..Default::default()
        };

        let pnp = Rc::new(RefCell::new(IsaPnpBus::new()));
        pnp.borrow_mut().attach_card(&rom(), callbacks).unwrap();

        let mut io = IoPortBus::new();
        register_isapnp(&mut io, pnp);

        Self { io, configs, csns }
    }

    fn command(&mut self, reg: u8, value: u8) {
        self.io.write_u8(ADDRESS_PORT, reg);
        self.io.write_u8(WRITE_DATA_PORT, value);
    }

    fn read(&mut self, reg: u8) -> u8 {
        self.io.write_u8(ADDRESS_PORT, reg);
        self.io.read_u8(READ_PORT)
    }
}

#[test]
fn firmware_configuration_sequence() {
    let mut h = Harness::new();

    // The command ports are write-only.
    assert_eq!(h.io.read_u8(ADDRESS_PORT), 0xFF);
    assert_eq!(h.io.read_u8(WRITE_DATA_PORT), 0xFF);

    // Send the initiation key.
    for byte in INITIATION_KEY {
        h.io.write_u8(ADDRESS_PORT, byte);
    }

    // Relocate READ_DATA to 0x203 and start an isolation round.
    h.command(0x00, 0x80);
    h.command(0x03, 0x00);

    // The first isolation pair reproduces bit 0 of the identifier (set in
    // this ROM).
    h.io.write_u8(ADDRESS_PORT, 0x01);
    assert_eq!(h.io.read_u8(READ_PORT), 0x55);
    assert_eq!(h.io.read_u8(READ_PORT), 0xAA);
    for _ in 2..144 {
        h.io.read_u8(READ_PORT);
    }

    // Assign CSN 1 to the isolated card.
    h.command(0x06, 0x01);
    assert_eq!(*h.csns.borrow(), vec![1]);

    // Status reports resource data ready; the CSN reads back.
    assert_eq!(h.read(0x05), 0x01);
    assert_eq!(h.read(0x06), 0x01);

    // The descriptor stream continues after the serially transmitted
    // header.
    assert_eq!(h.read(0x04), 0x15);

    // Select logical device 0 and program the memory window.
    h.command(0x07, 0x00);
    assert_eq!(h.read(0x07), 0x00);

    h.command(0x40, 0x00);
    h.command(0x41, 0x10); // base 0x001000
    h.command(0x43, 0x00);
    h.command(0x44, 0x20); // upper limit 0x002000

    // Activate: the host sees a translated record with the upper limit
    // converted to a length.
    h.command(0x30, 0x01);
    let (device, config) = *h.configs.borrow().last().unwrap();
    assert_eq!(device, 0);
    assert!(config.activate);
    assert_eq!(config.mem[0], MemRange { base: 0x1000, size: 0x1000 });
}

#[test]
fn read_data_port_relocates_and_disables() {
    let mut h = Harness::new();
    for byte in INITIATION_KEY {
        h.io.write_u8(ADDRESS_PORT, byte);
    }
    h.command(0x03, 0x00);

    // 0x80 << 2 | 3 = 0x203.
    h.command(0x00, 0x80);
    h.io.write_u8(ADDRESS_PORT, 0x05);
    assert_eq!(h.io.read_u8(0x203), 0x00);

    // Relocate: the old address floats, the new one answers.
    h.command(0x00, 0xA5); // 0xA5 << 2 | 3 = 0x297
    h.io.write_u8(ADDRESS_PORT, 0x01);
    assert_ne!(h.io.read_u8(0x297), 0xFF);
    assert_eq!(h.io.read_u8(0x203), 0xFF);

    // A value whose decoded address falls below the window disables the
    // port entirely.
    h.command(0x00, 0x00);
    assert_eq!(h.io.read_u8(0x297), 0xFF);
}

#[test]
fn range_check_probe_answers_through_the_window() {
    let mut h = Harness::new();
    for byte in INITIATION_KEY {
        h.io.write_u8(ADDRESS_PORT, byte);
    }
    h.command(0x00, 0x80);
    h.command(0x03, 0x00);
    h.io.write_u8(ADDRESS_PORT, 0x01);
    h.io.read_u8(READ_PORT);
    h.command(0x06, 0x01);
    h.command(0x07, 0x00);

    // Configure I/O base 0x220 and enable range checking.
    h.command(0x60, 0x02);
    h.command(0x61, 0x20);
    h.command(0x31, 0x02);
    assert_eq!(h.io.read_u8(0x220), 0xAA);

    h.command(0x31, 0x03);
    assert_eq!(h.io.read_u8(0x220), 0x55);

    // Disabled: the port floats again.
    h.command(0x31, 0x00);
    assert_eq!(h.io.read_u8(0x220), 0xFF);

    // Unclaimed window ports always float.
    assert_eq!(h.io.read_u8(0x3F0), 0xFF);
}

#[test]
fn platform_reset_returns_the_bus_to_power_on() {
    let mut h = Harness::new();
    for byte in INITIATION_KEY {
        h.io.write_u8(ADDRESS_PORT, byte);
    }
    h.command(0x00, 0x80);
    h.command(0x03, 0x00);
    h.io.write_u8(ADDRESS_PORT, 0x01);
    h.io.read_u8(READ_PORT);
    h.command(0x06, 0x01);

    h.io.reset();

    // CSN cleared (with a callback), read-data port disabled, cards locked
    // behind the key again.
    assert_eq!(*h.csns.borrow(), vec![1, 0]);
    assert_eq!(h.io.read_u8(READ_PORT), 0xFF);

    // A fresh session works from scratch: the key unlocks, the port
    // relocates, and the isolation engine drives the bus again.
    for byte in INITIATION_KEY {
        h.io.write_u8(ADDRESS_PORT, byte);
    }
    h.command(0x00, 0x80);
    h.command(0x03, 0x00);
    h.io.write_u8(ADDRESS_PORT, 0x01);
    assert_ne!(h.io.read_u8(READ_PORT), 0xFF);
}
