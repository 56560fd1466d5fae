//! Bit-level checks of the serial isolation protocol against an
//! independently computed LFSR checksum.

use beige_isapnp::{CardCallbacks, IsaPnpBus, PnpState, INITIATION_KEY};

const ID: [u8; 8] = [0x6D, 0xF8, 0x00, 0x01, 0x78, 0x56, 0x34, 0x12];

fn rom() -> Vec<u8> {
    let mut rom = ID.to_vec();
    rom.push(0x00); // ID checksum, filled in by isolation
    rom.extend_from_slice(&[0x15, 0x6D, 0xF8, 0x00, 0x01, 0x00]); // logical device
    rom.extend_from_slice(&[0x79, 0x00]); // end tag
    rom.push(0x00); // descriptor checksum, filled in at attach
    rom
}

/// The LFSR a real card implements: seeded with the first initiation key
/// byte, shifted once per identifier bit.
fn reference_checksum(id: &[u8; 8]) -> u8 {
    let mut checksum = INITIATION_KEY[0];
    for pos in 0..64u8 {
        let bit = (id[usize::from(pos >> 3)] >> (pos & 0x07)) & 0x01;
        let feedback = ((checksum >> 1) ^ checksum ^ bit) & 0x01;
        checksum = (checksum >> 1) | (feedback << 7);
    }
    checksum
}

fn unlocked_bus() -> (IsaPnpBus, beige_isapnp::CardHandle) {
    let mut bus = IsaPnpBus::new();
    let handle = bus.attach_card(&rom(), CardCallbacks::default()).unwrap();
    for byte in INITIATION_KEY {
        bus.write_addr(byte);
    }
    (bus, handle)
}

#[test]
fn isolation_readback_reproduces_id_and_checksum() {
    let (mut bus, handle) = unlocked_bus();

    bus.write_addr(0x03); // Wake[0]
    bus.write_data(0x00);
    assert_eq!(bus.card_state(handle), PnpState::Isolation);

    bus.write_addr(0x01); // Serial Isolation

    let checksum = reference_checksum(&ID);
    let mut expected_bits = Vec::new();
    for pos in 0..64u8 {
        expected_bits.push((ID[usize::from(pos >> 3)] >> (pos & 0x07)) & 0x01);
    }
    for pos in 0..8u8 {
        expected_bits.push((checksum >> pos) & 0x01);
    }

    for (pos, bit) in expected_bits.into_iter().enumerate() {
        let first = bus.read_data();
        let second = bus.read_data();
        if bit != 0 {
            assert_eq!((first, second), (0x55, 0xAA), "bit {pos}");
        } else {
            assert_eq!((first, second), (0x00, 0x00), "bit {pos}");
        }
    }

    // The finalized checksum was published into ROM byte 8.
    assert_eq!(bus.card_rom(handle)[8], checksum);
}

#[test]
fn isolation_reads_without_an_isolating_card_float_high() {
    let (mut bus, _) = unlocked_bus();

    // Nothing woken: all cards are asleep.
    bus.write_addr(0x01);
    assert_eq!(bus.read_data(), 0xFF);
}

#[test]
fn completed_pass_rewinds_the_resource_cursor() {
    let (mut bus, handle) = unlocked_bus();

    bus.write_addr(0x03);
    bus.write_data(0x00);
    bus.write_addr(0x01);
    for _ in 0..144 {
        bus.read_data();
    }

    bus.write_addr(0x06); // Set CSN
    bus.write_data(0x01);
    assert_eq!(bus.card_state(handle), PnpState::Config);
    assert_eq!(bus.card_csn(handle), 1);

    // Resource data continues with the descriptor stream, not the header.
    bus.write_addr(0x04);
    assert_eq!(bus.read_data(), 0x15);
    assert_eq!(bus.read_data(), 0x6D);
}

#[test]
fn wake_restarts_resource_reads_from_the_header() {
    let (mut bus, handle) = unlocked_bus();

    bus.write_addr(0x03);
    bus.write_data(0x00);
    bus.write_addr(0x01);
    bus.read_data(); // partial pass

    bus.write_addr(0x06);
    bus.write_data(0x01);

    // Waking the configured card by CSN rewinds the cursor to byte 0, so
    // firmware can re-read the full header and descriptors.
    bus.write_addr(0x03);
    bus.write_data(0x01);
    assert_eq!(bus.card_state(handle), PnpState::Config);

    bus.write_addr(0x04);
    assert_eq!(bus.read_data(), ID[0]);
}

#[test]
fn resource_reads_past_the_rom_end_float_high() {
    let (mut bus, _) = unlocked_bus();

    bus.write_addr(0x03);
    bus.write_data(0x00);
    bus.write_addr(0x01);
    bus.read_data();
    bus.write_addr(0x06);
    bus.write_data(0x01);

    bus.write_addr(0x03); // Wake[1]: cursor back to 0
    bus.write_data(0x01);

    let rom_len = rom().len();
    bus.write_addr(0x04);
    for _ in 0..rom_len {
        bus.read_data(); // consume the whole ROM
    }
    assert_eq!(bus.read_data(), 0xFF);
    assert_eq!(bus.read_data(), 0xFF);
}
