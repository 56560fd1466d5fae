//! Snapshot support for the PnP bus.
//!
//! Only dynamic protocol state is serialized. The attached cards, their
//! ROMs, logical-device structure, and host callbacks are attach-time
//! structure: a snapshot can only be restored into a bus wired with the
//! same cards, and restore fails with a count mismatch otherwise.

use beige_io_snapshot::state::codec::{Decoder, Encoder};
use beige_io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

use crate::bus::{IsaPnpBus, READ_DATA_MAX, READ_DATA_MIN};
use crate::card::PnpState;
use crate::isolation::SerialIsolation;
use crate::resources::ID_CHECKSUM_OFFSET;

const TAG_REG: u16 = 1;
const TAG_KEY_POS: u16 = 2;
const TAG_READ_DATA_ADDR: u16 = 3;
const TAG_ISOLATED_CARD: u16 = 4;
const TAG_CURRENT_CARD: u16 = 5;
const TAG_CURRENT_DEVICE: u16 = 6;
const TAG_CARDS: u16 = 7;

const INDEX_NONE: u32 = u32::MAX;

fn encode_index(index: Option<usize>) -> u32 {
    index.map_or(INDEX_NONE, |i| i as u32)
}

fn decode_index(value: u32) -> Option<usize> {
    (value != INDEX_NONE).then_some(value as usize)
}

fn encode_state(state: PnpState) -> u8 {
    match state {
        PnpState::WaitForKey => 0,
        PnpState::Sleep => 1,
        PnpState::Isolation => 2,
        PnpState::Config => 3,
    }
}

fn decode_state(byte: u8) -> SnapshotResult<PnpState> {
    Ok(match byte {
        0 => PnpState::WaitForKey,
        1 => PnpState::Sleep,
        2 => PnpState::Isolation,
        3 => PnpState::Config,
        _ => return Err(SnapshotError::InvalidFieldEncoding("card state")),
    })
}

impl IoSnapshot for IsaPnpBus {
    const DEVICE_ID: [u8; 4] = *b"PNPB";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_REG, self.reg);
        w.field_u8(TAG_KEY_POS, self.key_pos);
        w.field_u16(TAG_READ_DATA_ADDR, self.read_data_addr);
        w.field_u32(TAG_ISOLATED_CARD, encode_index(self.isolated_card));
        w.field_u32(TAG_CURRENT_CARD, encode_index(self.current_ld.map(|(c, _)| c)));
        w.field_u32(TAG_CURRENT_DEVICE, encode_index(self.current_ld.map(|(_, d)| d)));

        // Per card: state, CSN, resource cursor, the runtime-written ID
        // checksum byte, the isolation engine, then each logical device's
        // registers and latched probe addresses.
        let mut cards = Encoder::new().u32(self.cards.len() as u32);
        for card in &self.cards {
            cards = cards
                .u8(encode_state(card.state))
                .u8(card.csn)
                .u16(card.rom_pos)
                .u8(card.rom[ID_CHECKSUM_OFFSET])
                .u8(card.isolation.checksum)
                .u8(card.isolation.read_pos)
                .bool(card.isolation.pair)
                .u8(card.isolation.last)
                .u16(card.logical_devices.len() as u16);
            for device in &card.logical_devices {
                cards = cards.bytes(&device.regs);
                for port in device.range_check_ports {
                    cards = cards.u16(port);
                }
            }
        }
        w.field_bytes(TAG_CARDS, cards.finish());

        // Callbacks and the card/device structure are attach-time wiring
        // and intentionally not serialized.
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Reset controller state, then apply saved fields. Callbacks are
        // deliberately not fired during restore: it happens into an
        // already-wired instance, and replaying configuration-changed
        // events for state the host also restored would inject spurious
        // reconfiguration edges.
        self.reg = 0;
        self.key_pos = 0;
        self.read_data_addr = 0;
        self.isolated_card = None;
        self.current_ld = None;

        if let Some(v) = r.u8(TAG_REG)? {
            self.reg = v;
        }
        if let Some(v) = r.u8(TAG_KEY_POS)? {
            if v >= 32 {
                return Err(SnapshotError::InvalidFieldEncoding("key position"));
            }
            self.key_pos = v;
        }
        if let Some(v) = r.u16(TAG_READ_DATA_ADDR)? {
            if v != 0 && !(READ_DATA_MIN..=READ_DATA_MAX).contains(&v) {
                return Err(SnapshotError::InvalidFieldEncoding("read data port"));
            }
            self.read_data_addr = v;
        }

        if let Some(buf) = r.bytes(TAG_CARDS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count != self.cards.len() {
                return Err(SnapshotError::Corrupt("card count mismatch"));
            }
            for card in &mut self.cards {
                let state = decode_state(d.u8()?)?;
                let csn = d.u8()?;
                let rom_pos = d.u16()?;
                if usize::from(rom_pos) > card.rom.len() {
                    return Err(SnapshotError::InvalidFieldEncoding("resource cursor"));
                }
                let id_checksum = d.u8()?;
                let checksum = d.u8()?;
                let read_pos = d.u8()?;
                if read_pos >= 72 {
                    return Err(SnapshotError::InvalidFieldEncoding("serial read position"));
                }
                let pair = d.bool()?;
                let last = d.u8()?;
                let device_count = usize::from(d.u16()?);
                if device_count != card.logical_devices.len() {
                    return Err(SnapshotError::Corrupt("logical device count mismatch"));
                }

                card.state = state;
                card.csn = csn;
                card.rom_pos = rom_pos;
                card.rom[ID_CHECKSUM_OFFSET] = id_checksum;
                card.isolation.checksum = checksum;
                card.isolation.read_pos = read_pos;
                card.isolation.pair = pair;
                card.isolation.last = last;
                for device in &mut card.logical_devices {
                    device.regs = d.array::<256>()?;
                    for port in &mut device.range_check_ports {
                        *port = d.u16()?;
                    }
                }
            }
            d.finish()?;
        } else {
            // Old snapshots without a card payload restore to power-on
            // defaults.
            for card in &mut self.cards {
                card.state = PnpState::WaitForKey;
                card.csn = 0;
                card.rom_pos = 0;
                card.isolation = SerialIsolation::new();
                for device in &mut card.logical_devices {
                    device.reset();
                }
            }
        }

        let isolated = r.u32(TAG_ISOLATED_CARD)?.and_then(decode_index);
        self.isolated_card = match isolated {
            Some(idx) if idx < self.cards.len() => Some(idx),
            Some(_) => return Err(SnapshotError::Corrupt("isolated card index")),
            None => None,
        };

        let current_card = r.u32(TAG_CURRENT_CARD)?.and_then(decode_index);
        let current_device = r.u32(TAG_CURRENT_DEVICE)?.and_then(decode_index);
        self.current_ld = match (current_card, current_device) {
            (Some(card_idx), Some(device_idx)) => {
                let card = self
                    .cards
                    .get(card_idx)
                    .ok_or(SnapshotError::Corrupt("current card index"))?;
                if device_idx >= card.logical_devices.len() {
                    return Err(SnapshotError::Corrupt("current device index"));
                }
                Some((card_idx, device_idx))
            }
            (None, None) => None,
            _ => return Err(SnapshotError::Corrupt("current device index")),
        };

        Ok(())
    }
}
