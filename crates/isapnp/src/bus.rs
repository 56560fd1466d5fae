//! The PnP controller: initiation key matching, bus command decode, and
//! register access dispatch.
//!
//! The controller owns every attached card. A single register index and the
//! key-match cursor are bus-wide state (one ADDRESS port serves all cards),
//! and the card currently answering isolation plus the logical device
//! addressed for register access are tracked as indices into the card
//! arena, so no cross-references can dangle.

use tracing::{debug, trace};

use crate::card::{CardCallbacks, PnpCard, PnpState};
use crate::regs::{REG_ACTIVATE, REG_IO_RANGE_CHECK};
use crate::resources::{RomError, RESOURCE_DATA_OFFSET};

/// Fixed write-only ADDRESS/key port.
pub const ADDRESS_PORT: u16 = 0x279;

/// Fixed write-only WRITE_DATA port.
pub const WRITE_DATA_PORT: u16 = 0xA79;

/// Lowest address the relocatable READ_DATA port can be placed at.
pub const READ_DATA_MIN: u16 = 0x203;

/// Highest address the relocatable READ_DATA port can be placed at.
pub const READ_DATA_MAX: u16 = 0x3FF;

/// The 32-byte initiation key. Cards in the wait-for-key state unlock only
/// after seeing this exact LFSR sequence on the ADDRESS port.
pub const INITIATION_KEY: [u8; 32] = [
    0x6A, 0xB5, 0xDA, 0xED, 0xF6, 0xFB, 0x7D, 0xBE, 0xDF, 0x6F, 0x37, 0x1B, 0x0D, 0x86, 0xC3,
    0x61, 0xB0, 0x58, 0x2C, 0x16, 0x8B, 0x45, 0xA2, 0xD1, 0xE8, 0x74, 0x3A, 0x9D, 0xCE, 0xE7,
    0x73, 0x39,
];

// Controller registers (the low part of the register index space).
const REG_SET_READ_DATA: u8 = 0x00;
const REG_SERIAL_ISOLATION: u8 = 0x01;
const REG_CONFIG_CONTROL: u8 = 0x02;
const REG_WAKE: u8 = 0x03;
const REG_RESOURCE_DATA: u8 = 0x04;
const REG_STATUS: u8 = 0x05;
const REG_CARD_SELECT_NUMBER: u8 = 0x06;
const REG_LOGICAL_DEVICE_NUMBER: u8 = 0x07;

// Config Control bits, applied low to high.
const CFG_CTRL_RESET: u8 = 0x01;
const CFG_CTRL_WAIT_FOR_KEY: u8 = 0x02;
const CFG_CTRL_RESET_CSN: u8 = 0x04;

/// Stable handle to a card attached to an [`IsaPnpBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardHandle(pub(crate) usize);

pub struct IsaPnpBus {
    /// Active register index for data port accesses.
    pub(crate) reg: u8,
    /// Initiation key cursor; 5 bits, wraps on a full match.
    pub(crate) key_pos: u8,
    /// Current READ_DATA port address, 0 while disabled.
    pub(crate) read_data_addr: u16,
    pub(crate) cards: Vec<PnpCard>,
    /// Card that last answered serial isolation (Set-CSN target).
    pub(crate) isolated_card: Option<usize>,
    /// (card, logical device) addressed for register access.
    pub(crate) current_ld: Option<(usize, usize)>,
}

impl Default for IsaPnpBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IsaPnpBus {
    pub fn new() -> Self {
        Self {
            reg: 0,
            key_pos: 0,
            read_data_addr: 0,
            cards: Vec::new(),
            isolated_card: None,
            current_ld: None,
        }
    }

    /// Attach a card. `rom` is the card's resource ROM: a 9-byte
    /// vendor/serial header (byte 8 reserved for the isolation checksum),
    /// the resource descriptor stream, and a final byte that this call
    /// overwrites with the descriptor checksum.
    pub fn attach_card(
        &mut self,
        rom: &[u8],
        callbacks: CardCallbacks,
    ) -> Result<CardHandle, RomError> {
        let card = PnpCard::new(rom.to_vec(), callbacks)?;
        debug!(
            id = %card.eisa_id(),
            devices = card.logical_devices.len(),
            "attached PnP card"
        );
        self.cards.push(card);
        Ok(CardHandle(self.cards.len() - 1))
    }

    /// Force-assign a CSN without going through isolation, for
    /// motherboard-integrated devices. Fires the csn-changed callback.
    pub fn set_csn(&mut self, handle: CardHandle, csn: u8) {
        let card = &mut self.cards[handle.0];
        card.csn = csn;
        card.notify_csn_changed();
    }

    /// Current READ_DATA port address, if the port is enabled.
    pub fn read_data_addr(&self) -> Option<u16> {
        (self.read_data_addr != 0).then_some(self.read_data_addr)
    }

    pub fn card_state(&self, handle: CardHandle) -> PnpState {
        self.cards[handle.0].state
    }

    pub fn card_csn(&self, handle: CardHandle) -> u8 {
        self.cards[handle.0].csn
    }

    /// The card's ROM as the guest sees it, including the finalized
    /// trailing checksum and, once isolation has run, the ID checksum byte.
    pub fn card_rom(&self, handle: CardHandle) -> &[u8] {
        &self.cards[handle.0].rom
    }

    /// Full power-on reset: equivalent to a Config-Control write with all
    /// three bits set, plus clearing the register index.
    pub fn reset(&mut self) {
        self.config_control(CFG_CTRL_RESET | CFG_CTRL_WAIT_FOR_KEY | CFG_CTRL_RESET_CSN);
        self.reg = 0;
    }

    /// Guest write to the ADDRESS port: feeds the key matcher while any
    /// card is still waiting for the key, otherwise sets the register index
    /// for subsequent data port accesses.
    pub fn write_addr(&mut self, value: u8) {
        if self.cards.is_empty() {
            return;
        }

        if self.cards.iter().any(|c| c.state == PnpState::WaitForKey) {
            if value == INITIATION_KEY[usize::from(self.key_pos)] {
                self.key_pos = (self.key_pos + 1) & 0x1F;
                if self.key_pos == 0 {
                    debug!("initiation key matched, cards moving to sleep");
                    for card in &mut self.cards {
                        if card.state == PnpState::WaitForKey {
                            card.state = PnpState::Sleep;
                        }
                    }
                }
            } else {
                self.key_pos = 0;
            }
        } else {
            self.reg = value;
        }
    }

    /// Guest write to the WRITE_DATA port: executes a bus command or writes
    /// the addressed register.
    pub fn write_data(&mut self, value: u8) {
        trace!(reg = self.reg, value, "write data");
        match self.reg {
            REG_SET_READ_DATA => self.set_read_data_addr((u16::from(value) << 2) | 3),
            REG_CONFIG_CONTROL => self.config_control(value),
            REG_WAKE => self.wake(value),
            REG_CARD_SELECT_NUMBER => self.assign_csn(value),
            REG_LOGICAL_DEVICE_NUMBER => self.select_logical_device(value),
            0x20..=0x2F => self.write_vendor_card(value),
            REG_ACTIVATE => self.write_activate(value),
            REG_IO_RANGE_CHECK => self.write_io_range_check(value),
            0x38..=0x3F | 0xF0..=0xFE => self.write_vendor_device(value),
            _ if self.reg >= 0x40 => self.write_device_config(value),
            _ => {}
        }
    }

    /// Guest read of the READ_DATA port, routed by the active register
    /// index.
    pub fn read_data(&mut self) -> u8 {
        let value = match self.reg {
            REG_SERIAL_ISOLATION => self.read_serial_isolation(),
            REG_RESOURCE_DATA => self.read_resource_data(),
            REG_STATUS => {
                // Resource data is always ready once a card is addressed.
                if self.first_config_card().is_some() {
                    0x01
                } else {
                    0x00
                }
            }
            REG_CARD_SELECT_NUMBER => self.first_config_card().map_or(0x00, |i| self.cards[i].csn),
            REG_LOGICAL_DEVICE_NUMBER => self
                .current_ld
                .map_or(0x00, |(c, l)| self.cards[c].logical_devices[l].number()),
            0x20..=0x2F => self.read_vendor_card(),
            0x38..=0x3F | 0xF0..=0xFE => self.read_vendor_device(),
            _ if self.reg >= 0x30 => self.read_device_reg(),
            _ => 0xFF,
        };
        trace!(reg = self.reg, value, "read data");
        value
    }

    /// Serve an I/O range-check probe read for `port`, if any logical
    /// device currently has a probe latched there.
    pub fn range_check_read(&self, port: u16) -> Option<u8> {
        for card in &self.cards {
            for device in &card.logical_devices {
                if let Some(byte) = device.range_check_read(port) {
                    return Some(byte);
                }
            }
        }
        None
    }

    fn first_config_card(&self) -> Option<usize> {
        self.cards.iter().position(|c| c.state == PnpState::Config)
    }

    fn current_device(&self) -> Option<(usize, usize)> {
        if self.current_ld.is_none() {
            debug!(reg = self.reg, "access requires a selected logical device");
        }
        self.current_ld
    }

    fn set_read_data_addr(&mut self, addr: u16) {
        if (READ_DATA_MIN..=READ_DATA_MAX).contains(&addr) {
            self.read_data_addr = addr;
            debug!(addr, "read-data port relocated");
        } else {
            // Anything outside the relocation window (including zero)
            // disables the port.
            self.read_data_addr = 0;
            debug!("read-data port disabled");
        }
    }

    fn config_control(&mut self, bits: u8) {
        if bits & CFG_CTRL_RESET != 0 {
            debug!("config control: reset");
            self.read_data_addr = 0;
            for card in &mut self.cards {
                card.reset_all_devices();
            }
            self.current_ld = None;
            self.isolated_card = None;
        }
        if bits & CFG_CTRL_WAIT_FOR_KEY != 0 {
            debug!("config control: return to wait-for-key");
            for card in &mut self.cards {
                card.state = PnpState::WaitForKey;
            }
            self.key_pos = 0;
        }
        if bits & CFG_CTRL_RESET_CSN != 0 {
            debug!("config control: reset CSNs");
            for card in &mut self.cards {
                card.csn = 0;
                card.notify_csn_changed();
            }
        }
    }

    fn wake(&mut self, csn: u8) {
        debug!(csn, "wake");
        for card in &mut self.cards {
            if card.csn == csn {
                card.rom_pos = 0;
                card.isolation.reseed();
                if card.state == PnpState::Sleep {
                    card.state = if csn == 0 {
                        PnpState::Isolation
                    } else {
                        PnpState::Config
                    };
                }
            } else {
                // Cards with a different CSN sit out this round.
                card.state = PnpState::Sleep;
            }
        }
    }

    fn assign_csn(&mut self, value: u8) {
        let Some(card_idx) = self.isolated_card.take() else {
            debug!(csn = value, "set CSN with no card under isolation");
            return;
        };
        let card = &mut self.cards[card_idx];
        card.csn = value;
        debug!(csn = value, "card select number assigned");
        card.notify_csn_changed();
        card.state = PnpState::Config;
    }

    fn select_logical_device(&mut self, number: u8) {
        let Some(card_idx) = self.first_config_card() else {
            debug!(number, "select logical device with no card in config state");
            return;
        };
        let card = &self.cards[card_idx];
        let Some(ld_idx) = card
            .logical_devices
            .iter()
            .position(|d| d.number() == number)
        else {
            panic!(
                "ISA PnP: CSN {:#04x} has no logical device {:#04x}",
                card.csn, number
            );
        };
        debug!(csn = card.csn, device = number, "logical device selected");
        self.current_ld = Some((card_idx, ld_idx));
    }

    fn write_activate(&mut self, value: u8) {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return;
        };
        let card = &mut self.cards[card_idx];
        debug!(
            csn = card.csn,
            device = card.logical_devices[ld_idx].number(),
            activate = value & 0x01,
            "activate"
        );
        card.logical_devices[ld_idx].write_activate(value);
        card.notify_config_changed(ld_idx);
    }

    fn write_io_range_check(&mut self, value: u8) {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return;
        };
        self.cards[card_idx].logical_devices[ld_idx].write_io_range_check(value);
    }

    fn write_device_config(&mut self, value: u8) {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return;
        };
        let reg = self.reg;
        let card = &mut self.cards[card_idx];
        card.logical_devices[ld_idx].write_config(reg, value);
        card.notify_config_changed(ld_idx);
    }

    fn write_vendor_card(&mut self, value: u8) {
        let reg = self.reg;
        let Some(card_idx) = self.first_config_card() else {
            debug!(reg, "vendor write with no card in config state");
            return;
        };
        let card = &mut self.cards[card_idx];
        if let Some(callback) = card.callbacks.vendor_write.as_mut() {
            // Card-global registers report logical device 0.
            callback(0, reg, value);
        }
    }

    fn write_vendor_device(&mut self, value: u8) {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return;
        };
        let reg = self.reg;
        let card = &mut self.cards[card_idx];
        let number = card.logical_devices[ld_idx].number();
        if let Some(callback) = card.callbacks.vendor_write.as_mut() {
            callback(number, reg, value);
        }
    }

    fn read_serial_isolation(&mut self) -> u8 {
        // The first card still in the isolation state answers; re-evaluated
        // on every read so Set-CSN always targets the card that actually
        // drove the bus.
        self.isolated_card = self
            .cards
            .iter()
            .position(|c| c.state == PnpState::Isolation);
        let Some(card_idx) = self.isolated_card else {
            return 0xFF;
        };
        let card = &mut self.cards[card_idx];
        let (byte, pass_complete) = card.isolation.step(&mut card.rom);
        if pass_complete {
            // The header went out bit-serially; resource reads continue
            // with the descriptor stream.
            card.rom_pos = RESOURCE_DATA_OFFSET as u16;
        }
        byte
    }

    fn read_resource_data(&mut self) -> u8 {
        let Some(card_idx) = self.first_config_card() else {
            debug!("resource data read with no card in config state");
            return 0xFF;
        };
        let card = &mut self.cards[card_idx];
        let Some(&byte) = card.rom.get(usize::from(card.rom_pos)) else {
            return 0xFF;
        };
        card.rom_pos += 1;
        byte
    }

    fn read_vendor_card(&mut self) -> u8 {
        let reg = self.reg;
        let Some(card_idx) = self.first_config_card() else {
            debug!(reg, "vendor read with no card in config state");
            return 0xFF;
        };
        let card = &mut self.cards[card_idx];
        match card.callbacks.vendor_read.as_mut() {
            Some(callback) => callback(0, reg),
            None => 0xFF,
        }
    }

    fn read_vendor_device(&mut self) -> u8 {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return 0xFF;
        };
        let reg = self.reg;
        let card = &mut self.cards[card_idx];
        let number = card.logical_devices[ld_idx].number();
        match card.callbacks.vendor_read.as_mut() {
            Some(callback) => callback(number, reg),
            None => 0xFF,
        }
    }

    fn read_device_reg(&mut self) -> u8 {
        let Some((card_idx, ld_idx)) = self.current_device() else {
            return 0xFF;
        };
        self.cards[card_idx].logical_devices[ld_idx].reg(self.reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_rom() -> Vec<u8> {
        let mut rom = vec![0x09, 0xF8, 0x00, 0x01, 0x78, 0x56, 0x34, 0x12, 0x00];
        // One logical device, then the end tag.
        rom.extend_from_slice(&[0x15, 0x09, 0xF8, 0x00, 0x01, 0x00]);
        rom.extend_from_slice(&[0x79, 0x00]);
        rom.push(0x00);
        rom
    }

    fn bus_with_card() -> (IsaPnpBus, CardHandle) {
        let mut bus = IsaPnpBus::new();
        let handle = bus
            .attach_card(&minimal_rom(), CardCallbacks::default())
            .unwrap();
        (bus, handle)
    }

    fn send_key(bus: &mut IsaPnpBus) {
        for byte in INITIATION_KEY {
            bus.write_addr(byte);
        }
    }

    #[test]
    fn key_mismatch_resets_progress() {
        let (mut bus, handle) = bus_with_card();

        // Almost the whole key, then one wrong byte.
        for byte in &INITIATION_KEY[..31] {
            bus.write_addr(*byte);
        }
        bus.write_addr(0x00);
        assert_eq!(bus.card_state(handle), PnpState::WaitForKey);

        // Progress restarted from zero: the tail of the key alone must not
        // unlock.
        bus.write_addr(INITIATION_KEY[31]);
        assert_eq!(bus.card_state(handle), PnpState::WaitForKey);

        send_key(&mut bus);
        assert_eq!(bus.card_state(handle), PnpState::Sleep);
    }

    #[test]
    fn address_port_sets_register_index_once_unlocked() {
        let (mut bus, handle) = bus_with_card();
        send_key(&mut bus);

        // The same port now carries the register index instead of key
        // bytes.
        bus.write_addr(REG_WAKE);
        bus.write_data(0x00);
        assert_eq!(bus.card_state(handle), PnpState::Isolation);
    }

    #[test]
    fn wake_routes_by_csn() {
        let (mut bus, a) = bus_with_card();
        let b = bus
            .attach_card(&minimal_rom(), CardCallbacks::default())
            .unwrap();
        send_key(&mut bus);

        bus.write_addr(REG_WAKE);
        bus.write_data(0x00);
        assert_eq!(bus.card_state(a), PnpState::Isolation);
        assert_eq!(bus.card_state(b), PnpState::Isolation);

        // Isolate and number card A, then wake it for configuration;
        // everything else returns to sleep.
        bus.write_addr(REG_SERIAL_ISOLATION);
        bus.read_data();
        bus.write_addr(REG_CARD_SELECT_NUMBER);
        bus.write_data(1);
        assert_eq!(bus.card_state(a), PnpState::Config);

        bus.write_addr(REG_WAKE);
        bus.write_data(1);
        assert_eq!(bus.card_state(a), PnpState::Config);
        assert_eq!(bus.card_state(b), PnpState::Sleep);

        bus.write_addr(REG_WAKE);
        bus.write_data(0x00);
        assert_eq!(bus.card_state(a), PnpState::Sleep);
        assert_eq!(bus.card_state(b), PnpState::Isolation);
    }

    #[test]
    fn set_csn_without_isolated_card_is_absorbed() {
        let (mut bus, handle) = bus_with_card();
        send_key(&mut bus);

        bus.write_addr(REG_CARD_SELECT_NUMBER);
        bus.write_data(5);
        assert_eq!(bus.card_csn(handle), 0);
    }

    #[test]
    fn config_control_returns_cards_to_wait_for_key() {
        let (mut bus, handle) = bus_with_card();
        send_key(&mut bus);
        assert_eq!(bus.card_state(handle), PnpState::Sleep);

        bus.write_addr(REG_CONFIG_CONTROL);
        bus.write_data(CFG_CTRL_WAIT_FOR_KEY);
        assert_eq!(bus.card_state(handle), PnpState::WaitForKey);

        // The key works again from scratch.
        send_key(&mut bus);
        assert_eq!(bus.card_state(handle), PnpState::Sleep);
    }

    #[test]
    fn programmatic_csn_assignment_fires_callback() {
        use std::cell::Cell;
        use std::rc::Rc;

        let observed = Rc::new(Cell::new(0u8));
        let callbacks = CardCallbacks {
            csn_changed: Some(Box::new({
                let observed = observed.clone();
                move |csn| observed.set(csn)
            })),
            ..Default::default()
        };

        let mut bus = IsaPnpBus::new();
        let handle = bus.attach_card(&minimal_rom(), callbacks).unwrap();
        bus.set_csn(handle, 7);
        assert_eq!(bus.card_csn(handle), 7);
        assert_eq!(observed.get(), 7);
    }

    #[test]
    #[should_panic(expected = "no logical device")]
    fn selecting_a_missing_logical_device_is_fatal() {
        let (mut bus, _) = bus_with_card();
        send_key(&mut bus);
        bus.write_addr(REG_WAKE);
        bus.write_data(0x00);
        bus.write_addr(REG_SERIAL_ISOLATION);
        bus.read_data();
        bus.write_addr(REG_CARD_SELECT_NUMBER);
        bus.write_data(1);

        bus.write_addr(REG_LOGICAL_DEVICE_NUMBER);
        bus.write_data(9);
    }
}
