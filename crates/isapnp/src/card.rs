//! Per-card lifecycle state and host callbacks.

use std::fmt::Write as _;

use crate::isolation::SerialIsolation;
use crate::regs::{DeviceConfig, LogicalDevice};
use crate::resources::{self, RomError};

/// Card lifecycle. Cards cycle through these states for as long as the bus
/// session lasts; there is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpState {
    /// Power-on state: ignoring everything but the initiation key.
    WaitForKey,
    /// Unlocked but not addressed.
    Sleep,
    /// Answering the bit-serial identification protocol.
    Isolation,
    /// Addressed for register access.
    Config,
}

/// Host-side hooks for one card. All callbacks run synchronously from the
/// guest port access that triggered them, in guest write order; host state
/// captured by the closures stands in for the usual opaque context pointer.
#[derive(Default)]
pub struct CardCallbacks {
    /// Fired with a freshly translated [`DeviceConfig`] whenever a logical
    /// device's activation or configuration registers change, and on reset.
    pub config_changed: Option<Box<dyn FnMut(u8, &DeviceConfig)>>,
    /// Fired whenever the card's CSN is assigned or cleared.
    pub csn_changed: Option<Box<dyn FnMut(u8)>>,
    /// Read handler for the vendor-defined registers (0x20-0x2F card-level,
    /// 0x38-0x3F and 0xF0-0xFE per logical device).
    pub vendor_read: Option<Box<dyn FnMut(u8, u8) -> u8>>,
    /// Write handler for the vendor-defined registers.
    pub vendor_write: Option<Box<dyn FnMut(u8, u8, u8)>>,
}

impl std::fmt::Debug for PnpCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PnpCard")
            .field("state", &self.state)
            .field("csn", &self.csn)
            .field("rom", &self.rom)
            .field("rom_pos", &self.rom_pos)
            .field("isolation", &self.isolation)
            .field("logical_devices", &self.logical_devices)
            .finish()
    }
}

pub(crate) struct PnpCard {
    pub(crate) state: PnpState,
    pub(crate) csn: u8,
    /// Owned copy of the card's resource ROM. Mutated in exactly two
    /// places: the trailing descriptor checksum at attach, and the ID
    /// checksum byte during isolation.
    pub(crate) rom: Vec<u8>,
    /// Resource-data read cursor.
    pub(crate) rom_pos: u16,
    pub(crate) isolation: SerialIsolation,
    pub(crate) logical_devices: Vec<LogicalDevice>,
    pub(crate) callbacks: CardCallbacks,
}

impl PnpCard {
    pub(crate) fn new(mut rom: Vec<u8>, callbacks: CardCallbacks) -> Result<Self, RomError> {
        if rom.len() < resources::RESOURCE_DATA_OFFSET + 1 {
            return Err(RomError::HeaderTooShort { len: rom.len() });
        }
        resources::finalize_checksum(&mut rom);
        let logical_devices = resources::parse(&rom)?;

        Ok(Self {
            state: PnpState::WaitForKey,
            csn: 0,
            rom,
            rom_pos: 0,
            isolation: SerialIsolation::new(),
            logical_devices,
            callbacks,
        })
    }

    /// Three-letter EISA vendor code plus the product ID digits, e.g.
    /// `BOX0001`.
    pub(crate) fn eisa_id(&self) -> String {
        let vendor = u16::from_be_bytes([self.rom[0], self.rom[1]]);
        let mut id = String::with_capacity(7);
        for shift in [10u16, 5, 0] {
            id.push(char::from(b'@' + ((vendor >> shift) & 0x1F) as u8));
        }
        let _ = write!(id, "{:02X}{:02X}", self.rom[2], self.rom[3]);
        id
    }

    /// Translate a logical device's registers and hand the record to the
    /// host, if it signed up for configuration changes.
    pub(crate) fn notify_config_changed(&mut self, ld_index: usize) {
        if self.callbacks.config_changed.is_none() {
            return;
        }
        let device = &self.logical_devices[ld_index];
        let number = device.number();
        let config = device.config();
        if let Some(callback) = self.callbacks.config_changed.as_mut() {
            callback(number, &config);
        }
    }

    pub(crate) fn notify_csn_changed(&mut self) {
        let csn = self.csn;
        if let Some(callback) = self.callbacks.csn_changed.as_mut() {
            callback(csn);
        }
    }

    /// Reset every logical device to defaults, notifying the host per
    /// device.
    pub(crate) fn reset_all_devices(&mut self) {
        for index in 0..self.logical_devices.len() {
            self.logical_devices[index].reset();
            self.notify_config_changed(index);
        }
    }
}
