//! [`PortIoDevice`] adapters wiring an [`IsaPnpBus`] onto an
//! [`IoPortBus`].
//!
//! The two command ports are fixed, but the READ_DATA port is relocatable
//! at runtime and the I/O range-check probes can appear at any configured
//! I/O base. Rather than registering and unregistering handlers as the
//! guest moves them, one device covers the whole relocation window and
//! consults the live bus model on every access; ports the model does not
//! currently claim float high, and exact-port registrations by other
//! device models still take precedence by bus contract.

use std::cell::RefCell;
use std::rc::Rc;

use beige_platform::io::{IoPortBus, PortIoDevice};

use crate::bus::{IsaPnpBus, ADDRESS_PORT, READ_DATA_MAX, READ_DATA_MIN, WRITE_DATA_PORT};

pub type SharedIsaPnpBus = Rc<RefCell<IsaPnpBus>>;

/// Write-only command port (ADDRESS or WRITE_DATA).
#[derive(Clone)]
pub struct IsaPnpCommandPort {
    pnp: SharedIsaPnpBus,
    port: u16,
}

impl PortIoDevice for IsaPnpCommandPort {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        // Both command ports are write-only; reads float high.
        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        debug_assert_eq!(port, self.port);
        let value = value as u8;
        let mut pnp = self.pnp.borrow_mut();
        if self.port == ADDRESS_PORT {
            pnp.write_addr(value);
        } else {
            pnp.write_data(value);
        }
    }
}

/// Read-side window covering every address the READ_DATA port can be
/// relocated to. Also serves I/O range-check probes latched inside the
/// window.
pub struct IsaPnpReadWindow {
    pnp: SharedIsaPnpBus,
}

impl PortIoDevice for IsaPnpReadWindow {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        let mut pnp = self.pnp.borrow_mut();
        let byte = if pnp.read_data_addr() == Some(port) {
            pnp.read_data()
        } else if let Some(byte) = pnp.range_check_read(port) {
            byte
        } else {
            0xFF
        };

        // An 8-bit device only drives the low byte; the rest floats.
        match size {
            1 => u32::from(byte),
            2 => 0xFF00 | u32::from(byte),
            _ => 0xFFFF_FF00 | u32::from(byte),
        }
    }

    fn write(&mut self, _port: u16, _size: u8, _value: u32) {
        // The window is read-only; unclaimed ports swallow writes.
    }

    fn reset(&mut self) {
        // One adapter propagates platform reset to the shared bus; the
        // command ports leave reset alone so the cards are not reset three
        // times over.
        self.pnp.borrow_mut().reset();
    }
}

/// Register the PnP command ports and READ_DATA relocation window.
pub fn register_isapnp(bus: &mut IoPortBus, pnp: SharedIsaPnpBus) {
    bus.register(
        ADDRESS_PORT,
        Box::new(IsaPnpCommandPort {
            pnp: pnp.clone(),
            port: ADDRESS_PORT,
        }),
    );
    bus.register(
        WRITE_DATA_PORT,
        Box::new(IsaPnpCommandPort {
            pnp: pnp.clone(),
            port: WRITE_DATA_PORT,
        }),
    );
    bus.register_range(
        READ_DATA_MIN,
        READ_DATA_MAX - READ_DATA_MIN + 1,
        Box::new(IsaPnpReadWindow { pnp }),
    );
}
