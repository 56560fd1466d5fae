//! ISA Plug and Play bus emulation.
//!
//! Implements the ISA PnP protocol used by jumperless expansion cards:
//! cards wait for a 32-byte initiation key on the ADDRESS port, are put to
//! sleep, answer the bit-serial isolation protocol on the relocatable
//! READ_DATA port so firmware can discover one card at a time, receive a
//! card select number (CSN), and then expose a 256-register configuration
//! space per logical device through which firmware assigns memory windows,
//! I/O ranges, IRQs and DMA channels.
//!
//! The protocol core is [`IsaPnpBus`]; host device models attach cards with
//! [`IsaPnpBus::attach_card`], providing the card's resource ROM and a set
//! of [`CardCallbacks`] through which they observe CSN assignment and
//! configuration changes. [`register_isapnp`] wires the bus onto a
//! [`beige_platform::io::IoPortBus`]: the fixed write-only ADDRESS (0x279)
//! and WRITE_DATA (0xA79) ports plus the READ_DATA relocation window
//! (0x203-0x3FF).

#![forbid(unsafe_code)]

mod bus;
mod card;
mod isolation;
mod ports;
mod regs;
mod resources;
mod snapshot;

pub use bus::{
    CardHandle, IsaPnpBus, ADDRESS_PORT, INITIATION_KEY, READ_DATA_MAX, READ_DATA_MIN,
    WRITE_DATA_PORT,
};
pub use card::{CardCallbacks, PnpState};
pub use ports::{register_isapnp, SharedIsaPnpBus};
pub use regs::{DeviceConfig, IrqConfig, MemRange, DMA_DISABLED};
pub use resources::RomError;
