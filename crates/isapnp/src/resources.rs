//! Card resource ROM parsing.
//!
//! A card's ROM starts with a 9-byte header (packed vendor code + product
//! ID, 32-bit serial number, and a byte reserved for the isolation ID
//! checksum) followed by a stream of Plug and Play resource descriptors and
//! a trailing checksum byte. The stream is parsed once at attach time, for
//! two purposes: allocating the card's logical devices, and recording which
//! memory-range slots encode their end as an absolute upper limit rather
//! than a length. Everything else in the stream is only ever forwarded
//! verbatim to the guest through the resource-data register.

use thiserror::Error;

use crate::regs::LogicalDevice;

/// Offset of the isolation ID checksum byte within the ROM header.
pub(crate) const ID_CHECKSUM_OFFSET: usize = 8;

/// Offset of the first resource descriptor (end of the fixed header).
pub(crate) const RESOURCE_DATA_OFFSET: usize = 9;

// Large resource kinds (tag bit 7 set, kind in the low 7 bits).
const LARGE_MEM_RANGE_24: u8 = 0x01;
const LARGE_MEM_RANGE_32: u8 = 0x05;

// Small resource kinds (tag bits 6..3).
const SMALL_LOGICAL_DEVICE: u8 = 0x02;
const SMALL_START_DEPENDENT: u8 = 0x06;
const SMALL_END_DEPENDENT: u8 = 0x07;

/// Memory descriptor control byte: the range's end is an absolute upper
/// limit instead of a length.
const MEM_CONTROL_UPPER_LIMIT: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RomError {
    #[error("ROM image too short for the vendor/serial header ({len} bytes)")]
    HeaderTooShort { len: usize },
    #[error("resource item at offset {offset:#x} extends past the end of the ROM")]
    UnexpectedEnd { offset: usize },
    #[error("memory range descriptor at offset {offset:#x} is too short to carry its control byte")]
    MemoryRangeTooShort { offset: usize },
    #[error("memory range descriptor at offset {offset:#x} appears before any logical device")]
    DescriptorOutsideDevice { offset: usize },
    #[error("logical device {device} declares more than four memory ranges (tag {tag:#04x})")]
    MemoryRangeOverflow { device: u8, tag: u8 },
    #[error("ROM declares more than 256 logical devices")]
    TooManyDevices,
}

/// Finalize the trailing descriptor checksum: the two's complement of the
/// byte sum over everything between the header and the checksum byte
/// itself.
pub(crate) fn finalize_checksum(rom: &mut [u8]) {
    let checksum_offset = rom.len() - 1;
    let mut sum = 0u8;
    for &byte in &rom[RESOURCE_DATA_OFFSET..checksum_offset] {
        sum = sum.wrapping_add(byte);
    }
    rom[checksum_offset] = 0u8.wrapping_sub(sum);
}

struct RomCursor<'a> {
    rom: &'a [u8],
    pos: usize,
}

impl RomCursor<'_> {
    fn remaining(&self) -> usize {
        self.rom.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, RomError> {
        let byte = *self
            .rom
            .get(self.pos)
            .ok_or(RomError::UnexpectedEnd { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16_le(&mut self) -> Result<u16, RomError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// First byte of the current item's payload, without consuming it.
    fn peek(&self) -> Result<u8, RomError> {
        self.rom
            .get(self.pos)
            .copied()
            .ok_or(RomError::UnexpectedEnd { offset: self.pos })
    }

    fn skip(&mut self, len: usize, item_offset: usize) -> Result<(), RomError> {
        if len > self.remaining() {
            return Err(RomError::UnexpectedEnd {
                offset: item_offset,
            });
        }
        self.pos += len;
        Ok(())
    }
}

/// Decode the descriptor stream into the card's logical devices, each with
/// its upper-limit mask applied and registers reset to power-on defaults.
///
/// The stream runs from the end of the header to the byte before the
/// trailing checksum; the checksum byte itself is produced by
/// [`finalize_checksum`] and is not a descriptor.
pub(crate) fn parse(rom: &[u8]) -> Result<Vec<LogicalDevice>, RomError> {
    if rom.len() < RESOURCE_DATA_OFFSET + 1 {
        return Err(RomError::HeaderTooShort { len: rom.len() });
    }

    let mut devices: Vec<LogicalDevice> = Vec::new();
    let mut cursor = RomCursor {
        rom: &rom[..rom.len() - 1],
        pos: RESOURCE_DATA_OFFSET,
    };

    // Memory-range slot allocation within the current logical device.
    // Dependent-function alternatives describe the same slots, so the
    // counters rewind to the values captured at the first alternative.
    let mut mem_slot = 0u8;
    let mut mem32_slot = 0u8;
    let mut in_dependent = false;
    let mut dependent_restore = (0u8, 0u8);

    while cursor.remaining() > 0 {
        let item_offset = cursor.pos;
        let tag = cursor.u8()?;

        if tag & 0x80 != 0 {
            // Large item: 16-bit length follows the tag.
            let kind = tag & 0x7F;
            let len = usize::from(cursor.u16_le()?);

            match kind {
                LARGE_MEM_RANGE_24 | LARGE_MEM_RANGE_32 => {
                    if len == 0 {
                        return Err(RomError::MemoryRangeTooShort {
                            offset: item_offset,
                        });
                    }
                    let control = cursor.peek()?;
                    let device = devices.last_mut().ok_or(RomError::DescriptorOutsideDevice {
                        offset: item_offset,
                    })?;

                    let slot = if kind == LARGE_MEM_RANGE_32 {
                        &mut mem32_slot
                    } else {
                        &mut mem_slot
                    };
                    if *slot > 3 {
                        return Err(RomError::MemoryRangeOverflow {
                            device: device.number(),
                            tag,
                        });
                    }
                    let bit = if kind == LARGE_MEM_RANGE_32 {
                        1 << (4 + *slot)
                    } else {
                        1 << *slot
                    };
                    *slot += 1;

                    device.set_upper_limit_bit(bit, control & MEM_CONTROL_UPPER_LIMIT != 0);
                    cursor.skip(len, item_offset)?;
                }
                _ => cursor.skip(len, item_offset)?,
            }
        } else {
            // Small item: 3-bit length packed into the tag.
            let kind = (tag >> 3) & 0x0F;
            let len = usize::from(tag & 0x07);

            match kind {
                SMALL_LOGICAL_DEVICE => {
                    if devices.len() == 256 {
                        return Err(RomError::TooManyDevices);
                    }
                    let number = devices.len() as u8;
                    devices.push(LogicalDevice::new(number));
                    mem_slot = 0;
                    mem32_slot = 0;
                    dependent_restore = (0, 0);
                    cursor.skip(len, item_offset)?;
                }
                SMALL_START_DEPENDENT => {
                    if in_dependent {
                        (mem_slot, mem32_slot) = dependent_restore;
                    } else {
                        dependent_restore = (mem_slot, mem32_slot);
                        in_dependent = true;
                    }
                    cursor.skip(len, item_offset)?;
                }
                SMALL_END_DEPENDENT => {
                    in_dependent = false;
                    cursor.skip(len, item_offset)?;
                }
                // Compatible IDs, ANSI strings, end tags, vendor-defined
                // items and anything newer than this implementation are
                // forwarded to the guest but carry nothing we interpret.
                _ => cursor.skip(len, item_offset)?,
            }
        }
    }

    // The upper-limit mask is only complete once the whole stream has been
    // walked, so register defaults are seeded last.
    for device in &mut devices {
        device.reset();
    }

    Ok(devices)
}
