//! Port-mapped I/O dispatch.
//!
//! Device models implement [`PortIoDevice`] and are registered on an
//! [`IoPortBus`], either at an exact port or over a contiguous port range.
//! Exact registrations take precedence over range registrations, so a range
//! can serve as a decode window underneath individually claimed ports.
//! Reads that reach no device float high, matching an undriven ISA data bus.

use std::collections::BTreeMap;

pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

struct PortRange {
    start: u16,
    len: u16,
    dev: Box<dyn PortIoDevice>,
}

impl PortRange {
    fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.start && u32::from(port) < self.end_exclusive()
    }
}

#[derive(Default)]
pub struct IoPortBus {
    ports: BTreeMap<u16, Box<dyn PortIoDevice>>,
    /// Range registrations, kept sorted by start port (ranges never overlap).
    ranges: Vec<PortRange>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device at an exact port, replacing any previous exact
    /// registration for that port.
    pub fn register(&mut self, port: u16, dev: Box<dyn PortIoDevice>) {
        self.ports.insert(port, dev);
    }

    /// Remove the exact-port registration for `port`, returning the device
    /// if one was registered.
    ///
    /// Unregistering a port that was never registered is a no-op, so callers
    /// that re-derive their mappings do not need to track whether a previous
    /// mapping existed.
    pub fn unregister(&mut self, port: u16) -> Option<Box<dyn PortIoDevice>> {
        self.ports.remove(&port)
    }

    /// Register one device over a contiguous port range.
    ///
    /// Ranges may not overlap each other or wrap past the end of the 16-bit
    /// port space.
    pub fn register_range(&mut self, start: u16, len: u16, dev: Box<dyn PortIoDevice>) {
        assert!(len != 0, "empty I/O port range");

        let end_exclusive = u32::from(start) + u32::from(len);
        assert!(
            end_exclusive <= 0x1_0000,
            "I/O port range wraps past 0xffff: start={start:#06x} len={len:#x}"
        );

        let idx = self.ranges.partition_point(|r| r.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            assert!(
                u32::from(start) >= prev.end_exclusive(),
                "overlapping I/O port ranges: new=[{start:#06x}..{end_exclusive:#06x}) prev=[{:#06x}..{:#06x})",
                prev.start,
                prev.end_exclusive()
            );
        }
        if let Some(next) = self.ranges.get(idx) {
            assert!(
                end_exclusive <= u32::from(next.start),
                "overlapping I/O port ranges: new=[{start:#06x}..{end_exclusive:#06x}) next=[{:#06x}..{:#06x})",
                next.start,
                next.end_exclusive()
            );
        }

        self.ranges.insert(idx, PortRange { start, len, dev });
    }

    /// Remove the range registration that starts at `start`, if any.
    pub fn unregister_range(&mut self, start: u16) -> Option<Box<dyn PortIoDevice>> {
        let idx = self.ranges.iter().position(|r| r.start == start)?;
        Some(self.ranges.remove(idx).dev)
    }

    fn range_for(&mut self, port: u16) -> Option<&mut PortRange> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        let range = self.ranges.get_mut(idx.checked_sub(1)?)?;
        if range.contains(port) {
            Some(range)
        } else {
            None
        }
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        // Zero-sized accesses are not representable by the x86 ISA, but
        // defensive callers may still attempt them.
        if size == 0 {
            return 0;
        }

        // Port I/O instructions only support access sizes {1,2,4}. Any other
        // non-zero size is treated as an unmapped access and floats high
        // instead of being forwarded into device models.
        if !matches!(size, 1 | 2 | 4) {
            return 0xFFFF_FFFF;
        }

        if let Some(dev) = self.ports.get_mut(&port) {
            return dev.read(port, size);
        }
        if let Some(range) = self.range_for(port) {
            return range.dev.read(port, size);
        }

        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }

        if let Some(dev) = self.ports.get_mut(&port) {
            dev.write(port, size, value);
            return;
        }
        if let Some(range) = self.range_for(port) {
            range.dev.write(port, size, value);
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, u32::from(value));
    }

    /// Propagate a platform reset to every registered device.
    pub fn reset(&mut self) {
        for dev in self.ports.values_mut() {
            dev.reset();
        }
        for range in &mut self.ranges {
            range.dev.reset();
        }
    }
}
