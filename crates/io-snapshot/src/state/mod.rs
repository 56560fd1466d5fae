//! Deterministic snapshot encoding for emulated I/O devices.
//!
//! The snapshot format uses a small tag-length-value (TLV) encoding to
//! provide:
//! - deterministic byte output (fields serialize in canonical tag order)
//! - forward compatibility (unknown tags are skipped on decode)
//! - explicit versioning (major/minor) at both format and device level
//!
//! Snapshots may be loaded from untrusted sources, so decoding is bounded:
//! every multi-byte read is length-checked and structured payloads are
//! validated by the device before being applied.

pub mod codec;

use std::collections::BTreeMap;
use thiserror::Error;

/// Magic prefixing every snapshot payload.
const SNAPSHOT_MAGIC: [u8; 4] = *b"BSNP";

/// Container format version, bumped only for layout changes of the TLV
/// envelope itself.
const FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot does not start with the snapshot magic")]
    InvalidMagic,
    #[error("unsupported snapshot format version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported device snapshot major version {found} (supported: {supported})")]
    UnsupportedDeviceMajorVersion { supported: u16, found: u16 },
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
    #[error("invalid encoding for field: {0}")]
    InvalidFieldEncoding(&'static str),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Decoded snapshot envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Snapshotting contract for emulated I/O devices.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform
/// forward-compatible additions within the same major version by adding new
/// TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

pub struct SnapshotWriter {
    header: SnapshotHeader,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            header: SnapshotHeader {
                format_version: FORMAT_VERSION,
                device_id,
                device_version,
            },
            fields: BTreeMap::new(),
        }
    }

    fn field(&mut self, tag: u16, payload: Vec<u8>) {
        let prev = self.fields.insert(tag, payload);
        debug_assert!(prev.is_none(), "duplicate snapshot tag {tag}");
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field(tag, vec![value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field(tag, vec![value as u8]);
    }

    pub fn field_bytes(&mut self, tag: u16, value: Vec<u8>) {
        self.field(tag, value);
    }

    /// Serialize the envelope and all fields in canonical (ascending tag)
    /// order.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&self.header.format_version.major.to_le_bytes());
        out.extend_from_slice(&self.header.format_version.minor.to_le_bytes());
        out.extend_from_slice(&self.header.device_id);
        out.extend_from_slice(&self.header.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.header.device_version.minor.to_le_bytes());
        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for (tag, payload) in &self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }
}

#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = codec::Decoder::new(bytes);

        let magic: [u8; 4] = d
            .array()
            .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let format_version = SnapshotVersion::new(header_u16(&mut d)?, header_u16(&mut d)?);
        if format_version.major != FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedVersion {
                major: format_version.major,
                minor: format_version.minor,
            });
        }

        let device_id: [u8; 4] = d
            .array()
            .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
        let device_version = SnapshotVersion::new(header_u16(&mut d)?, header_u16(&mut d)?);
        if device_id != expected_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_id,
                found: device_id,
            });
        }

        let count = d
            .u32()
            .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let tag = d
                .u16()
                .map_err(|_| SnapshotError::Corrupt("truncated field header"))?;
            let len = d
                .u32()
                .map_err(|_| SnapshotError::Corrupt("truncated field header"))? as usize;
            let payload = d
                .bytes(len)
                .map_err(|_| SnapshotError::Corrupt("truncated field payload"))?;
            // Unknown tags are tolerated (forward compatibility); duplicates
            // are not.
            if fields.insert(tag, payload).is_some() {
                return Err(SnapshotError::Corrupt("duplicate field tag"));
            }
        }
        d.finish()
            .map_err(|_| SnapshotError::Corrupt("trailing bytes after fields"))?;

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> SnapshotHeader {
        self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        if self.header.device_version.major != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion {
                supported,
                found: self.header.device_version.major,
            });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(
        &self,
        tag: u16,
        what: &'static str,
    ) -> SnapshotResult<Option<[u8; N]>> {
        let Some(payload) = self.bytes(tag) else {
            return Ok(None);
        };
        let arr =
            <[u8; N]>::try_from(payload).map_err(|_| SnapshotError::InvalidFieldEncoding(what))?;
        Ok(Some(arr))
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8 field")?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed(tag, "u16 field")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed(tag, "u32 field")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed(tag, "u64 field")?.map(u64::from_le_bytes))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.fixed::<1>(tag, "bool field")? {
            None => Ok(None),
            Some([0]) => Ok(Some(false)),
            Some([1]) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::Corrupt("invalid bool")),
        }
    }
}

fn header_u16(d: &mut codec::Decoder<'_>) -> SnapshotResult<u16> {
    d.u16()
        .map_err(|_| SnapshotError::Corrupt("truncated header"))
}
