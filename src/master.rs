use chrono::{DateTime, Utc};

use crate::image::{printable, Image};
use crate::Error;

/// Signature the master block must carry.
pub const MASTER_MAGIC: &[u8; 18] = b"HIKVISION@HANGZHOU";

/// The only filesystem version this parser was validated against. Other
/// versions parse best-effort with a
/// [`Warning::UnsupportedVersion`](crate::Warning::UnsupportedVersion)
/// diagnostic.
pub const SUPPORTED_VERSION: &[u8; 14] = b"HIK.2011.03.08";

/// Absolute offset of the master block in the image.
pub const MASTER_OFFSET: u64 = 0x200;

/// Length of the master block control region.
pub const MASTER_LEN: u64 = 0x160;

/// The decoded filesystem control region.
///
/// Produced once per image; all fields are copied out of the mapping.
/// The secondary index location is decoded but never walked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterBlock {
    pub signature: [u8; 18],
    pub version: [u8; 14],
    /// Total raw capacity in bytes.
    pub capacity: u64,
    pub offset_system_logs: u64,
    pub size_system_logs: u64,
    pub offset_video_area: u64,
    /// Size of every video data block in this image.
    pub size_data_block: u64,
    pub total_data_blocks: u32,
    pub offset_primary_index: u64,
    pub size_primary_index: u32,
    pub offset_secondary_index: u64,
    pub size_secondary_index: u32,
    pub time_system_init: DateTime<Utc>,
}

impl MasterBlock {
    /// Decode the fixed-layout control region at [`MASTER_OFFSET`].
    ///
    /// Fails with [`Error::BadMagic`] on a signature mismatch and
    /// [`Error::OutOfRange`] when the image is shorter than the region.
    pub fn parse(image: &Image) -> Result<Self, Error> {
        // The whole region must be present before any field decode.
        image.slice(MASTER_OFFSET, MASTER_OFFSET + MASTER_LEN)?;

        let signature: [u8; 18] = image.read_array(MASTER_OFFSET + 0x10)?;
        if &signature != MASTER_MAGIC {
            return Err(Error::BadMagic {
                found: printable(&signature),
            });
        }

        Ok(MasterBlock {
            signature,
            version: image.read_array(MASTER_OFFSET + 0x30)?,
            capacity: image.read_u64(MASTER_OFFSET + 0x48)?,
            offset_system_logs: image.read_u64(MASTER_OFFSET + 0x60)?,
            size_system_logs: image.read_u64(MASTER_OFFSET + 0x68)?,
            offset_video_area: image.read_u64(MASTER_OFFSET + 0x78)?,
            size_data_block: image.read_u64(MASTER_OFFSET + 0x88)?,
            total_data_blocks: image.read_u32(MASTER_OFFSET + 0x90)?,
            offset_primary_index: image.read_u64(MASTER_OFFSET + 0x98)?,
            size_primary_index: image.read_u32(MASTER_OFFSET + 0xA0)?,
            offset_secondary_index: image.read_u64(MASTER_OFFSET + 0xA8)?,
            size_secondary_index: image.read_u32(MASTER_OFFSET + 0xB0)?,
            time_system_init: image.read_datetime(MASTER_OFFSET + 0xF0)?,
        })
    }

    /// The on-disk version string, lossily decoded for display.
    pub fn version_string(&self) -> String {
        String::from_utf8_lossy(&self.version)
            .trim_end_matches('\0')
            .to_string()
    }

    /// The signature, lossily decoded for display.
    pub fn signature_string(&self) -> String {
        String::from_utf8_lossy(&self.signature).to_string()
    }

    pub fn is_supported_version(&self) -> bool {
        &self.version == SUPPORTED_VERSION
    }
}
