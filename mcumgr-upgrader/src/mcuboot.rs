use miette::Diagnostic;
use thiserror::Error;

/// Magic value at the start of an MCUboot image header
const IMAGE_MAGIC: u32 = 0x96f3_b83d;
/// Magic value of the unprotected TLV section
const TLV_INFO_MAGIC: u16 = 0x6907;
/// Magic value of the protected TLV section
const TLV_PROT_INFO_MAGIC: u16 = 0x6908;
/// TLV type of the SHA256 over image header and body
const TLV_SHA256: u16 = 0x10;

const HEADER_SIZE: usize = 32;
const TLV_INFO_SIZE: usize = 4;
const TLV_ENTRY_HEADER_SIZE: usize = 4;

/// The firmware blob is not a parseable MCUboot image
#[derive(Error, Debug, Diagnostic)]
pub enum ImageParseError {
    /// The data ends before the structure it claims to contain
    #[error("image data is truncated")]
    #[diagnostic(code(mcumgr_upgrader::mcuboot::truncated))]
    Truncated,
    /// The data does not start with the MCUboot header magic
    #[error("invalid image header magic: 0x{0:08x}")]
    #[diagnostic(code(mcumgr_upgrader::mcuboot::header_magic))]
    InvalidHeaderMagic(u32),
    /// The TLV section does not start with a TLV info magic
    #[error("invalid TLV info magic: 0x{0:04x}")]
    #[diagnostic(code(mcumgr_upgrader::mcuboot::tlv_magic))]
    InvalidTlvMagic(u16),
    /// The image carries no SHA256 TLV
    #[error("image has no SHA256 TLV")]
    #[diagnostic(code(mcumgr_upgrader::mcuboot::hash_missing))]
    HashMissing,
    /// The SHA256 TLV has the wrong length
    #[error("SHA256 TLV has invalid length {0}")]
    #[diagnostic(code(mcumgr_upgrader::mcuboot::hash_size))]
    InvalidHashSize(u16),
}

/// Version of an MCUboot image, as written by `imgtool`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    /// major version
    pub major: u8,
    /// minor version
    pub minor: u8,
    /// revision
    pub revision: u16,
    /// build number
    pub build: u32,
}

impl std::fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// Identity of an MCUboot image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// image version from the header
    pub version: ImageVersion,
    /// SHA256 over image header and body, from the TLV section
    ///
    /// This is the hash the device reports in its slot states, so it serves
    /// as the image's identity during an upgrade.
    pub hash: [u8; 32],
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, ImageParseError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(ImageParseError::Truncated)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ImageParseError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(ImageParseError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Extracts version and identity hash from an MCUboot image.
pub fn image_info(data: &[u8]) -> Result<ImageInfo, ImageParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ImageParseError::Truncated);
    }

    let magic = read_u32(data, 0)?;
    if magic != IMAGE_MAGIC {
        return Err(ImageParseError::InvalidHeaderMagic(magic));
    }

    let hdr_size = read_u16(data, 8)? as usize;
    let protect_tlv_size = read_u16(data, 10)? as usize;
    let img_size = read_u32(data, 12)? as usize;

    let version = ImageVersion {
        major: *data.get(20).ok_or(ImageParseError::Truncated)?,
        minor: *data.get(21).ok_or(ImageParseError::Truncated)?,
        revision: read_u16(data, 22)?,
        build: read_u32(data, 24)?,
    };

    let mut offset = hdr_size
        .checked_add(img_size)
        .ok_or(ImageParseError::Truncated)?;

    // protected TLVs come first and carry their own info header
    if protect_tlv_size > 0 {
        let magic = read_u16(data, offset)?;
        if magic != TLV_PROT_INFO_MAGIC {
            return Err(ImageParseError::InvalidTlvMagic(magic));
        }
        offset = offset
            .checked_add(protect_tlv_size)
            .ok_or(ImageParseError::Truncated)?;
    }

    let magic = read_u16(data, offset)?;
    if magic != TLV_INFO_MAGIC {
        return Err(ImageParseError::InvalidTlvMagic(magic));
    }
    let tlv_total = read_u16(data, offset + 2)? as usize;
    let tlv_end = offset
        .checked_add(tlv_total)
        .ok_or(ImageParseError::Truncated)?;
    if tlv_end > data.len() {
        return Err(ImageParseError::Truncated);
    }

    offset += TLV_INFO_SIZE;
    while offset + TLV_ENTRY_HEADER_SIZE <= tlv_end {
        let tlv_type = read_u16(data, offset)?;
        let tlv_len = read_u16(data, offset + 2)?;
        offset += TLV_ENTRY_HEADER_SIZE;

        if tlv_type == TLV_SHA256 {
            if tlv_len != 32 {
                return Err(ImageParseError::InvalidHashSize(tlv_len));
            }
            let hash_bytes = data
                .get(offset..offset + 32)
                .ok_or(ImageParseError::Truncated)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(hash_bytes);
            return Ok(ImageInfo { version, hash });
        }

        offset = offset
            .checked_add(tlv_len as usize)
            .ok_or(ImageParseError::Truncated)?;
    }

    Err(ImageParseError::HashMissing)
}

/// Builds a minimal, well-formed MCUboot image around the given identity
/// hash. The payload content is arbitrary; only header and TLV structure
/// matter for parsing.
#[cfg(test)]
pub(crate) fn test_image(hash: [u8; 32]) -> Vec<u8> {
    let payload = [0x5A; 64];

    let mut image = Vec::new();
    image.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // load_addr
    image.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // protect_tlv_size
    image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.push(1); // major
    image.push(2); // minor
    image.extend_from_slice(&3u16.to_le_bytes()); // revision
    image.extend_from_slice(&4u32.to_le_bytes()); // build
    image.extend_from_slice(&0u32.to_le_bytes()); // pad
    assert_eq!(image.len(), HEADER_SIZE);

    image.extend_from_slice(&payload);

    image.extend_from_slice(&TLV_INFO_MAGIC.to_le_bytes());
    image.extend_from_slice(&((TLV_INFO_SIZE + TLV_ENTRY_HEADER_SIZE + 32) as u16).to_le_bytes());
    image.extend_from_slice(&TLV_SHA256.to_le_bytes());
    image.extend_from_slice(&32u16.to_le_bytes());
    image.extend_from_slice(&hash);

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_image() {
        let info = image_info(&test_image([7; 32])).unwrap();
        assert_eq!(info.hash, [7; 32]);
        assert_eq!(
            info.version,
            ImageVersion {
                major: 1,
                minor: 2,
                revision: 3,
                build: 4
            }
        );
        assert_eq!(info.version.to_string(), "1.2.3+4");
    }

    #[test]
    fn parses_image_with_protected_tlvs() {
        let mut image = test_image([9; 32]);

        // splice a protected TLV section between payload and regular TLVs
        let tlv_offset = image.len() - (TLV_INFO_SIZE + TLV_ENTRY_HEADER_SIZE + 32);
        let mut protected = Vec::new();
        protected.extend_from_slice(&TLV_PROT_INFO_MAGIC.to_le_bytes());
        protected.extend_from_slice(&12u16.to_le_bytes());
        protected.extend_from_slice(&0x50u16.to_le_bytes()); // arbitrary type
        protected.extend_from_slice(&4u16.to_le_bytes());
        protected.extend_from_slice(&[0xAB; 4]);
        image.splice(tlv_offset..tlv_offset, protected.iter().copied());
        image[10..12].copy_from_slice(&12u16.to_le_bytes());

        let info = image_info(&image).unwrap();
        assert_eq!(info.hash, [9; 32]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = test_image([7; 32]);
        image[0] = 0xFF;
        assert!(matches!(
            image_info(&image),
            Err(ImageParseError::InvalidHeaderMagic(_))
        ));
    }

    #[test]
    fn rejects_truncated_image() {
        let image = test_image([7; 32]);
        assert!(matches!(
            image_info(&image[..image.len() - 10]),
            Err(ImageParseError::Truncated)
        ));
        assert!(matches!(
            image_info(&[]),
            Err(ImageParseError::Truncated)
        ));
    }

    #[test]
    fn rejects_image_without_hash_tlv() {
        let hash_tlv_len = TLV_ENTRY_HEADER_SIZE + 32;
        let mut image = test_image([7; 32]);
        let tlv_info_offset = image.len() - (TLV_INFO_SIZE + hash_tlv_len);

        // retype the hash TLV so no SHA256 entry remains
        let type_offset = tlv_info_offset + TLV_INFO_SIZE;
        image[type_offset..type_offset + 2].copy_from_slice(&0x22u16.to_le_bytes());

        assert!(matches!(
            image_info(&image),
            Err(ImageParseError::HashMissing)
        ));
    }
}
