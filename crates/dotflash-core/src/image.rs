//! Firmware image loading and block slicing

use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum::crc32;
use crate::error::{Error, Result};

/// Extension of the optional sidecar file holding the expected CRC-32
pub const CHECKSUM_SIDECAR_EXT: &str = "crc32";

/// A validated firmware image
///
/// The contents cannot be modified once loaded; `size` and `checksum`
/// always describe `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    checksum: u32,
}

impl FirmwareImage {
    /// Build an image from memory
    ///
    /// `declared` is the expected checksum, if one is known. `capacity` is the
    /// largest image the target can hold.
    pub fn from_bytes(data: Vec<u8>, declared: Option<u32>, capacity: u32) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        if data.len() > capacity as usize {
            return Err(Error::InvalidImage(format!(
                "image is {} bytes, device flash holds {} bytes",
                data.len(),
                capacity
            )));
        }

        let checksum = crc32(&data);
        if let Some(expected) = declared {
            if expected != checksum {
                return Err(Error::InvalidImage(format!(
                    "checksum mismatch: declared 0x{:08X}, computed 0x{:08X}",
                    expected, checksum
                )));
            }
        }

        Ok(Self { data, checksum })
    }

    /// Image contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// CRC-32 of the image contents
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Number of blocks of `block_size` needed to hold the image
    pub fn block_count(&self, block_size: usize) -> usize {
        self.data.len().div_ceil(block_size)
    }

    /// Split the image into transfer blocks
    ///
    /// The last block may be shorter than `block_size`.
    pub fn blocks(&self, block_size: usize) -> impl Iterator<Item = TransferBlock<'_>> {
        self.data
            .chunks(block_size)
            .enumerate()
            .map(move |(i, chunk)| TransferBlock::new(i as u32, (i * block_size) as u32, chunk))
    }
}

/// One chunk of an image as sent to the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBlock<'a> {
    /// Sequence number, starting at 0
    pub index: u32,
    /// Byte offset within the image
    pub offset: u32,
    /// Block payload
    pub data: &'a [u8],
    /// CRC-32 of the payload
    pub checksum: u32,
}

impl<'a> TransferBlock<'a> {
    /// Create a block, computing its checksum
    pub fn new(index: u32, offset: u32, data: &'a [u8]) -> Self {
        Self {
            index,
            offset,
            data,
            checksum: crc32(data),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this block
    pub fn end(&self) -> u32 {
        self.offset + self.len()
    }
}

/// Loads and validates firmware images from storage
#[derive(Debug, Clone)]
pub struct ImageReader {
    capacity: u32,
    expected_checksum: Option<u32>,
}

impl ImageReader {
    /// Create a reader for a device with the given flash capacity
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            expected_checksum: None,
        }
    }

    /// Require the image to have this CRC-32
    pub fn with_expected_checksum(mut self, checksum: Option<u32>) -> Self {
        self.expected_checksum = checksum;
        self
    }

    /// Load an image from `path`
    ///
    /// The declared checksum is the one given to the reader, or else the
    /// contents of `<path>.crc32` if that file exists.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<FirmwareImage> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            Error::InvalidImage(format!("cannot read {}: {}", path.display(), e))
        })?;

        let declared = match self.expected_checksum {
            Some(crc) => Some(crc),
            None => read_sidecar_checksum(path)?,
        };

        let image = FirmwareImage::from_bytes(data, declared, self.capacity)?;
        log::info!(
            "Loaded {} ({} bytes, CRC32 0x{:08X})",
            path.display(),
            image.size(),
            image.checksum()
        );
        Ok(image)
    }
}

/// Path of the checksum sidecar for an image
pub fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".");
    name.push(CHECKSUM_SIDECAR_EXT);
    PathBuf::from(name)
}

fn read_sidecar_checksum(image: &Path) -> Result<Option<u32>> {
    let sidecar = sidecar_path(image);
    if !sidecar.is_file() {
        return Ok(None);
    }

    let text = fs::read_to_string(&sidecar).map_err(|e| {
        Error::InvalidImage(format!("cannot read {}: {}", sidecar.display(), e))
    })?;
    let crc = parse_checksum(&text).map_err(|e| {
        Error::InvalidImage(format!("{}: {}", sidecar.display(), e))
    })?;
    log::debug!("Declared checksum 0x{:08X} from {}", crc, sidecar.display());
    Ok(Some(crc))
}

/// Parse a CRC-32 written as hex, with or without a `0x` prefix
pub fn parse_checksum(s: &str) -> core::result::Result<u32, String> {
    let s = s.trim();
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() || hex.len() > 8 {
        return Err(format!("invalid CRC32 '{}'", s));
    }
    u32::from_str_radix(hex, 16).map_err(|e| format!("invalid CRC32 '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_image(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_load_roundtrip_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let path = write_image(&dir, "fw.bin", &data);

        let reader = ImageReader::new(256 * 1024);
        let image = reader.load(&path).unwrap();
        assert_eq!(image.size(), 5000);
        assert_eq!(image.checksum(), crc32(image.data()));

        // Loading again yields the same image and leaves the file intact
        let again = reader.load(&path).unwrap();
        assert_eq!(image, again);
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_load_rejects_empty_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "empty.bin", &[]);
        let reader = ImageReader::new(1024);

        assert!(matches!(reader.load(&path), Err(Error::InvalidImage(_))));
        assert!(matches!(
            reader.load(dir.path().join("missing.bin")),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_load_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "big.bin", &[0xAA; 2048]);
        let reader = ImageReader::new(1024);
        assert!(matches!(reader.load(&path), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_sidecar_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"firmware contents".to_vec();
        let path = write_image(&dir, "fw.bin", &data);
        let reader = ImageReader::new(1024);

        fs::write(sidecar_path(&path), format!("0x{:08x}\n", crc32(&data))).unwrap();
        assert!(reader.load(&path).is_ok());

        fs::write(sidecar_path(&path), "12345678").unwrap();
        assert!(matches!(reader.load(&path), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_expected_checksum_overrides_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"abc".to_vec();
        let path = write_image(&dir, "fw.bin", &data);
        fs::write(sidecar_path(&path), "00000000").unwrap();

        let reader = ImageReader::new(1024).with_expected_checksum(Some(crc32(&data)));
        assert!(reader.load(&path).is_ok());

        let reader = ImageReader::new(1024).with_expected_checksum(Some(0x1234));
        assert!(matches!(reader.load(&path), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_blocks() {
        let data: Vec<u8> = (0..10u8).collect();
        let image = FirmwareImage::from_bytes(data, None, 1024).unwrap();
        let blocks: Vec<_> = image.blocks(4).collect();

        assert_eq!(image.block_count(4), 3);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 4);
        assert_eq!(blocks[2].index, 2);
        assert_eq!(blocks[2].data, &[8, 9]);
        assert_eq!(blocks[2].end(), 10);
        assert_eq!(blocks[1].checksum, crc32(&[4, 5, 6, 7]));
    }

    #[test]
    fn test_parse_checksum() {
        assert_eq!(parse_checksum("0xCBF43926"), Ok(0xCBF4_3926));
        assert_eq!(parse_checksum(" cbf43926 \n"), Ok(0xCBF4_3926));
        assert!(parse_checksum("").is_err());
        assert!(parse_checksum("0x123456789").is_err());
        assert!(parse_checksum("xyz").is_err());
    }
}
