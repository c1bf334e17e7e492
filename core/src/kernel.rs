//! Kernel image format detection.
//!
//! libkrun needs to be told how the kernel image is packaged. Most images can
//! be recognized from their first few bytes, so the format only has to be
//! given explicitly for unusual images.

use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const ELF_MAGIC: &[u8] = b"\x7fELF";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const PE_MAGIC: &[u8] = b"MZ";
const ZBOOT_MAGIC: &[u8] = b"zimg";
const ZBOOT_MAGIC_OFFSET: usize = 4;
const ARM64_MAGIC: &[u8] = b"ARM\x64";
const ARM64_MAGIC_OFFSET: usize = 56;

/// Bytes needed to tell every supported format apart.
pub const HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelFormat {
    Raw,
    Elf,
    PeGz,
    ImageBz2,
    ImageGz,
    ImageZstd,
}

impl KernelFormat {
    /// Numeric code used by `krun_set_kernel`.
    pub fn code(self) -> u32 {
        match self {
            KernelFormat::Raw => 0,
            KernelFormat::Elf => 1,
            KernelFormat::PeGz => 2,
            KernelFormat::ImageBz2 => 3,
            KernelFormat::ImageGz => 4,
            KernelFormat::ImageZstd => 5,
        }
    }

    pub fn detect(header: &[u8]) -> KernelFormat {
        let at = |offset: usize, magic: &[u8]| {
            header
                .get(offset..offset + magic.len())
                .is_some_and(|bytes| bytes == magic)
        };

        if at(0, ELF_MAGIC) {
            KernelFormat::Elf
        } else if at(ARM64_MAGIC_OFFSET, ARM64_MAGIC) {
            // arm64 Image with an EFI stub also starts with "MZ"
            KernelFormat::Raw
        } else if at(0, PE_MAGIC) && at(ZBOOT_MAGIC_OFFSET, ZBOOT_MAGIC) {
            KernelFormat::PeGz
        } else if at(0, GZIP_MAGIC) {
            KernelFormat::ImageGz
        } else if at(0, BZIP2_MAGIC) {
            KernelFormat::ImageBz2
        } else if at(0, ZSTD_MAGIC) {
            KernelFormat::ImageZstd
        } else {
            KernelFormat::Raw
        }
    }

    /// Reads the start of the image at `path` and detects its format.
    pub fn detect_file(path: &Path) -> std::io::Result<KernelFormat> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;
        Ok(Self::detect(&header))
    }
}

impl FromStr for KernelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(KernelFormat::Raw),
            "elf" => Ok(KernelFormat::Elf),
            "pe-gz" => Ok(KernelFormat::PeGz),
            "image-bz2" => Ok(KernelFormat::ImageBz2),
            "image-gz" => Ok(KernelFormat::ImageGz),
            "image-zstd" => Ok(KernelFormat::ImageZstd),
            other => Err(format!(
                "unknown kernel format '{}' (expected raw, elf, pe-gz, image-bz2, image-gz or image-zstd)",
                other
            )),
        }
    }
}

impl std::fmt::Display for KernelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KernelFormat::Raw => "raw",
            KernelFormat::Elf => "elf",
            KernelFormat::PeGz => "pe-gz",
            KernelFormat::ImageBz2 => "image-bz2",
            KernelFormat::ImageGz => "image-gz",
            KernelFormat::ImageZstd => "image-zstd",
        };
        write!(f, "{}", name)
    }
}
