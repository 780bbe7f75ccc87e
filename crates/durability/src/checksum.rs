//! SFV-style snapshot checksums
//!
//! A [`ChecksumSet`] records one CRC32C per file plus a combined CRC32C folded
//! over `(file name bytes, file content bytes)` for every file. The combined
//! value depends on file order, so files are always visited in the fixed
//! order of [`sorted_file_names`]: lexicographic, with the metadata file last.
//!
//! # File format
//!
//! ```text
//! ; This is an SFV checksum file for all files in the given directory.
//! ; You might use cksfv or another SFV tool to validate the files.
//! ; This file was automatically generated by snapstore.
//! ;
//! ; combinedValue = 8f3a91c2
//! ; number of files used for combined value = 3
//! ;
//! 000001.sst   1c291ca3
//! CURRENT   0d4a1185
//! zeebe.metadata   6b9f2e10
//! ```
//!
//! Older stores wrote only the combined value as 8 raw big-endian bytes;
//! [`ChecksumSet::read_from`] still accepts that form.
//!
//! # Crash Safety
//!
//! The checksum file is the commit marker of a snapshot. [`ChecksumSet::persist`]
//! writes it to a temporary path, fsyncs, and renames it into place, so the
//! marker is either complete or absent.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use snapstore_core::is_metadata_file;

use crate::paths::{list_file_names, sync_dir, tmp_path};

/// Default read block size when checksumming files
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const COMBINED_VALUE_PREFIX: &str = "; combinedValue = ";
const FILE_COUNT_PREFIX: &str = "; number of files used for combined value = ";
const SEPARATOR: &str = "   ";
const LEGACY_FORMAT_LEN: usize = 8;

/// Per-file and combined CRC32C checksums of a snapshot directory
#[derive(Debug, Clone, Default)]
pub struct ChecksumSet {
    combined: u32,
    checksums: BTreeMap<String, u32>,
    legacy: bool,
}

impl ChecksumSet {
    /// Create an empty checksum set
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum every file directly inside `dir`, in the fixed file order
    pub fn for_directory(dir: &Path, block_size: usize) -> Result<Self, ChecksumError> {
        let mut checksum = ChecksumSet::new();
        for name in sorted_file_names(list_file_names(dir)?) {
            checksum.update_from_file(&dir.join(&name), block_size)?;
        }
        Ok(checksum)
    }

    /// Checksum every file inside `dir` except the metadata file
    ///
    /// Used while the metadata file is still to be written; it is folded in
    /// last with [`ChecksumSet::update_from_bytes`].
    pub fn for_directory_without_metadata(dir: &Path, block_size: usize) -> Result<Self, ChecksumError> {
        let mut checksum = ChecksumSet::new();
        for name in sorted_file_names(list_file_names(dir)?) {
            if !is_metadata_file(&name) {
                checksum.update_from_file(&dir.join(&name), block_size)?;
            }
        }
        Ok(checksum)
    }

    /// Fold a file into the set, streaming it in `block_size` blocks
    pub fn update_from_file(&mut self, path: &Path, block_size: usize) -> Result<(), ChecksumError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ChecksumError::InvalidFileName(path.display().to_string()))?;

        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; block_size.max(1)];
        let mut combined = crc32c::crc32c_append(self.combined, name.as_bytes());
        let mut file_crc = 0u32;

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            combined = crc32c::crc32c_append(combined, &buffer[..read]);
            file_crc = crc32c::crc32c_append(file_crc, &buffer[..read]);
        }

        self.combined = combined;
        self.checksums.insert(name, file_crc);
        Ok(())
    }

    /// Fold in-memory file content into the set
    pub fn update_from_bytes(&mut self, name: &str, content: &[u8]) {
        self.combined = crc32c::crc32c_append(self.combined, name.as_bytes());
        self.combined = crc32c::crc32c_append(self.combined, content);
        self.checksums
            .insert(name.to_string(), crc32c::crc32c(content));
    }

    /// Combined checksum over all files
    pub fn combined_value(&self) -> u32 {
        self.combined
    }

    /// Per-file checksums by file name
    pub fn file_checksums(&self) -> &BTreeMap<String, u32> {
        &self.checksums
    }

    /// Checksum of one file, if recorded
    pub fn file_checksum(&self, name: &str) -> Option<u32> {
        self.checksums.get(name).copied()
    }

    /// True if only the combined value is known (legacy format)
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Compare against another set
    ///
    /// Per-file maps decide; the combined value is only compared when either
    /// side was read from the legacy format and has no per-file entries.
    pub fn matches(&self, other: &ChecksumSet) -> bool {
        if self.legacy || other.legacy {
            return self.combined == other.combined;
        }
        self.checksums == other.checksums
    }

    /// Write the text format
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "; This is an SFV checksum file for all files in the given directory.")?;
        writeln!(out, "; You might use cksfv or another SFV tool to validate the files.")?;
        writeln!(out, "; This file was automatically generated by snapstore.")?;
        writeln!(out, ";")?;
        writeln!(out, "{}{:08x}", COMBINED_VALUE_PREFIX, self.combined)?;
        writeln!(out, "{}{}", FILE_COUNT_PREFIX, self.checksums.len())?;
        writeln!(out, ";")?;
        let names = sorted_file_names(self.checksums.keys().cloned().collect());
        for name in names {
            writeln!(out, "{}{}{:08x}", name, SEPARATOR, self.checksums[&name])?;
        }
        Ok(())
    }

    /// Serialize to bytes in the text format
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Parse either the text format or the legacy 8-byte format
    pub fn read_from(bytes: &[u8]) -> Result<Self, ChecksumError> {
        if bytes.len() == LEGACY_FORMAT_LEN && bytes[0] != b';' {
            let mut raw = [0u8; LEGACY_FORMAT_LEN];
            raw.copy_from_slice(bytes);
            let value = u64::from_be_bytes(raw);
            let combined =
                u32::try_from(value).map_err(|_| ChecksumError::InvalidLegacyValue(value))?;
            return Ok(ChecksumSet {
                combined,
                checksums: BTreeMap::new(),
                legacy: true,
            });
        }

        let text = std::str::from_utf8(bytes).map_err(|_| ChecksumError::Parse {
            line: 0,
            reason: "checksum file is not UTF-8".to_string(),
        })?;
        Self::update_from_sfv(text)
    }

    /// Parse the text format
    pub fn update_from_sfv(text: &str) -> Result<Self, ChecksumError> {
        let mut combined = None;
        let mut checksums = BTreeMap::new();

        for (number, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(hex) = line.strip_prefix(COMBINED_VALUE_PREFIX) {
                combined = Some(parse_hex(hex.trim(), number + 1)?);
                continue;
            }
            if line.starts_with(';') {
                continue;
            }

            let (name, hex) = line
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| ChecksumError::Parse {
                    line: number + 1,
                    reason: format!("expected '<file>{}<crc>'", SEPARATOR),
                })?;
            let name = name.trim_end();
            if name.is_empty() {
                return Err(ChecksumError::Parse {
                    line: number + 1,
                    reason: "empty file name".to_string(),
                });
            }
            checksums.insert(name.to_string(), parse_hex(hex, number + 1)?);
        }

        let combined = combined.ok_or(ChecksumError::MissingCombinedValue)?;
        Ok(ChecksumSet {
            combined,
            checksums,
            legacy: false,
        })
    }

    /// Read a checksum file from disk
    pub fn read_file(path: &Path) -> Result<Self, ChecksumError> {
        let bytes = std::fs::read(path)?;
        Self::read_from(&bytes)
    }

    /// Write the checksum file atomically
    ///
    /// 1. Write to `<path>.tmp`
    /// 2. fsync the temporary file (if `sync`)
    /// 3. Rename to `path`
    /// 4. fsync the parent directory (if `sync`)
    pub fn persist(&self, path: &Path, sync: bool) -> Result<(), ChecksumError> {
        let temp_path = tmp_path(path);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)?;
        self.write_to(&mut file)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        std::fs::rename(&temp_path, path)?;

        if sync {
            if let Some(parent) = path.parent() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }
}

/// Order file names the way checksums visit them
///
/// Lexicographic, except the metadata file always comes last.
pub fn sorted_file_names(mut names: Vec<String>) -> Vec<String> {
    names.sort_by(|a, b| {
        (is_metadata_file(a), a.as_str()).cmp(&(is_metadata_file(b), b.as_str()))
    });
    names
}

/// CRC32C of one transfer chunk
pub fn chunk_checksum(content: &[u8]) -> u64 {
    u64::from(crc32c::crc32c(content))
}

fn parse_hex(hex: &str, line: usize) -> Result<u32, ChecksumError> {
    u32::from_str_radix(hex, 16).map_err(|_| ChecksumError::Parse {
        line,
        reason: format!("invalid checksum '{}'", hex),
    })
}

/// Errors reading or computing checksums
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed line in a checksum file
    #[error("Malformed checksum file at line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What was wrong
        reason: String,
    },

    /// Text format without a combined value comment
    #[error("Checksum file has no combined value")]
    MissingCombinedValue,

    /// Legacy value does not fit a CRC32C
    #[error("Legacy checksum value {0:#x} is out of range")]
    InvalidLegacyValue(u64),

    /// Path without a file name component
    #[error("Cannot checksum path without file name: {0}")]
    InvalidFileName(String),
}
