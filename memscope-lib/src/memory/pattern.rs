//! Wildcard byte patterns ("signatures") and a scanner over memory snapshots.
//!
//! A pattern is written as whitespace-separated tokens, each either two hex
//! digits or a wildcard (`?` or `??`):
//!
//! ```
//! use memscope_lib::memory::pattern::{Pattern, SignatureScanner};
//! use memscope_lib::RawPointer;
//!
//! let scanner = SignatureScanner::from_buffer(vec![0x01, 0x02, 0x03, 0x04], RawPointer::new(0x1000));
//! let pattern: Pattern = "02 ? 04".parse().unwrap();
//! assert_eq!(scanner.find_pattern(&pattern), Some(RawPointer::new(0x1001)));
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::memory::io::{self, MemoryAccessError, ProcessMemory};
use crate::memory::query::{PageInfo, QueryError};
use crate::memory::region::MemoryRegion;
use crate::pointer::RawPointer;
use crate::process::{Module, ProcessHandle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("invalid pattern token {token:?} at position {index}")]
    InvalidFormat { token: String, index: usize },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Memory(#[from] MemoryAccessError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternByte {
    Byte(u8),
    Any,
}

impl FromStr for PatternByte {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "?" | "??" => Ok(Self::Any),
            _ if s.len() == 2 && s.bytes().all(|b| b.is_ascii_hexdigit()) => {
                u8::from_str_radix(s, 16).map(Self::Byte).map_err(|_| ())
            }
            _ => Err(()),
        }
    }
}

impl PartialEq<u8> for PatternByte {
    fn eq(&self, other: &u8) -> bool {
        match self {
            Self::Byte(byte) => byte == other,
            Self::Any => true,
        }
    }
}

impl fmt::Display for PatternByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(byte) => write!(f, "{byte:02X}"),
            Self::Any => f.write_str("??"),
        }
    }
}

/// A non-empty sequence of literal and wildcard bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
}

impl Pattern {
    pub fn new(bytes: Vec<PatternByte>) -> Result<Self, PatternError> {
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self { bytes })
    }

    /// Builds a pattern from literal bytes and a mask of the same length,
    /// where `?` marks a wildcard and any other character a literal.
    pub fn from_bytes_and_mask(bytes: &[u8], mask: &str) -> Result<Self, PatternError> {
        if mask.chars().count() != bytes.len() {
            return Err(PatternError::InvalidFormat {
                token: mask.to_string(),
                index: 0,
            });
        }

        let bytes = bytes
            .iter()
            .zip(mask.chars())
            .map(|(&byte, mask)| match mask {
                '?' => PatternByte::Any,
                _ => PatternByte::Byte(byte),
            })
            .collect();

        Self::new(bytes)
    }

    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut aob: Vec<PatternByte> = Vec::new();

        for (index, chunk) in s.split_ascii_whitespace().enumerate() {
            let byte = PatternByte::from_str(chunk).map_err(|_| PatternError::InvalidFormat {
                token: chunk.to_string(),
                index,
            })?;
            aob.push(byte);
        }

        Self::new(aob)
    }
}

impl PartialEq<[u8]> for Pattern {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes.len() == other.len()
            && Iterator::zip(self.bytes.iter(), other.iter()).all(|(a, b)| a == b)
    }
}

impl PartialEq<Vec<u8>> for Pattern {
    fn eq(&self, other: &Vec<u8>) -> bool {
        self == other.as_slice()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte}")?;
        }
        Ok(())
    }
}

/// An owned copy of a memory range, searchable for patterns. Matches are
/// reported as addresses in the range the copy was taken from.
#[derive(Debug, Clone)]
pub struct SignatureScanner {
    buffer: Vec<u8>,
    base: RawPointer<u8>,
}

impl SignatureScanner {
    pub fn from_buffer(buffer: Vec<u8>, base: RawPointer<u8>) -> Self {
        Self { buffer, base }
    }

    /// Snapshots `region` through `memory`.
    pub fn from_region<M: ProcessMemory + ?Sized>(
        region: &MemoryRegion,
        memory: &M,
    ) -> Result<Self, MemoryAccessError> {
        debug!(region = %region, "snapshotting region");
        let buffer = io::read_bytes(memory, region.low(), region.size())?;

        Ok(Self::from_buffer(buffer, region.low()))
    }

    /// Snapshots `region` of the calling process with a plain memory copy.
    ///
    /// # Safety
    ///
    /// Every byte of `region` must be mapped and readable for the duration of
    /// the call.
    pub unsafe fn from_local(region: &MemoryRegion) -> Self {
        let buffer = region.low().copy_out(0, region.size());
        Self::from_buffer(buffer, region.low())
    }

    pub fn from_module(handle: &ProcessHandle, module: &Module) -> Result<Self, MemoryAccessError> {
        debug!(module = %module.name, "snapshotting module");
        Self::from_region(&module.region, handle)
    }

    pub fn base(&self) -> RawPointer<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.buffer.len())
    }

    /// Address of the first match, lowest offset first.
    pub fn find_pattern(&self, pattern: &Pattern) -> Option<RawPointer<u8>> {
        self.find_all(pattern).next()
    }

    pub fn find_pattern_str(&self, pattern: &str) -> Result<Option<RawPointer<u8>>, PatternError> {
        let pattern = Pattern::from_str(pattern)?;
        Ok(self.find_pattern(&pattern))
    }

    /// Every match in ascending address order. Matches may overlap.
    pub fn find_all<'a>(&'a self, pattern: &'a Pattern) -> impl Iterator<Item = RawPointer<u8>> + 'a {
        // windows() of a size larger than the buffer yields nothing
        self.buffer
            .windows(pattern.len().max(1))
            .enumerate()
            .filter(move |(_, window)| pattern == *window)
            .map(move |(offset, _)| self.base.byte_add(offset))
    }
}

/// Scans each committed, readable region of `handle` accepted by `filter`
/// and returns the first match. Regions that cannot be read in full are
/// skipped.
pub fn scan_process<F>(
    handle: &ProcessHandle,
    pattern: &Pattern,
    mut filter: F,
) -> Result<Option<RawPointer<u8>>, ScanError>
where
    F: FnMut(&PageInfo) -> bool,
{
    debug!(pid = handle.pid(), %pattern, "scanning process");

    for info in handle.regions() {
        let info = info?;
        if !info.is_readable() || !filter(&info) {
            continue;
        }

        let scanner = match SignatureScanner::from_region(&info.region(), handle) {
            Ok(scanner) => scanner,
            Err(err) => {
                debug!(region = %info.region(), error = %err, "skipping unreadable region");
                continue;
            }
        };

        if let Some(found) = scanner.find_pattern(pattern) {
            return Ok(Some(found));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner(bytes: &[u8]) -> SignatureScanner {
        SignatureScanner::from_buffer(bytes.to_vec(), RawPointer::new(0x1000))
    }

    #[test]
    fn parses_literals_and_wildcards() {
        let pattern: Pattern = "48 8B ? ?? 0f".parse().unwrap();
        assert_eq!(
            pattern.bytes(),
            &[
                PatternByte::Byte(0x48),
                PatternByte::Byte(0x8B),
                PatternByte::Any,
                PatternByte::Any,
                PatternByte::Byte(0x0F),
            ]
        );
        assert_eq!(pattern.to_string(), "48 8B ?? ?? 0F");
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(Pattern::from_str(""), Err(PatternError::Empty));
        assert_eq!(Pattern::from_str("   "), Err(PatternError::Empty));

        for (input, token, index) in [("0x", "0x", 0), ("ABC", "ABC", 0), ("00 G1", "G1", 1), ("1", "1", 0)] {
            assert_eq!(
                Pattern::from_str(input),
                Err(PatternError::InvalidFormat {
                    token: token.to_string(),
                    index
                })
            );
        }
    }

    #[test]
    fn wildcard_match_reports_the_original_address() {
        let found = scanner(&[0x01, 0x02, 0x03, 0x04]).find_pattern_str("02 ? 04").unwrap();
        assert_eq!(found, Some(RawPointer::new(0x1001)));
    }

    #[test]
    fn first_match_wins() {
        let scanner = scanner(&[0xAA, 0x01, 0xAA, 0x01]);
        assert_eq!(scanner.find_pattern_str("AA 01").unwrap(), Some(RawPointer::new(0x1000)));

        let pattern: Pattern = "AA 01".parse().unwrap();
        let all: Vec<_> = scanner.find_all(&pattern).map(RawPointer::address).collect();
        assert_eq!(all, [0x1000, 0x1002]);
    }

    #[test]
    fn match_at_the_last_offset() {
        let found = scanner(&[0, 0, 0, 0x90, 0xC3]).find_pattern_str("90 C3").unwrap();
        assert_eq!(found, Some(RawPointer::new(0x1003)));
    }

    #[test]
    fn no_match_cases() {
        assert_eq!(scanner(&[]).find_pattern_str("00").unwrap(), None);
        assert_eq!(scanner(&[1, 2]).find_pattern_str("01 02 03").unwrap(), None);
        assert_eq!(scanner(&[1, 2, 3]).find_pattern_str("04").unwrap(), None);
    }

    #[test]
    fn zero_is_a_literal_not_a_wildcard() {
        assert_eq!(scanner(&[0x05]).find_pattern_str("00").unwrap(), None);
        assert_eq!(scanner(&[0x05, 0x00]).find_pattern_str("00").unwrap(), Some(RawPointer::new(0x1001)));
    }

    #[test]
    fn mask_patterns() {
        let pattern = Pattern::from_bytes_and_mask(&[0x02, 0x00, 0x04], "x?x").unwrap();
        assert_eq!(pattern, "02 ?? 04".parse::<Pattern>().unwrap());
        assert!(Pattern::from_bytes_and_mask(&[0x02], "xx").is_err());
        assert_eq!(Pattern::from_bytes_and_mask(&[], ""), Err(PatternError::Empty));
    }

    #[test]
    fn local_snapshots() {
        let data = [0x10u8, 0x20, 0x30, 0x40, 0x50];
        let region = MemoryRegion::new(RawPointer::address_of(&data[0]), data.len());

        let scanner = unsafe { SignatureScanner::from_local(&region) };
        assert_eq!(scanner.as_bytes(), &data);
        assert_eq!(
            scanner.find_pattern_str("30 ? 50").unwrap(),
            Some(RawPointer::address_of(&data[2]))
        );
    }
}
