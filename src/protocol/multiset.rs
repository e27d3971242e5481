//! Fixed-size command multiset blob.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// Multiset
// ============================================================================

/// A bundle of command-equivalent state carried as an opaque blob of `N`
/// bytes. Only copy and byte-wise comparison are supported.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Multiset<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> Multiset<N> {
    /// Size of the blob in bytes.
    pub const SIZE: usize = N;

    /// Creates a zero-filled multiset.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { bytes: [0; N] }
    }

    /// Copies a multiset out of a byte slice of exactly `N` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] on a size mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes = <[u8; N]>::try_from(bytes).map_err(|_| {
            Error::invalid_argument(format!(
                "multiset size mismatch: expected {N}, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Overwrites this multiset with the content of `other`.
    #[inline]
    pub fn copy_from(&mut self, other: &Self) {
        self.bytes = other.bytes;
    }
}

impl<const N: usize> Default for Multiset<N> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<const N: usize> fmt::Debug for Multiset<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiset").field("size", &N).finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
