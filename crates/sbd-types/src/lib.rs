#![forbid(unsafe_code)]
//! Core value types for StripeBD.
//!
//! Defines the identifiers and geometry shared across the workspace: backing
//! object numbers, snapshot ids and contexts, image-level extents, object-map
//! states, and the layout math that projects an object-local range onto the
//! image and prunes it against a parent overlap.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Index of a backing object within the image, in stripe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectNo(pub u64);

/// Snapshot identifier. `SnapId::NO_SNAP` denotes the writable head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapId(pub u64);

impl SnapId {
    /// Sentinel for "no snapshot": the request addresses the head revision.
    pub const NO_SNAP: Self = Self(u64::MAX);

    /// True when this id is the head sentinel.
    #[must_use]
    pub fn is_head(self) -> bool {
        self == Self::NO_SNAP
    }
}

/// Signed status code traveling along completion callbacks.
///
/// Negative values are negated POSIX errnos; `r > 0` on a read is the byte
/// count produced.
pub type Status = i32;

/// Snapshot context attached to every write so the object store preserves
/// pre-snapshot contents.
///
/// Invariant: `snaps` is ordered newest-first (strictly descending) and
/// `seq` is at least the newest snapshot id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// Build a validated snapshot context.
    pub fn new(seq: u64, snaps: Vec<SnapId>) -> Result<Self, ValidationError> {
        if !snaps.windows(2).all(|w| w[0] > w[1]) {
            return Err(ValidationError::InvalidField {
                field: "snaps",
                reason: "must be strictly descending",
            });
        }
        if let Some(newest) = snaps.first() {
            if seq < newest.0 {
                return Err(ValidationError::InvalidField {
                    field: "seq",
                    reason: "must be >= newest snapshot id",
                });
            }
        }
        Ok(Self { seq, snaps })
    }

    /// Context of an image with no snapshots.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            seq: 0,
            snaps: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snaps.is_empty()
    }
}

/// State of one backing object in the object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    /// The object is known not to exist; reads may be short-circuited.
    Nonexistent,
    /// The object may exist in the store.
    Exists,
    /// A removal is in flight; existence is unknown until it settles.
    Pending,
}

/// A contiguous byte range at image level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtent {
    pub offset: u64,
    pub len: u64,
}

impl ImageExtent {
    /// One-past-the-end offset, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }
}

/// Validated image layout (fixed, non-striped: object `n` covers image bytes
/// `[n * object_size, (n + 1) * object_size)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    object_size: u64,
}

/// Smallest supported backing-object size.
pub const MIN_OBJECT_SIZE: u64 = 4096;
/// Largest supported backing-object size.
pub const MAX_OBJECT_SIZE: u64 = 1 << 26;

impl ImageLayout {
    /// Create a layout if `object_size` is a power of two in
    /// `[MIN_OBJECT_SIZE, MAX_OBJECT_SIZE]`.
    pub fn new(object_size: u64) -> Result<Self, ValidationError> {
        if !object_size.is_power_of_two()
            || !(MIN_OBJECT_SIZE..=MAX_OBJECT_SIZE).contains(&object_size)
        {
            return Err(ValidationError::InvalidField {
                field: "object_size",
                reason: "must be a power of two in 4096..=67108864",
            });
        }
        Ok(Self { object_size })
    }

    #[must_use]
    pub fn object_size(self) -> u64 {
        self.object_size
    }

    /// Project an object-local byte range onto the image.
    ///
    /// With the fixed layout this is a single extent (striped layouts would
    /// produce several, hence the list shape). Returns an empty list for a
    /// zero-length range. The range must not extend past the object.
    #[must_use]
    pub fn object_range_to_image(
        self,
        object_no: ObjectNo,
        object_off: u64,
        object_len: u64,
    ) -> Vec<ImageExtent> {
        debug_assert!(object_off + object_len <= self.object_size);
        if object_len == 0 {
            return Vec::new();
        }
        vec![ImageExtent {
            offset: object_no.0 * self.object_size + object_off,
            len: object_len,
        }]
    }
}

/// Prune `extents` against a parent overlap: extents entirely beyond
/// `overlap` are dropped, the straddling extent is truncated. Returns the
/// total surviving length.
pub fn prune_to_overlap(extents: &mut Vec<ImageExtent>, overlap: u64) -> u64 {
    extents.retain_mut(|ext| {
        if ext.offset >= overlap {
            return false;
        }
        ext.len = ext.len.min(overlap - ext.offset);
        ext.len > 0
    });
    extents.iter().map(|ext| ext.len).sum()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ObjectNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "head")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
