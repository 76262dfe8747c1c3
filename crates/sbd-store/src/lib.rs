#![forbid(unsafe_code)]
//! Object-store client interface.
//!
//! The request engine talks to the backing object store through the
//! [`ObjectStore`] trait: it builds a [`ReadBatch`] or [`WriteBatch`],
//! submits it with a one-shot [`StatusCallback`], and resumes when the
//! callback fires. Submission is fire-and-forget; a submission error is a
//! programming bug, not a runtime condition.
//!
//! [`MemObjectStore`](mem::MemObjectStore) is the in-memory implementation
//! used by tests and local operation.

pub mod mem;

use parking_lot::Mutex;
use sbd_error::Result;
use sbd_types::{SnapContext, SnapId, Status};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One-shot completion callback carrying a signed status.
///
/// Consumed by value on delivery, so the type system enforces the
/// exactly-once contract.
pub struct StatusCallback(Box<dyn FnOnce(Status) + Send>);

impl StatusCallback {
    pub fn new(f: impl FnOnce(Status) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Deliver the status, consuming the callback.
    pub fn complete(self, r: Status) {
        (self.0)(r);
    }
}

impl fmt::Debug for StatusCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCallback").finish_non_exhaustive()
    }
}

/// Shared out-buffer for read operations.
///
/// Registered in a [`ReadBatch`] at build time; the store fills it before
/// delivering the completion, mirroring out-parameter read ops.
#[derive(Debug, Clone, Default)]
pub struct SharedReadBuf(Arc<Mutex<Vec<u8>>>);

impl SharedReadBuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffer contents.
    pub fn put(&self, bytes: Vec<u8>) {
        *self.0.lock() = bytes;
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Shared out-map for sparse reads: `offset -> length` of data-bearing
/// ranges.
#[derive(Debug, Clone, Default)]
pub struct SharedExtentMap(Arc<Mutex<BTreeMap<u64, u64>>>);

impl SharedExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, offset: u64, len: u64) {
        self.0.lock().insert(offset, len);
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.0.lock().clone()
    }
}

/// One operation in a read batch.
#[derive(Debug, Clone)]
pub enum ReadOp {
    Read {
        off: u64,
        len: u64,
        out: SharedReadBuf,
        extent_map: Option<SharedExtentMap>,
    },
    SparseRead {
        off: u64,
        len: u64,
        out: SharedReadBuf,
        extent_map: SharedExtentMap,
    },
}

/// Ordered batch of read operations on one object.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    ops: Vec<ReadOp>,
    op_flags: i32,
}

impl ReadBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, off: u64, len: u64, out: SharedReadBuf) {
        self.ops.push(ReadOp::Read {
            off,
            len,
            out,
            extent_map: None,
        });
    }

    pub fn sparse_read(
        &mut self,
        off: u64,
        len: u64,
        out: SharedReadBuf,
        extent_map: SharedExtentMap,
    ) {
        self.ops.push(ReadOp::SparseRead {
            off,
            len,
            out,
            extent_map,
        });
    }

    pub fn set_op_flags2(&mut self, flags: i32) {
        self.op_flags = flags;
    }

    #[must_use]
    pub fn op_flags(&self) -> i32 {
        self.op_flags
    }

    #[must_use]
    pub fn ops(&self) -> &[ReadOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One mutation in a write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Precondition: fail the batch with `-ENOENT` unless the object exists.
    AssertExists,
    /// Allocation hint for the backend allocator.
    SetAllocHint {
        expected_size: u64,
        expected_write_size: u64,
    },
    /// Replace the whole object.
    WriteFull(Vec<u8>),
    Write {
        off: u64,
        data: Vec<u8>,
    },
    Zero {
        off: u64,
        len: u64,
    },
    /// Resize the object to `off`.
    Truncate {
        off: u64,
    },
    Remove,
    /// Remove the head revision while preserving snapshot clones.
    RemoveWithSnaps,
}

/// Ordered batch of mutations on one object, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    op_flags: i32,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_exists(&mut self) {
        self.ops.push(WriteOp::AssertExists);
    }

    pub fn set_alloc_hint(&mut self, expected_size: u64, expected_write_size: u64) {
        self.ops.push(WriteOp::SetAllocHint {
            expected_size,
            expected_write_size,
        });
    }

    pub fn write_full(&mut self, data: Vec<u8>) {
        self.ops.push(WriteOp::WriteFull(data));
    }

    pub fn write(&mut self, off: u64, data: Vec<u8>) {
        self.ops.push(WriteOp::Write { off, data });
    }

    pub fn zero(&mut self, off: u64, len: u64) {
        self.ops.push(WriteOp::Zero { off, len });
    }

    pub fn truncate(&mut self, off: u64) {
        self.ops.push(WriteOp::Truncate { off });
    }

    pub fn remove(&mut self) {
        self.ops.push(WriteOp::Remove);
    }

    pub fn remove_with_snaps(&mut self) {
        self.ops.push(WriteOp::RemoveWithSnaps);
    }

    pub fn set_op_flags2(&mut self, flags: i32) {
        self.op_flags = flags;
    }

    #[must_use]
    pub fn op_flags(&self) -> i32 {
        self.op_flags
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Asynchronous object-store client.
///
/// Completions are delivered on store threads, at most one per submission.
/// Read completions report total bytes produced (`r >= 0`) or a negated
/// errno; write completions report `0` or a negated errno. An `Err` from
/// submission itself is a caller bug.
pub trait ObjectStore: Send + Sync {
    fn aio_read(
        &self,
        oid: &str,
        snap_id: SnapId,
        batch: ReadBatch,
        read_flags: i32,
        on_complete: StatusCallback,
    ) -> Result<()>;

    fn aio_write(
        &self,
        oid: &str,
        batch: WriteBatch,
        snapc: &SnapContext,
        on_complete: StatusCallback,
    ) -> Result<()>;
}

/// Clamp a byte count into the status domain.
#[must_use]
pub fn status_from_len(len: usize) -> Status {
    Status::try_from(len).unwrap_or(Status::MAX)
}
