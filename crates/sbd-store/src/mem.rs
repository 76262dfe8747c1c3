//! In-memory object store.
//!
//! Backs tests and local operation with a `HashMap` of objects and an
//! asynchronous completion model: submissions are queued and executed either
//! on a dispatcher thread (auto mode) or under caller control (manual mode,
//! `dispatch_one`/`dispatch_all`), which makes callback interleavings
//! deterministic in tests.
//!
//! The store keeps an ordered submission log and supports injecting a
//! failure status per object. Snapshots are not modeled: reads always see
//! the head revision and `remove_with_snaps` behaves as `remove` (both are
//! logged distinctly).

use crate::{
    status_from_len, ObjectStore, ReadBatch, ReadOp, StatusCallback, WriteBatch, WriteOp,
};
use parking_lot::{Condvar, Mutex};
use sbd_error::Result;
use sbd_types::{SnapContext, SnapId, Status};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

/// Kind tag recorded for each op of a submitted write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpKind {
    AssertExists,
    SetAllocHint,
    WriteFull,
    Write,
    Zero,
    Truncate,
    Remove,
    RemoveWithSnaps,
}

#[derive(Debug, Clone)]
pub struct SubmittedWrite {
    pub oid: String,
    pub ops: Vec<WriteOpKind>,
    pub snap_seq: u64,
}

impl SubmittedWrite {
    #[must_use]
    pub fn has(&self, kind: WriteOpKind) -> bool {
        self.ops.contains(&kind)
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedRead {
    pub oid: String,
    pub ranges: Vec<(u64, u64)>,
    pub sparse: bool,
}

/// One logged submission, in submission order.
#[derive(Debug, Clone)]
pub enum Submission {
    Read(SubmittedRead),
    Write(SubmittedWrite),
}

enum PendingKind {
    Read(ReadBatch),
    Write(WriteBatch),
}

struct PendingOp {
    oid: String,
    kind: PendingKind,
    on_complete: StatusCallback,
}

struct Shared {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<HashMap<String, Status>>,
    log: Mutex<Vec<Submission>>,
    queue: Mutex<VecDeque<PendingOp>>,
    cond: Condvar,
    stop: AtomicBool,
}

/// In-memory [`ObjectStore`].
pub struct MemObjectStore {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemObjectStore {
    /// Auto mode: a dispatcher thread executes submissions as they arrive.
    #[must_use]
    pub fn new() -> Self {
        let store = Self::manual();
        let shared = Arc::clone(&store.shared);
        let handle = std::thread::spawn(move || dispatcher_loop(&shared));
        *store.worker.lock() = Some(handle);
        store
    }

    /// Manual mode: submissions queue up until `dispatch_one`/`dispatch_all`.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(Shared {
                objects: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Execute the oldest queued submission on the calling thread.
    ///
    /// Manual mode only. Returns `false` when the queue is empty.
    pub fn dispatch_one(&self) -> bool {
        let op = self.shared.queue.lock().pop_front();
        match op {
            Some(op) => {
                execute(&self.shared, op);
                true
            }
            None => false,
        }
    }

    /// Drain the queue, returning the number of submissions executed.
    ///
    /// Callbacks may enqueue further submissions; those are drained too.
    pub fn dispatch_all(&self) -> usize {
        let mut n = 0;
        while self.dispatch_one() {
            n += 1;
        }
        n
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn insert_object(&self, oid: &str, data: Vec<u8>) {
        self.shared.objects.lock().insert(oid.to_owned(), data);
    }

    #[must_use]
    pub fn object(&self, oid: &str) -> Option<Vec<u8>> {
        self.shared.objects.lock().get(oid).cloned()
    }

    #[must_use]
    pub fn contains(&self, oid: &str) -> bool {
        self.shared.objects.lock().contains_key(oid)
    }

    /// Fail the next submission targeting `oid` with `status` instead of
    /// executing it. One-shot.
    pub fn inject_status(&self, oid: &str, status: Status) {
        self.shared.faults.lock().insert(oid.to_owned(), status);
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.shared.log.lock().clone()
    }

    #[must_use]
    pub fn write_submissions(&self) -> Vec<SubmittedWrite> {
        self.shared
            .log
            .lock()
            .iter()
            .filter_map(|s| match s {
                Submission::Write(w) => Some(w.clone()),
                Submission::Read(_) => None,
            })
            .collect()
    }

    #[must_use]
    pub fn read_submissions(&self) -> Vec<SubmittedRead> {
        self.shared
            .log
            .lock()
            .iter()
            .filter_map(|s| match s {
                Submission::Read(r) => Some(r.clone()),
                Submission::Write(_) => None,
            })
            .collect()
    }
}

impl Default for MemObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemObjectStore {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ObjectStore for MemObjectStore {
    fn aio_read(
        &self,
        oid: &str,
        _snap_id: SnapId,
        batch: ReadBatch,
        read_flags: i32,
        on_complete: StatusCallback,
    ) -> Result<()> {
        trace!(
            target: "sbd::store",
            oid,
            ops = batch.len(),
            read_flags,
            "read submitted"
        );
        let ranges = batch
            .ops()
            .iter()
            .map(|op| match op {
                ReadOp::Read { off, len, .. } | ReadOp::SparseRead { off, len, .. } => (*off, *len),
            })
            .collect();
        let sparse = batch
            .ops()
            .iter()
            .any(|op| matches!(op, ReadOp::SparseRead { .. }));
        self.shared.log.lock().push(Submission::Read(SubmittedRead {
            oid: oid.to_owned(),
            ranges,
            sparse,
        }));
        self.submit(PendingOp {
            oid: oid.to_owned(),
            kind: PendingKind::Read(batch),
            on_complete,
        });
        Ok(())
    }

    fn aio_write(
        &self,
        oid: &str,
        batch: WriteBatch,
        snapc: &SnapContext,
        on_complete: StatusCallback,
    ) -> Result<()> {
        trace!(
            target: "sbd::store",
            oid,
            ops = batch.len(),
            snap_seq = snapc.seq,
            "write submitted"
        );
        let ops = batch.ops().iter().map(op_kind).collect();
        self.shared
            .log
            .lock()
            .push(Submission::Write(SubmittedWrite {
                oid: oid.to_owned(),
                ops,
                snap_seq: snapc.seq,
            }));
        self.submit(PendingOp {
            oid: oid.to_owned(),
            kind: PendingKind::Write(batch),
            on_complete,
        });
        Ok(())
    }
}

impl MemObjectStore {
    fn submit(&self, op: PendingOp) {
        self.shared.queue.lock().push_back(op);
        self.shared.cond.notify_one();
    }
}

fn op_kind(op: &WriteOp) -> WriteOpKind {
    match op {
        WriteOp::AssertExists => WriteOpKind::AssertExists,
        WriteOp::SetAllocHint { .. } => WriteOpKind::SetAllocHint,
        WriteOp::WriteFull(_) => WriteOpKind::WriteFull,
        WriteOp::Write { .. } => WriteOpKind::Write,
        WriteOp::Zero { .. } => WriteOpKind::Zero,
        WriteOp::Truncate { .. } => WriteOpKind::Truncate,
        WriteOp::Remove => WriteOpKind::Remove,
        WriteOp::RemoveWithSnaps => WriteOpKind::RemoveWithSnaps,
    }
}

fn dispatcher_loop(shared: &Arc<Shared>) {
    loop {
        let op = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(op) = queue.pop_front() {
                    break Some(op);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break None;
                }
                shared.cond.wait(&mut queue);
            }
        };
        match op {
            Some(op) => execute(shared, op),
            None => break,
        }
    }
}

fn execute(shared: &Shared, op: PendingOp) {
    let PendingOp {
        oid,
        kind,
        on_complete,
    } = op;
    if let Some(status) = shared.faults.lock().remove(&oid) {
        trace!(target: "sbd::store", oid, status, "injected status");
        on_complete.complete(status);
        return;
    }
    let r = match kind {
        PendingKind::Read(batch) => execute_read(shared, &oid, &batch),
        PendingKind::Write(batch) => execute_write(shared, &oid, &batch),
    };
    trace!(target: "sbd::store", oid, r, "completed");
    on_complete.complete(r);
}

#[expect(clippy::cast_possible_truncation)] // object sizes fit usize in-memory
fn execute_read(shared: &Shared, oid: &str, batch: &ReadBatch) -> Status {
    let objects = shared.objects.lock();
    let Some(data) = objects.get(oid) else {
        return -libc::ENOENT;
    };

    let mut total = 0_usize;
    for op in batch.ops() {
        let (off, len, out, extent_map) = match op {
            ReadOp::Read {
                off,
                len,
                out,
                extent_map,
            } => (*off, *len, out, extent_map.as_ref()),
            ReadOp::SparseRead {
                off,
                len,
                out,
                extent_map,
            } => (*off, *len, out, Some(extent_map)),
        };
        let start = (off as usize).min(data.len());
        let end = ((off + len) as usize).min(data.len());
        let bytes = data[start..end].to_vec();
        if let Some(map) = extent_map {
            map.insert(off, bytes.len() as u64);
        }
        total += bytes.len();
        out.put(bytes);
    }
    status_from_len(total)
}

#[expect(clippy::cast_possible_truncation)] // object sizes fit usize in-memory
fn execute_write(shared: &Shared, oid: &str, batch: &WriteBatch) -> Status {
    let mut objects = shared.objects.lock();
    // Stage mutations and commit only on success: a failed precondition
    // leaves the object untouched.
    let mut staged: Option<Vec<u8>> = objects.get(oid).cloned();

    for op in batch.ops() {
        match op {
            WriteOp::AssertExists => {
                if staged.is_none() {
                    return -libc::ENOENT;
                }
            }
            WriteOp::SetAllocHint { .. } => {}
            WriteOp::WriteFull(data) => staged = Some(data.clone()),
            WriteOp::Write { off, data } => {
                let buf = staged.get_or_insert_with(Vec::new);
                let end = *off as usize + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[*off as usize..end].copy_from_slice(data);
            }
            WriteOp::Zero { off, len } => {
                let buf = staged.get_or_insert_with(Vec::new);
                let end = (*off + *len) as usize;
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[*off as usize..end].fill(0);
            }
            WriteOp::Truncate { off } => {
                let buf = staged.get_or_insert_with(Vec::new);
                buf.resize(*off as usize, 0);
            }
            WriteOp::Remove | WriteOp::RemoveWithSnaps => {
                if staged.is_none() {
                    return -libc::ENOENT;
                }
                staged = None;
            }
        }
    }

    match staged {
        Some(data) => {
            objects.insert(oid.to_owned(), data);
        }
        None => {
            objects.remove(oid);
        }
    }
    0
}
