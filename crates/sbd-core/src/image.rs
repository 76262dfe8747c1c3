//! Shared image metadata consulted by every per-object request.
//!
//! `ImageContext` carries the striping layout, feature flags, the snapshot
//! and parent views behind their reader-writer locks, the object map, the
//! exclusive-lock ownership predicate, the object-store handle, the shared
//! work queue, and the copyup registry.
//!
//! Lock order: `snap` before `parent` before `object_map`; the copyup
//! registry mutex is taken last and never held across I/O.
//! `with_snap_parent_read` is the only way to observe snapshot and parent
//! state together, which keeps the order structural.

use crate::copyup::CopyupJob;
use crate::object_map::ObjectMap;
use crate::work_queue::OpWorkQueue;
use parking_lot::{Mutex, RwLock};
use sbd_error::{Result, SbdError};
use sbd_store::{status_from_len, ObjectStore, SharedReadBuf, StatusCallback};
use sbd_types::{prune_to_overlap, ImageExtent, ImageLayout, ObjectNo, SnapContext, SnapId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// One snapshot visible on the image, newest first in `SnapshotView::snaps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub id: SnapId,
    /// Parent overlap visible at this snapshot; `None` when the snapshot has
    /// no parent relation.
    pub parent_overlap: Option<u64>,
}

/// Snapshot state guarded by the image's snap lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotView {
    pub seq: u64,
    pub snaps: Vec<SnapInfo>,
}

impl SnapshotView {
    /// Snap context attached to head writes.
    #[must_use]
    pub fn snap_context(&self) -> SnapContext {
        SnapContext {
            seq: self.seq,
            snaps: self.snaps.iter().map(|s| s.id).collect(),
        }
    }

    #[must_use]
    pub fn has_snapshots(&self) -> bool {
        !self.snaps.is_empty()
    }

    #[must_use]
    pub fn snap_info(&self, id: SnapId) -> Option<&SnapInfo> {
        self.snaps.iter().find(|s| s.id == id)
    }
}

/// Read entry point into the parent image, for parent fallback and copyup.
///
/// The completion status is the number of bytes produced.
pub trait ParentReader: Send + Sync {
    fn aio_read(&self, extents: Vec<ImageExtent>, out: SharedReadBuf, on_complete: StatusCallback);
}

/// Parent relation guarded by the image's parent lock.
#[derive(Clone)]
pub struct ParentView {
    /// Bytes of the parent visible to the head revision.
    pub overlap: u64,
    pub reader: Arc<dyn ParentReader>,
}

/// Exclusive-lock ownership predicate.
///
/// Only the predicate matters to this engine; acquisition and maintenance
/// live elsewhere.
#[derive(Debug, Default)]
pub struct ExclusiveLock {
    owned: AtomicBool,
}

impl ExclusiveLock {
    #[must_use]
    pub fn new(owned: bool) -> Self {
        Self {
            owned: AtomicBool::new(owned),
        }
    }

    #[must_use]
    pub fn is_lock_owner(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn set_lock_owner(&self, owned: bool) {
        self.owned.store(owned, Ordering::Release);
    }
}

/// Image-open options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOptions {
    pub object_size: u64,
    pub read_only: bool,
    pub clone_copy_on_read: bool,
    pub enable_alloc_hint: bool,
    /// Extra flags applied to every object read submission.
    pub read_flag_overrides: i32,
    pub work_queue_threads: usize,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            object_size: 1 << 22,
            read_only: false,
            clone_copy_on_read: false,
            enable_alloc_hint: true,
            read_flag_overrides: 0,
            work_queue_threads: 2,
        }
    }
}

/// Shared, mostly read-only image state.
pub struct ImageContext {
    pub layout: ImageLayout,
    pub read_only: bool,
    pub clone_copy_on_read: bool,
    pub enable_alloc_hint: bool,
    read_flag_overrides: i32,
    /// snap lock: guards the snapshot view.
    pub snap: RwLock<SnapshotView>,
    /// parent lock: guards the parent relation. Acquired after `snap`.
    pub parent: RwLock<Option<ParentView>>,
    /// object-map lock: write-held while submitting a map update.
    pub object_map: RwLock<Option<Arc<dyn ObjectMap>>>,
    exclusive_lock: Mutex<Option<Arc<ExclusiveLock>>>,
    pub store: Arc<dyn ObjectStore>,
    pub op_work_queue: Arc<OpWorkQueue>,
    pub(crate) copyup_registry: Mutex<HashMap<ObjectNo, Arc<CopyupJob>>>,
}

impl ImageContext {
    pub fn new(options: ImageOptions, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        let layout = ImageLayout::new(options.object_size)?;
        if options.work_queue_threads == 0 {
            return Err(SbdError::InvalidConfig(
                "work_queue_threads must be > 0".to_owned(),
            ));
        }
        Ok(Arc::new(Self {
            layout,
            read_only: options.read_only,
            clone_copy_on_read: options.clone_copy_on_read,
            enable_alloc_hint: options.enable_alloc_hint,
            read_flag_overrides: options.read_flag_overrides,
            snap: RwLock::new(SnapshotView::default()),
            parent: RwLock::new(None),
            object_map: RwLock::new(None),
            exclusive_lock: Mutex::new(None),
            store,
            op_work_queue: Arc::new(OpWorkQueue::new(options.work_queue_threads)),
            copyup_registry: Mutex::new(HashMap::new()),
        }))
    }

    /// Run `f` with the snapshot and parent views held as readers, in lock
    /// order.
    pub fn with_snap_parent_read<R>(
        &self,
        f: impl FnOnce(&SnapshotView, Option<&ParentView>) -> R,
    ) -> R {
        let snap = self.snap.read();
        let parent = self.parent.read();
        f(&snap, parent.as_ref())
    }

    /// Parent overlap visible at `snap_id`, from views held by the caller.
    ///
    /// `Ok(0)` when there is no parent; `SnapshotMissing` when the snapshot
    /// has raced its own deletion.
    pub fn parent_overlap(
        &self,
        snap: &SnapshotView,
        parent: Option<&ParentView>,
        snap_id: SnapId,
    ) -> Result<u64> {
        let Some(parent) = parent else {
            return Ok(0);
        };
        if snap_id.is_head() {
            return Ok(parent.overlap);
        }
        match snap.snap_info(snap_id) {
            Some(info) => Ok(info.parent_overlap.unwrap_or(0)),
            None => Err(SbdError::SnapshotMissing { snap: snap_id }),
        }
    }

    /// Project `[object_off, object_off + object_len)` of `object_no` into
    /// the parent and prune against the overlap at `snap_id`.
    ///
    /// Returns whether any extent survives. Overlap-retrieval failure is
    /// logged and demoted to "no parent"; `extents` is left empty.
    #[expect(clippy::too_many_arguments)]
    pub fn compute_parent_extents(
        &self,
        snap: &SnapshotView,
        parent: Option<&ParentView>,
        snap_id: SnapId,
        object_no: ObjectNo,
        object_off: u64,
        object_len: u64,
        extents: &mut Vec<ImageExtent>,
    ) -> bool {
        *extents = self
            .layout
            .object_range_to_image(object_no, object_off, object_len);
        let overlap = match self.parent_overlap(snap, parent, snap_id) {
            Ok(overlap) => overlap,
            Err(err) => {
                // a snapshot can be deleted while still being read from
                error!(
                    target: "sbd::image",
                    object_no = %object_no,
                    %err,
                    "failed to retrieve parent overlap"
                );
                extents.clear();
                return false;
            }
        };
        let object_overlap = prune_to_overlap(extents, overlap);
        if object_overlap > 0 {
            trace!(
                target: "sbd::image",
                object_no = %object_no,
                overlap,
                object_overlap,
                "computed parent extents"
            );
            true
        } else {
            false
        }
    }

    /// Copy-on-read eligibility. Call with the snap lock held.
    #[must_use]
    pub fn is_copy_on_read(&self, snap_id: SnapId) -> bool {
        self.clone_copy_on_read
            && !self.read_only
            && snap_id.is_head()
            && self.is_exclusive_lock_owner().unwrap_or(true)
    }

    /// `None` when no exclusive lock is attached, otherwise ownership.
    #[must_use]
    pub fn is_exclusive_lock_owner(&self) -> Option<bool> {
        self.exclusive_lock
            .lock()
            .as_ref()
            .map(|lock| lock.is_lock_owner())
    }

    pub fn set_exclusive_lock(&self, lock: Option<Arc<ExclusiveLock>>) {
        *self.exclusive_lock.lock() = lock;
    }

    /// Read flags for an object read at `snap_id`.
    #[must_use]
    pub fn read_flags(&self, _snap_id: SnapId) -> i32 {
        self.read_flag_overrides
    }

    /// Current head snap context.
    #[must_use]
    pub fn snap_context(&self) -> SnapContext {
        self.snap.read().snap_context()
    }

    pub fn set_parent(&self, parent: Option<ParentView>) {
        *self.parent.write() = parent;
    }

    pub fn set_object_map(&self, map: Option<Arc<dyn ObjectMap>>) {
        *self.object_map.write() = map;
    }

    /// Register a snapshot taken now; bumps the sequence number.
    pub fn add_snapshot(&self, id: SnapId, parent_overlap: Option<u64>) {
        let mut snap = self.snap.write();
        debug_assert!(snap.snaps.iter().all(|s| s.id < id));
        snap.seq = snap.seq.max(id.0);
        snap.snaps.insert(0, SnapInfo { id, parent_overlap });
    }

    /// Number of live copyup jobs.
    #[must_use]
    pub fn copyup_job_count(&self) -> usize {
        self.copyup_registry.lock().len()
    }
}

/// Parent image backed by a byte slice; completions ride the work queue.
pub struct SliceParentImage {
    data: Vec<u8>,
    queue: Arc<OpWorkQueue>,
    reads: AtomicUsize,
}

impl SliceParentImage {
    #[must_use]
    pub fn new(data: Vec<u8>, queue: Arc<OpWorkQueue>) -> Self {
        Self {
            data,
            queue,
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of reads served.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl ParentReader for SliceParentImage {
    #[expect(clippy::cast_possible_truncation)] // in-memory parent fits usize
    fn aio_read(&self, extents: Vec<ImageExtent>, out: SharedReadBuf, on_complete: StatusCallback) {
        self.reads.fetch_add(1, Ordering::AcqRel);
        let mut bytes = Vec::new();
        for ext in &extents {
            let start = (ext.offset as usize).min(self.data.len());
            let end = ((ext.offset + ext.len) as usize).min(self.data.len());
            bytes.extend_from_slice(&self.data[start..end]);
        }
        let r = status_from_len(bytes.len());
        trace!(target: "sbd::image", extents = extents.len(), r, "parent read");
        out.put(bytes);
        self.queue.queue(on_complete, r);
    }
}
