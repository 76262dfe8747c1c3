//! Per-object read automaton.
//!
//! States: `Flat` (no parent fallback), `Guard` (the object may live only in
//! the parent), `Copyup` (parent produced data and copy-on-read applies). A
//! terminal `-ENOENT` is valid data for a read: the missing bytes are
//! implicit zeros.

use crate::copyup;
use crate::image::{ImageContext, ParentReader};
use sbd_store::{ReadBatch, SharedExtentMap, SharedReadBuf, StatusCallback};
use sbd_types::{ImageExtent, ObjectNo, SnapId, Status};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Flat,
    Guard,
    Copyup,
}

/// One in-flight read of one backing object.
pub struct ObjectReadRequest {
    image: Arc<ImageContext>,
    oid: String,
    object_no: ObjectNo,
    object_off: u64,
    object_len: u64,
    snap_id: SnapId,
    parent_extents: Vec<ImageExtent>,
    state: ReadState,
    tried_parent: bool,
    sparse: bool,
    op_flags: i32,
    data: SharedReadBuf,
    extent_map: Option<SharedExtentMap>,
    completion: StatusCallback,
}

enum GuardNext {
    ReadParent {
        extents: Vec<ImageExtent>,
        reader: Arc<dyn ParentReader>,
        copy_on_read: bool,
    },
    Complete,
}

impl ObjectReadRequest {
    /// Build a read request. Bytes land in `data`; a sparse read also fills
    /// `extent_map`.
    #[expect(clippy::too_many_arguments)]
    pub fn create(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        object_off: u64,
        object_len: u64,
        snap_id: SnapId,
        sparse: bool,
        op_flags: i32,
        data: SharedReadBuf,
        extent_map: Option<SharedExtentMap>,
        completion: StatusCallback,
    ) -> Box<Self> {
        let object_size = image.layout.object_size();
        let mut parent_extents = Vec::new();
        let has_parent = image.with_snap_parent_read(|snap, parent| {
            image.compute_parent_extents(
                snap,
                parent,
                snap_id,
                object_no,
                0,
                object_size,
                &mut parent_extents,
            )
        });
        let state = if has_parent {
            trace!(target: "sbd::object", oid, "guarding read");
            ReadState::Guard
        } else {
            ReadState::Flat
        };
        Box::new(Self {
            image: Arc::clone(image),
            oid: oid.to_owned(),
            object_no,
            object_off,
            object_len,
            snap_id,
            parent_extents,
            state,
            tried_parent: false,
            sparse,
            op_flags,
            data,
            extent_map,
            completion,
        })
    }

    /// Submit the object read, or short-circuit to `-ENOENT` when the object
    /// map rules the object out.
    pub fn send(self: Box<Self>) {
        trace!(
            target: "sbd::object",
            oid = %self.oid,
            off = self.object_off,
            len = self.object_len,
            snap = %self.snap_id,
            "send read"
        );
        let image = Arc::clone(&self.image);
        let skip = {
            let _snap = image.snap.read();
            let map = image.object_map.read();
            map.as_ref()
                .is_some_and(|m| !m.object_may_exist(self.object_no))
        };
        if skip {
            trace!(
                target: "sbd::object",
                oid = %self.oid,
                "object map rules object out, deferring ENOENT"
            );
            let queue = Arc::clone(&image.op_work_queue);
            queue.queue(
                StatusCallback::new(move |r| self.complete(r)),
                -libc::ENOENT,
            );
            return;
        }

        let mut batch = ReadBatch::new();
        if self.sparse {
            batch.sparse_read(
                self.object_off,
                self.object_len,
                self.data.clone(),
                self.extent_map.clone().unwrap_or_default(),
            );
        } else {
            batch.read(self.object_off, self.object_len, self.data.clone());
        }
        batch.set_op_flags2(self.op_flags);

        let flags = image.read_flags(self.snap_id);
        let oid = self.oid.clone();
        let snap_id = self.snap_id;
        let store = Arc::clone(&image.store);
        store
            .aio_read(
                &oid,
                snap_id,
                batch,
                flags,
                StatusCallback::new(move |r| self.complete(r)),
            )
            .expect("object store rejected read submission");
    }

    /// Universal re-entry: one stage finished with `r`.
    pub fn complete(mut self: Box<Self>, r: Status) {
        trace!(
            target: "sbd::object",
            oid = %self.oid,
            state = ?self.state,
            r,
            "read should_complete"
        );
        match self.state {
            ReadState::Guard => {
                if r == -libc::ENOENT && !self.tried_parent {
                    let next = self.image.with_snap_parent_read(|snap, parent| {
                        let Some(view) = parent else {
                            trace!(target: "sbd::object", oid = %self.oid, "parent is gone");
                            return GuardNext::Complete;
                        };
                        let mut extents = Vec::new();
                        let has = self.image.compute_parent_extents(
                            snap,
                            Some(view),
                            self.snap_id,
                            self.object_no,
                            self.object_off,
                            self.object_len,
                            &mut extents,
                        );
                        if has {
                            GuardNext::ReadParent {
                                extents,
                                reader: Arc::clone(&view.reader),
                                copy_on_read: self.image.is_copy_on_read(self.snap_id),
                            }
                        } else {
                            GuardNext::Complete
                        }
                    });
                    match next {
                        GuardNext::ReadParent {
                            extents,
                            reader,
                            copy_on_read,
                        } => {
                            self.tried_parent = true;
                            if copy_on_read {
                                self.state = ReadState::Copyup;
                            }
                            self.read_from_parent(reader, extents);
                        }
                        // no parent coverage left: the standing ENOENT is
                        // the answer (implicit zeros)
                        GuardNext::Complete => self.finish(r),
                    }
                } else {
                    self.finish(r);
                }
            }
            ReadState::Copyup => {
                // parent produced data; kick off the asynchronous copyup and
                // complete without waiting on it
                debug_assert!(self.tried_parent);
                if r > 0 {
                    self.send_copyup();
                }
                self.finish(r);
            }
            ReadState::Flat => self.finish(r),
        }
    }

    fn read_from_parent(self: Box<Self>, reader: Arc<dyn ParentReader>, extents: Vec<ImageExtent>) {
        trace!(
            target: "sbd::object",
            oid = %self.oid,
            extents = extents.len(),
            "reading from parent"
        );
        let out = self.data.clone();
        reader.aio_read(extents, out, StatusCallback::new(move |r| self.complete(r)));
    }

    /// Fire-and-forget copy-on-read: re-verify coverage and lock ownership,
    /// then hand the full-object extents to the copyup coordinator.
    fn send_copyup(&mut self) {
        let object_size = self.image.layout.object_size();
        let image = Arc::clone(&self.image);
        let object_no = self.object_no;
        let snap_id = self.snap_id;
        let mut extents = std::mem::take(&mut self.parent_extents);
        let ready = image.with_snap_parent_read(|snap, parent| {
            image.compute_parent_extents(
                snap,
                parent,
                snap_id,
                object_no,
                0,
                object_size,
                &mut extents,
            ) && image.is_exclusive_lock_owner().unwrap_or(true)
        });
        if !ready {
            return;
        }
        copyup::start_or_attach(&image, object_no, &self.oid, extents, None);
    }

    fn finish(self: Box<Self>, r: Status) {
        trace!(target: "sbd::object", oid = %self.oid, r, "read complete");
        let this = *self;
        this.completion.complete(r);
    }
}
