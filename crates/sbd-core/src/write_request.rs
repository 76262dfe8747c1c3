//! Per-object write-family automaton.
//!
//! Write, zero, truncate, and remove share one state machine: an optional
//! object-map pre-update, the guarded or flat store write, parent copyup on
//! `-ENOENT`, and an optional post-update. Variant behavior hangs off
//! `WriteVariant` hooks rather than an inheritance chain.
//!
//! State walk, happy paths:
//!
//! ```text
//! send -> [Pre] -> Flat ------------------> [Post] -> complete
//!                  Guard --ENOENT--> Copyup --^
//! ```

use crate::copyup;
use crate::image::ImageContext;
use sbd_store::{StatusCallback, WriteBatch};
use sbd_types::{ImageExtent, ObjectNo, ObjectState, SnapContext, SnapId, Status};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Pre,
    Flat,
    Guard,
    Copyup,
    Post,
    Error,
}

/// Variant payload and dispatch tag.
enum WriteVariant {
    Write { data: Vec<u8>, op_flags: i32 },
    Zero,
    Truncate,
    Remove,
}

impl WriteVariant {
    fn name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Zero => "zero",
            Self::Truncate => "truncate",
            Self::Remove => "remove",
        }
    }
}

/// One in-flight mutation of one backing object.
pub struct ObjectWriteRequest {
    image: Arc<ImageContext>,
    oid: String,
    object_no: ObjectNo,
    object_off: u64,
    object_len: u64,
    snap_seq: u64,
    snaps: Vec<SnapId>,
    hide_enoent: bool,
    parent_extents: Vec<ImageExtent>,
    state: WriteState,
    object_exist: bool,
    variant: WriteVariant,
    completion: StatusCallback,
}

impl ObjectWriteRequest {
    #[expect(clippy::too_many_arguments)]
    pub fn create_write(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        object_off: u64,
        data: Vec<u8>,
        snapc: &SnapContext,
        op_flags: i32,
        completion: StatusCallback,
    ) -> Box<Self> {
        let object_len = data.len() as u64;
        Self::new(
            image,
            oid,
            object_no,
            object_off,
            object_len,
            WriteVariant::Write { data, op_flags },
            snapc,
            false,
            completion,
        )
    }

    pub fn create_zero(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        object_off: u64,
        object_len: u64,
        snapc: &SnapContext,
        completion: StatusCallback,
    ) -> Box<Self> {
        Self::new(
            image,
            oid,
            object_no,
            object_off,
            object_len,
            WriteVariant::Zero,
            snapc,
            true,
            completion,
        )
    }

    pub fn create_truncate(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        object_off: u64,
        snapc: &SnapContext,
        completion: StatusCallback,
    ) -> Box<Self> {
        Self::new(
            image,
            oid,
            object_no,
            object_off,
            0,
            WriteVariant::Truncate,
            snapc,
            true,
            completion,
        )
    }

    pub fn create_remove(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        snapc: &SnapContext,
        completion: StatusCallback,
    ) -> Box<Self> {
        Self::new(
            image,
            oid,
            object_no,
            0,
            0,
            WriteVariant::Remove,
            snapc,
            true,
            completion,
        )
    }

    #[expect(clippy::too_many_arguments)]
    fn new(
        image: &Arc<ImageContext>,
        oid: &str,
        object_no: ObjectNo,
        object_off: u64,
        object_len: u64,
        variant: WriteVariant,
        snapc: &SnapContext,
        hide_enoent: bool,
        completion: StatusCallback,
    ) -> Box<Self> {
        let object_size = image.layout.object_size();
        let mut parent_extents = Vec::new();
        image.with_snap_parent_read(|snap, parent| {
            image.compute_parent_extents(
                snap,
                parent,
                SnapId::NO_SNAP,
                object_no,
                0,
                object_size,
                &mut parent_extents,
            )
        });
        Box::new(Self {
            image: Arc::clone(image),
            oid: oid.to_owned(),
            object_no,
            object_off,
            object_len,
            snap_seq: snapc.seq,
            snaps: snapc.snaps.clone(),
            hide_enoent,
            parent_extents,
            state: WriteState::Flat,
            object_exist: false,
            variant,
            completion,
        })
    }

    fn has_parent(&self) -> bool {
        !self.parent_extents.is_empty()
    }

    pub fn send(self: Box<Self>) {
        trace!(
            target: "sbd::object",
            kind = self.variant.name(),
            oid = %self.oid,
            off = self.object_off,
            len = self.object_len,
            "send"
        );
        self.send_pre();
    }

    /// Pre-write object-map gate (§object_map). On gate skip the write is
    /// issued directly.
    fn send_pre(self: Box<Self>) {
        let image = Arc::clone(&self.image);
        let mut this = Some(self);
        {
            let _snap = image.snap.read();
            let map_guard = image.object_map.write();
            match map_guard.as_ref() {
                None => {
                    if let Some(req) = this.as_mut() {
                        req.object_exist = true;
                    }
                }
                Some(map) => {
                    // must have been acquired before dirtying the image
                    assert!(
                        image.is_exclusive_lock_owner().unwrap_or(false),
                        "object map requires exclusive lock ownership"
                    );
                    let req = this.as_mut().expect("request still owned");
                    req.object_exist = map.object_may_exist(req.object_no);
                    let new_state = req.pre_object_map_update();
                    if map.update_required(req.object_no, new_state) {
                        trace!(
                            target: "sbd::object",
                            oid = %req.oid,
                            new_state = ?new_state,
                            "pre object map update"
                        );
                        let mut boxed = this.take().expect("request still owned");
                        boxed.state = WriteState::Pre;
                        let object_no = boxed.object_no;
                        let updated = map.aio_update(
                            object_no,
                            new_state,
                            None,
                            StatusCallback::new(move |r| boxed.complete(r)),
                        );
                        assert!(updated, "object map refused pre-write update");
                    }
                }
            }
        }
        // no map update required; avoid recursive lock attempts by issuing
        // the write outside the guards
        if let Some(req) = this {
            req.send_write();
        }
    }

    fn send_write(self: Box<Self>) {
        trace!(
            target: "sbd::object",
            kind = self.variant.name(),
            oid = %self.oid,
            object_exist = self.object_exist,
            "send write"
        );
        match self.variant {
            WriteVariant::Write { .. } => {
                let write_full =
                    self.object_off == 0 && self.object_len == self.image.layout.object_size();
                if write_full && !self.has_parent() {
                    // write_full creates unconditionally; no guard needed
                    self.send_write_op(false);
                } else {
                    self.send_write_default();
                }
            }
            // removal never copies up
            WriteVariant::Remove => self.send_write_op(true),
            WriteVariant::Truncate => {
                if !self.object_exist && !self.has_parent() {
                    let mut this = self;
                    this.state = WriteState::Flat;
                    trace!(
                        target: "sbd::object",
                        oid = %this.oid,
                        "truncate of nonexistent orphan, completing via work queue"
                    );
                    let queue = Arc::clone(&this.image.op_work_queue);
                    queue.queue(StatusCallback::new(move |r| this.complete(r)), 0);
                } else {
                    self.send_write_default();
                }
            }
            WriteVariant::Zero => self.send_write_default(),
        }
    }

    fn send_write_default(self: Box<Self>) {
        if !self.object_exist && self.has_parent() {
            let mut this = self;
            this.state = WriteState::Guard;
            this.handle_write_guard();
        } else {
            self.send_write_op(true);
        }
    }

    fn send_write_op(mut self: Box<Self>, with_guard: bool) {
        self.state = WriteState::Flat;
        let mut batch = WriteBatch::new();
        if with_guard {
            self.guard_write(&mut batch);
        }
        self.add_write_ops(&mut batch);
        assert!(!batch.is_empty(), "write batch must contain at least one op");

        let snapc = SnapContext {
            seq: self.snap_seq,
            snaps: self.snaps.clone(),
        };
        let store = Arc::clone(&self.image.store);
        let oid = self.oid.clone();
        store
            .aio_write(
                &oid,
                batch,
                &snapc,
                StatusCallback::new(move |r| self.complete(r)),
            )
            .expect("object store rejected write submission");
    }

    /// Inject an existence precondition so a write that must copyup observes
    /// `-ENOENT` instead of silently creating the object.
    fn guard_write(&mut self, batch: &mut WriteBatch) {
        if matches!(self.variant, WriteVariant::Remove) {
            // guard only when deep-copyup preservation is required
            if !self.image.snap.read().has_snapshots() {
                return;
            }
        }
        if self.has_parent() {
            trace!(target: "sbd::object", oid = %self.oid, "guarding write");
            self.state = WriteState::Guard;
            batch.assert_exists();
        }
    }

    /// Append this request's mutations to `batch`. Also used by the copyup
    /// coordinator to fold waiter mutations into the copyup write.
    pub(crate) fn add_write_ops(&self, batch: &mut WriteBatch) {
        match &self.variant {
            WriteVariant::Write { data, op_flags } => {
                let hint = {
                    let _snap = self.image.snap.read();
                    let map = self.image.object_map.read();
                    self.image.enable_alloc_hint && (map.is_none() || !self.object_exist)
                };
                let object_size = self.image.layout.object_size();
                if hint {
                    batch.set_alloc_hint(object_size, object_size);
                }
                if self.object_off == 0 && self.object_len == object_size {
                    batch.write_full(data.clone());
                } else {
                    batch.write(self.object_off, data.clone());
                }
                batch.set_op_flags2(*op_flags);
            }
            WriteVariant::Zero => batch.zero(self.object_off, self.object_len),
            WriteVariant::Truncate => batch.truncate(self.object_off),
            WriteVariant::Remove => {
                if self.snaps.is_empty() {
                    batch.remove();
                } else {
                    batch.remove_with_snaps();
                }
            }
        }
    }

    fn pre_object_map_update(&self) -> ObjectState {
        match self.variant {
            WriteVariant::Remove => ObjectState::Pending,
            _ => ObjectState::Exists,
        }
    }

    fn post_object_map_update(&self) -> bool {
        matches!(self.variant, WriteVariant::Remove)
    }

    /// Universal re-entry: one stage finished with `r`.
    pub fn complete(mut self: Box<Self>, r: Status) {
        trace!(
            target: "sbd::object",
            kind = self.variant.name(),
            oid = %self.oid,
            state = ?self.state,
            r,
            "write should_complete"
        );
        match self.state {
            WriteState::Pre => {
                if r < 0 {
                    self.finish(r);
                } else {
                    self.send_write();
                }
            }
            WriteState::Guard => {
                if r == -libc::ENOENT {
                    self.handle_write_guard();
                } else if r < 0 {
                    self.state = WriteState::Error;
                    self.finish(r);
                } else {
                    self.send_post(r);
                }
            }
            WriteState::Copyup => {
                if r < 0 {
                    self.state = WriteState::Error;
                    self.finish(r);
                } else {
                    self.send_post(r);
                }
            }
            WriteState::Flat => self.send_post(r),
            WriteState::Post => self.finish(r),
            WriteState::Error => {
                debug_assert!(r < 0);
                self.finish(r);
            }
        }
    }

    /// The guarded write hit `-ENOENT`: copyup if the parent still covers
    /// this object, otherwise the parent disappeared and the original write
    /// is re-sent unguarded.
    fn handle_write_guard(mut self: Box<Self>) {
        let object_size = self.image.layout.object_size();
        let image = Arc::clone(&self.image);
        let object_no = self.object_no;
        let mut extents = std::mem::take(&mut self.parent_extents);
        let has_parent = image.with_snap_parent_read(|snap, parent| {
            image.compute_parent_extents(
                snap,
                parent,
                SnapId::NO_SNAP,
                object_no,
                0,
                object_size,
                &mut extents,
            )
        });
        self.parent_extents = extents;
        if has_parent {
            self.send_copyup();
        } else {
            trace!(
                target: "sbd::object",
                oid = %self.oid,
                "parent overlap now 0, resending write"
            );
            self.send_write();
        }
    }

    fn send_copyup(mut self: Box<Self>) {
        trace!(target: "sbd::object", oid = %self.oid, "send copyup");
        self.state = WriteState::Copyup;
        let image = Arc::clone(&self.image);
        let object_no = self.object_no;
        let oid = self.oid.clone();
        let extents = std::mem::take(&mut self.parent_extents);
        copyup::start_or_attach(&image, object_no, &oid, extents, Some(self));
    }

    /// Post-write object-map gate: only variants that may leave the object
    /// nonexistent submit the `Pending -> Nonexistent` transition.
    fn send_post(self: Box<Self>, r: Status) {
        let image = Arc::clone(&self.image);
        let mut this = Some(self);
        {
            let _snap = image.snap.read();
            let req = this.as_ref().expect("request still owned");
            if req.post_object_map_update() {
                let map_guard = image.object_map.write();
                if let Some(map) = map_guard.as_ref() {
                    assert!(
                        image.is_exclusive_lock_owner().unwrap_or(false),
                        "object map requires exclusive lock ownership"
                    );
                    if map.update_required(req.object_no, ObjectState::Nonexistent) {
                        trace!(
                            target: "sbd::object",
                            oid = %req.oid,
                            "post object map update"
                        );
                        let mut boxed = this.take().expect("request still owned");
                        boxed.state = WriteState::Post;
                        let object_no = boxed.object_no;
                        let updated = map.aio_update(
                            object_no,
                            ObjectState::Nonexistent,
                            Some(ObjectState::Pending),
                            StatusCallback::new(move |r| boxed.complete(r)),
                        );
                        assert!(updated, "object map refused post-write update");
                    }
                }
            }
        }
        if let Some(req) = this {
            req.finish(r);
        }
    }

    fn finish(self: Box<Self>, mut r: Status) {
        if self.hide_enoent && r == -libc::ENOENT {
            r = 0;
        }
        trace!(
            target: "sbd::object",
            kind = self.variant.name(),
            oid = %self.oid,
            r,
            "write complete"
        );
        let this = *self;
        this.completion.complete(r);
    }
}
