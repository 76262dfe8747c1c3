//! Copyup coordination: materialize a child object from its parent.
//!
//! A copyup job is keyed by object number in the image's registry so that
//! concurrent demand coalesces: exactly one parent read, at most one object
//! map update, and exactly one full-object write happen per episode no
//! matter how many requests wanted the copyup. Write requests waiting on the
//! job are resumed with its terminal status after the registry entry is
//! removed; read-initiated jobs are fire-and-forget.

use crate::image::ImageContext;
use crate::write_request::ObjectWriteRequest;
use parking_lot::Mutex;
use sbd_store::{SharedReadBuf, StatusCallback, WriteBatch};
use sbd_types::{ImageExtent, ObjectNo, ObjectState, Status};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::trace;

struct CopyupInner {
    parent_extents: Vec<ImageExtent>,
    data: SharedReadBuf,
    waiters: Vec<Box<ObjectWriteRequest>>,
}

/// One in-flight copyup episode for one backing object.
pub(crate) struct CopyupJob {
    image: Arc<ImageContext>,
    oid: String,
    object_no: ObjectNo,
    // Leaf lock. The ops-folding path acquires image locks while holding it;
    // that is safe because no path acquires it while holding an image lock.
    inner: Mutex<CopyupInner>,
}

/// Register demand for a copyup of `object_no`.
///
/// First caller creates and sends the job (outside the registry lock);
/// later callers append their waiter to the existing job. `parent_extents`
/// are moved into the job only when it is created.
pub(crate) fn start_or_attach(
    image: &Arc<ImageContext>,
    object_no: ObjectNo,
    oid: &str,
    parent_extents: Vec<ImageExtent>,
    waiter: Option<Box<ObjectWriteRequest>>,
) {
    let new_job = {
        let mut registry = image.copyup_registry.lock();
        match registry.entry(object_no) {
            Entry::Occupied(entry) => {
                trace!(
                    target: "sbd::copyup",
                    oid,
                    object_no = %object_no,
                    "attaching to in-flight copyup"
                );
                if let Some(waiter) = waiter {
                    entry.get().inner.lock().waiters.push(waiter);
                }
                None
            }
            Entry::Vacant(slot) => {
                let job = Arc::new(CopyupJob {
                    image: Arc::clone(image),
                    oid: oid.to_owned(),
                    object_no,
                    inner: Mutex::new(CopyupInner {
                        parent_extents,
                        data: SharedReadBuf::new(),
                        waiters: waiter.into_iter().collect(),
                    }),
                });
                slot.insert(Arc::clone(&job));
                Some(job)
            }
        }
    };
    if let Some(job) = new_job {
        job.send();
    }
}

impl CopyupJob {
    fn send(self: Arc<Self>) {
        trace!(
            target: "sbd::copyup",
            oid = %self.oid,
            object_no = %self.object_no,
            "reading from parent"
        );
        let reader = self
            .image
            .with_snap_parent_read(|_, parent| parent.map(|p| Arc::clone(&p.reader)));
        let Some(reader) = reader else {
            // parent detached between registration and send
            self.finish(-libc::ENOENT);
            return;
        };
        let (extents, out) = {
            let inner = self.inner.lock();
            (inner.parent_extents.clone(), inner.data.clone())
        };
        reader.aio_read(extents, out, StatusCallback::new(move |r| self.handle_read(r)));
    }

    fn handle_read(self: Arc<Self>, r: Status) {
        trace!(
            target: "sbd::copyup",
            oid = %self.oid,
            r,
            "parent read finished"
        );
        if r < 0 {
            self.finish(r);
            return;
        }
        self.send_object_map_update();
    }

    fn send_object_map_update(self: Arc<Self>) {
        let submitted = {
            let _snap = self.image.snap.read();
            let map_guard = self.image.object_map.write();
            match map_guard.as_ref() {
                Some(map) if map.update_required(self.object_no, ObjectState::Exists) => {
                    debug_assert!(self.image.is_exclusive_lock_owner().unwrap_or(true));
                    trace!(
                        target: "sbd::copyup",
                        oid = %self.oid,
                        object_no = %self.object_no,
                        "updating object map"
                    );
                    let job = Arc::clone(&self);
                    let updated = map.aio_update(
                        self.object_no,
                        ObjectState::Exists,
                        None,
                        StatusCallback::new(move |r| job.handle_map_update(r)),
                    );
                    assert!(updated, "object map refused copyup update");
                    true
                }
                _ => false,
            }
        };
        if !submitted {
            self.send_copyup_write();
        }
    }

    fn handle_map_update(self: Arc<Self>, r: Status) {
        if r < 0 {
            self.finish(r);
            return;
        }
        self.send_copyup_write();
    }

    fn send_copyup_write(self: Arc<Self>) {
        let snapc = self.image.snap_context();
        let mut batch = WriteBatch::new();
        {
            let inner = self.inner.lock();
            batch.write_full(inner.data.snapshot());
            // fold in the mutations of every waiter registered so far, so
            // they land atomically over the copied data
            for waiter in &inner.waiters {
                waiter.add_write_ops(&mut batch);
            }
        }
        trace!(
            target: "sbd::copyup",
            oid = %self.oid,
            ops = batch.len(),
            "writing object"
        );
        let store = Arc::clone(&self.image.store);
        let oid = self.oid.clone();
        store
            .aio_write(
                &oid,
                batch,
                &snapc,
                StatusCallback::new(move |r| self.handle_write(r)),
            )
            .expect("object store rejected copyup write submission");
    }

    fn handle_write(self: Arc<Self>, r: Status) {
        self.finish(r);
    }

    /// Remove the registry entry, then resume every waiter with `r`.
    fn finish(self: Arc<Self>, r: Status) {
        self.image.copyup_registry.lock().remove(&self.object_no);
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        trace!(
            target: "sbd::copyup",
            oid = %self.oid,
            r,
            waiters = waiters.len(),
            "copyup finished"
        );
        for waiter in waiters {
            waiter.complete(r);
        }
    }
}
