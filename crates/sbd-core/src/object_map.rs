//! Object-map consultation seam.
//!
//! The object map is a persistent bitmap recording which backing objects may
//! exist. The request engine consults it to skip futile reads, to decide
//! allocation hints, and to gate pre-write/post-remove transitions. The map
//! itself is opaque behind the [`ObjectMap`] trait; [`BitmapObjectMap`] is
//! the in-memory implementation.

use crate::work_queue::OpWorkQueue;
use parking_lot::Mutex;
use sbd_store::StatusCallback;
use sbd_types::{ObjectNo, ObjectState};
use std::sync::Arc;
use tracing::trace;

/// Bitmap of per-object existence states.
///
/// `aio_update` returns whether a transition was submitted; the callback
/// fires asynchronously only when it returns `true`. Callers decide
/// necessity with `update_required` under the image's object-map lock, so a
/// `false` return after a positive `update_required` is a caller bug.
pub trait ObjectMap: Send + Sync {
    /// True unless the object is known not to exist.
    fn object_may_exist(&self, object_no: ObjectNo) -> bool;

    /// Whether moving `object_no` to `new_state` changes the map.
    fn update_required(&self, object_no: ObjectNo, new_state: ObjectState) -> bool;

    /// Submit an asynchronous state transition. When `expected` is given the
    /// transition applies only if the current state matches.
    fn aio_update(
        &self,
        object_no: ObjectNo,
        new_state: ObjectState,
        expected: Option<ObjectState>,
        on_complete: StatusCallback,
    ) -> bool;
}

/// In-memory [`ObjectMap`] delivering update callbacks through the image
/// work queue.
pub struct BitmapObjectMap {
    states: Mutex<Vec<ObjectState>>,
    queue: Arc<OpWorkQueue>,
}

impl BitmapObjectMap {
    /// Map of `object_count` objects, all initially nonexistent.
    #[must_use]
    pub fn new(object_count: u64, queue: Arc<OpWorkQueue>) -> Self {
        let count = usize::try_from(object_count).unwrap_or(usize::MAX);
        Self {
            states: Mutex::new(vec![ObjectState::Nonexistent; count]),
            queue,
        }
    }

    /// Current state of one object.
    #[must_use]
    pub fn state(&self, object_no: ObjectNo) -> ObjectState {
        let states = self.states.lock();
        states[Self::index(&states, object_no)]
    }

    /// Force a state, bypassing the update protocol.
    pub fn set_state(&self, object_no: ObjectNo, state: ObjectState) {
        let mut states = self.states.lock();
        let idx = Self::index(&states, object_no);
        states[idx] = state;
    }

    fn index(states: &[ObjectState], object_no: ObjectNo) -> usize {
        let idx = usize::try_from(object_no.0).unwrap_or(usize::MAX);
        assert!(idx < states.len(), "object {object_no} beyond map");
        idx
    }
}

impl ObjectMap for BitmapObjectMap {
    fn object_may_exist(&self, object_no: ObjectNo) -> bool {
        let states = self.states.lock();
        states[Self::index(&states, object_no)] != ObjectState::Nonexistent
    }

    fn update_required(&self, object_no: ObjectNo, new_state: ObjectState) -> bool {
        let states = self.states.lock();
        states[Self::index(&states, object_no)] != new_state
    }

    fn aio_update(
        &self,
        object_no: ObjectNo,
        new_state: ObjectState,
        expected: Option<ObjectState>,
        on_complete: StatusCallback,
    ) -> bool {
        let mut states = self.states.lock();
        let idx = Self::index(&states, object_no);
        let current = states[idx];
        if current == new_state {
            return false;
        }
        if let Some(expected) = expected {
            if current != expected {
                return false;
            }
        }
        trace!(
            target: "sbd::image",
            object_no = %object_no,
            from = ?current,
            to = ?new_state,
            "object map update"
        );
        states[idx] = new_state;
        drop(states);
        self.queue.queue(on_complete, 0);
        true
    }
}
