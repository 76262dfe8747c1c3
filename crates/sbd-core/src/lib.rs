#![forbid(unsafe_code)]
//! Per-object asynchronous I/O request engine.
//!
//! Each logical read or write issued by the image layer becomes one request
//! per affected backing object. A request is a small state machine driven by
//! completion callbacks: it consults the image metadata (snapshot view,
//! parent overlap, exclusive-lock ownership, object map), submits operations
//! to the object store, falls back to the parent on `-ENOENT`, and
//! coalesces copy-up work through a process-wide registry.
//!
//! Entry points are the request factories on
//! [`ObjectReadRequest`](read_request::ObjectReadRequest) and
//! [`ObjectWriteRequest`](write_request::ObjectWriteRequest); everything else
//! happens through the callbacks handed to the object store.

mod copyup;
pub mod image;
pub mod object_map;
pub mod read_request;
pub mod work_queue;
pub mod write_request;

pub use image::{
    ExclusiveLock, ImageContext, ImageOptions, ParentReader, ParentView, SliceParentImage,
    SnapInfo, SnapshotView,
};
pub use object_map::{BitmapObjectMap, ObjectMap};
pub use read_request::ObjectReadRequest;
pub use work_queue::OpWorkQueue;
pub use write_request::ObjectWriteRequest;
