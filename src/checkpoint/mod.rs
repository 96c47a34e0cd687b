//! Working-tree checkpoints over the content store.
//!
//! - `store`: [`CheckpointStore`], snapshot/restore/branch/gc.
//! - `timeline`: the append-only per-project DAG index.
//! - `walker`: project enumeration and the [`IgnoreList`].
//! - `path_safety`: restore path validation.

pub mod path_safety;
pub mod store;
pub mod timeline;
pub mod walker;

pub use store::{CheckpointStore, GcReport};
pub use timeline::{Timeline, TimelineRecord};
pub use walker::IgnoreList;
