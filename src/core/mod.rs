pub mod engine;
pub mod hasher;
pub mod manifest;
pub mod slug;
pub mod store;

pub use engine::{Dataset, FileChanges};
pub use hasher::{file_digest, files_total, tree_digest, FileEntry, WorkspaceChecksum};
pub use manifest::{Manifest, Tag, ThawedPointer};
pub use slug::{parse_slug, to_slug, validate_freezable_name, validate_tagname, DatasetId};
pub use store::ContentStore;
