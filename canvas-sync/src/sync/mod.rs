pub mod diff;
pub mod enumerate;
pub mod error;
pub mod fetch;
pub mod paths;
pub mod pipeline;
mod tasks;
pub mod transfer;
pub mod tree;

pub use diff::{FileToSync, LocalDisk, LocalMetadata, MetadataProbe, collect_files_to_sync, diff_tree};
pub use error::SyncError;
pub use pipeline::{SyncOptions, SyncReport, Syncer};
pub use transfer::SyncStats;
pub use tree::{CourseTree, TreeBuilder, TreeError, TreeFolder};
