pub mod author_index;
pub mod dedup;
pub mod ingest;

pub use author_index::AuthorIndex;
pub use dedup::DedupWindow;
pub use ingest::ChatIngest;
