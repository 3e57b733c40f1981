pub mod config;
mod fs;
pub mod job_store;
pub mod run_log;
pub mod snapshot;
pub mod store;

pub use config::StoreConfig;
pub use job_store::FileJobStore;
pub use run_log::FsRunLogSink;
pub use snapshot::FsSnapshotSink;
pub use store::Store;
