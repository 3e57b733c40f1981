mod common;
mod job_store_tests;
mod run_log_tests;
mod snapshot_tests;
