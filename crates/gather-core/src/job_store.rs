use std::future::Future;

use crate::error::AppError;
use crate::job::ScheduledJob;

/// Persistence for scheduled jobs so they survive restarts.
///
/// The scheduler owns the in-memory state and writes the full job set after
/// every transition; implementations should replace the stored set atomically.
pub trait JobStore: Send + Sync + Clone + 'static {
    fn load(&self) -> impl Future<Output = Result<Vec<ScheduledJob>, AppError>> + Send;

    fn save(&self, jobs: &[ScheduledJob]) -> impl Future<Output = Result<(), AppError>> + Send;
}
