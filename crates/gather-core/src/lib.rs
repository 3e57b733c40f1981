pub mod circuit_breaker;
pub mod collect;
pub mod dedup;
pub mod error;
pub mod geo;
pub mod job;
pub mod job_store;
pub mod models;
pub mod normalize;
pub mod rate_limiter;
pub mod registry;
pub mod resilience;
pub mod schedule;
pub mod scheduler;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use collect::{CollectionRequest, CollectionResult, CollectionService};
pub use dedup::{DedupConfig, DeduplicationEngine};
pub use error::AppError;
pub use geo::BoundingBox;
pub use models::{
    CollectionStage, EnhancedEventInfo, NormalizedEvent, RawEventData, Source, SourceDefinition,
    SourceType, compute_hash,
};
pub use registry::SourceRegistry;
pub use resilience::{ResilienceConfig, ResilienceLayer};
pub use scheduler::{JobHandler, Scheduler, TracingSchedulerReporter};
pub use traits::{FallbackSearch, Fetcher, RunLogSink, SnapshotSink, SourceAdapter};
