//! Queue module - admission control, per-user rate limiting and the request scheduler

pub mod rate_limit;
pub mod retry;
pub mod scheduler;

pub use rate_limit::{Tier, UserRateLimiter};
pub use retry::should_retry;
pub use scheduler::{
    EnqueueOptions, QueueStatus, RequestScheduler, SchedulerStats, TaskHandle, Work,
};
