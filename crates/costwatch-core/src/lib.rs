//! Core library for costwatch.
//!
//! Samples an externally reported monthly cost, compares it to a threshold,
//! and delivers at most one alert per calendar day of breach. The pieces:
//!
//! - [`guard`]: single-flight primitive serializing usage fetches
//! - [`usage`]: the guarded, size-capped, timed usage source
//! - [`state`]: the persisted dedup record and its stores
//! - [`gate`]: the pure notification decision
//! - [`notify`]: webhook delivery
//! - [`lock`]: PID-file single-instance lock
//! - [`scheduler`]: the check loop tying everything together

pub mod clock;
pub mod error;
pub mod gate;
pub mod guard;
pub mod lock;
pub mod notify;
pub mod scheduler;
pub mod state;
pub mod usage;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{FetchError, MonitorError, SinkError};
pub use gate::{decide, Decision};
pub use guard::{FlightPermit, SingleFlightGuard};
pub use lock::{is_process_running, InstanceLock, PidFileLock};
pub use notify::{format_alert, NotificationSink, WebhookSink};
pub use scheduler::{
    shutdown_channel, CheckResult, CycleStats, Scheduler, SchedulerConfig, SchedulerPhase,
    ShutdownListener, ShutdownTrigger,
};
pub use state::{JsonStateStore, MemoryStateStore, MonitorState, StateStore};
pub use usage::{
    CommandUsageSource, ProcessUsageCommand, UsageCommand, UsageProcess, UsageReport,
    UsageSnapshot, UsageSource,
};
