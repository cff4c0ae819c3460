//! Usage sampling: run the external usage command and parse its report.
//!
//! The command runs under a process-local single-flight guard with an
//! execution timeout and an output size cap, so a misbehaving collaborator
//! can neither pile up concurrent runs nor exhaust memory.

pub mod source;
pub mod types;

pub use source::{
    CommandUsageSource, ProcessUsageCommand, UsageCommand, UsageProcess, UsageSource,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_GUARD_TIMEOUT, DEFAULT_MAX_OUTPUT_BYTES,
};
pub use types::{ModelBreakdown, MonthlyUsage, UsageReport, UsageSnapshot, UsageTotals};
