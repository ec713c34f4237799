//! Bounded, paced dispatch of completion calls
//!
//! Two pieces:
//! - `RetryingInvoker` runs one operation with classification-driven retry:
//!   one credential rotation per invocation, exponential backoff on rate
//!   limits, gentler backoff on empty results, and a degraded-success return
//!   when results stay empty.
//! - `RateLimitedWorkPool` pushes a batch through a caller-supplied function
//!   with a hard in-flight ceiling and one global minimum spacing between
//!   dispatches.
//!
//! Neither piece has a cancellation token. A caller that needs to stop early
//! checks its own flag inside the per-item function.

pub mod invoker;
pub mod metrics;
pub mod work_pool;

pub use invoker::{RetryOutcome, RetryPolicy, RetryingInvoker};
pub use work_pool::{DEFAULT_MIN_SPACING, RateLimitedWorkPool, RunSummary};
