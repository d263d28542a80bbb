//! Background retry of executions left PENDING by a transient failure.

pub mod engine;

pub use self::engine::{run_retry_loop, sweep_pending, SweepStats};
