// Scheduler module: job state machine, timers, dispatch and reconciliation

pub mod dispatcher;
pub mod engine;
pub mod locks;
pub mod reconciler;
pub mod timer;

pub use dispatcher::JobDispatcher;
pub use engine::{TimerJobScheduler, TimerJobSchedulerConfig};
pub use locks::JobLocks;
pub use reconciler::{MessagingMode, ReconcileSummary, ReconcilerConfig, SchedulerReconciler};
pub use timer::{FiredTimer, TimerBackend, TokioTimerBackend};
