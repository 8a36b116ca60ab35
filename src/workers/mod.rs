pub mod reconciliation;

pub use reconciliation::{
    OperationalReport, ReconciliationError, ReconciliationWorker, SweepReport,
};
