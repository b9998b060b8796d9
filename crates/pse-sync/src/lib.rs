//! Incremental sync of PSE companies and daily prices into a choice of destination backends.

pub mod config;
pub mod destination;
pub mod error;
pub mod extract;
pub mod job;
pub mod reconcile;
pub mod report;
pub mod scheduler;

pub use config::{DestinationKind, SyncConfig};
pub use destination::{
    ApplyOutcome, Backend, Destination, FailPoint, LakeDestination, MemoryDestination, PostgresDestination, Store,
    WarehouseDestination,
};
pub use error::SyncError;
pub use job::{sync_batch, BackfillRequest, JobAction, JobOptions, SyncJob};
pub use reconcile::{plan_replacement, reconcile, Eligibility, ReconcileStats, ReplacementPlan};
pub use report::{JobReport, JobStatus};

