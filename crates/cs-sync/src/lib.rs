//! Sync orchestration: webhook ingress and its incremental workers, the
//! full reconciliation pass, the reconciliation safety guard and the
//! restore job.

pub mod engine;
pub mod error;
pub mod guard;
pub mod incremental;
pub mod ingress;
pub mod reconcile;
pub mod restore;
pub mod signature;

pub use engine::{EntitySummary, RunReport, SyncEngine};
pub use error::{Result, SyncError};
pub use guard::{Decision, DecisionReason, RestoreVerdict, SafetyGuard};
pub use incremental::{spawn_workers, EventOutcome, IncrementalSync};
pub use ingress::{Delivery, IngressOutcome, RejectReason, WebhookIngress, EVENT_ID_HEADER};
pub use reconcile::{ReconcileMode, ReconcileRequest, Reconciler};
pub use restore::{RestoreJob, RestoreReport, RestoreStats};
pub use signature::SIGNATURE_HEADER;
