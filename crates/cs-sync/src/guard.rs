//! Reconciliation safety guard.
//!
//! Every destructive reservation transition passes through here. The guard
//! distinguishes weak evidence (an id missing from a paginated snapshot)
//! from strong evidence (the source itself says the booking is gone or
//! cancelled) and only issues a [`TransitionPermit`] for the latter.

use std::sync::Arc;

use cs_channel::{ChannelApi, ChannelError, Mapper, MappingError, Resource};
use cs_core::calendar;
use cs_core::types::{
    CanonicalReservation, CancellationReason, ReservationPatch, ReservationStatus,
    TransitionPermit,
};
use cs_harness::breaker::{BreakerError, RunBreaker};
use serde_json::Value;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionReason {
    /// The by-id lookup answered 404.
    VerifiedAbsent,
    /// The by-id lookup returned the record with a cancelled status.
    RemoteCancelled,
    /// The record still exists upstream with this status.
    RemoteActive(ReservationStatus),
    /// The remote record could not be mapped to a status.
    Unmappable(String),
    /// Timeout, 5xx or rate limit after retries.
    LookupFailed(String),
    BreakerOpen,
    /// Credentials were rejected; the run must stop.
    AuthFailed(String),
}

/// Outcome of [`SafetyGuard::should_cancel`].
#[derive(Debug, Clone)]
pub struct Decision {
    pub cancel: bool,
    pub reason: DecisionReason,
    permit: Option<TransitionPermit>,
}

impl Decision {
    fn cancel(external_id: &str, reason: CancellationReason) -> Self {
        Self {
            cancel: true,
            reason: match reason {
                CancellationReason::VerifiedAbsent => DecisionReason::VerifiedAbsent,
                CancellationReason::RemoteCancelled => DecisionReason::RemoteCancelled,
            },
            permit: Some(TransitionPermit::issue(
                external_id,
                ReservationStatus::Cancelled,
                Some(reason),
            )),
        }
    }

    fn keep(reason: DecisionReason) -> Self {
        Self {
            cancel: false,
            reason,
            permit: None,
        }
    }

    pub fn permit(&self) -> Option<&TransitionPermit> {
        self.permit.as_ref()
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.reason, DecisionReason::AuthFailed(_))
    }
}

/// Outcome of re-validating a previously cancelled reservation.
#[derive(Debug, Clone)]
pub enum RestoreVerdict {
    /// Found upstream with an active status; the patch carries the remote
    /// record mapped in full.
    Restore(ReservationPatch),
    StillCancelled,
    Skip(DecisionReason),
}

// ---------------------------------------------------------------------------
// SafetyGuard
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SafetyGuard {
    api: Arc<dyn ChannelApi>,
    mapper: Arc<Mapper>,
}

impl SafetyGuard {
    pub fn new(api: Arc<dyn ChannelApi>, mapper: Arc<Mapper>) -> Self {
        Self { api, mapper }
    }

    /// Decide whether a reservation missing from a snapshot may be cancelled.
    ///
    /// Always performs a direct by-id lookup. Only a 404 or a record whose
    /// status maps to `cancelled` yields `cancel = true`; anything else is a
    /// skip for this run.
    pub async fn should_cancel(
        &self,
        local: &CanonicalReservation,
        breaker: Option<&RunBreaker>,
    ) -> Decision {
        let id = local.external_id.as_str();
        let lookup = match breaker {
            Some(b) => b
                .call(|| self.api.fetch_by_id(Resource::Reservations, id))
                .await
                .map_err(|e| match e {
                    BreakerError::Open => LookupError::BreakerOpen,
                    BreakerError::Timeout(d) => LookupError::Failed(format!("timed out after {d:?}")),
                    BreakerError::Inner(e) => LookupError::Channel(e),
                }),
            None => self
                .api
                .fetch_by_id(Resource::Reservations, id)
                .await
                .map_err(LookupError::Channel),
        };

        let decision = match lookup {
            Err(LookupError::Channel(e)) if e.is_not_found() => {
                Decision::cancel(id, CancellationReason::VerifiedAbsent)
            }
            Err(LookupError::Channel(e)) if e.is_auth() => {
                Decision::keep(DecisionReason::AuthFailed(e.to_string()))
            }
            Err(LookupError::Channel(e)) => Decision::keep(DecisionReason::LookupFailed(e.to_string())),
            Err(LookupError::Failed(msg)) => Decision::keep(DecisionReason::LookupFailed(msg)),
            Err(LookupError::BreakerOpen) => Decision::keep(DecisionReason::BreakerOpen),
            Ok(record) => match self.mapper.status_of(&record) {
                Ok(Some(ReservationStatus::Cancelled)) => {
                    Decision::cancel(id, CancellationReason::RemoteCancelled)
                }
                Ok(Some(status)) => Decision::keep(DecisionReason::RemoteActive(status)),
                Ok(None) => Decision::keep(DecisionReason::Unmappable("record has no status".into())),
                Err(e) => Decision::keep(DecisionReason::Unmappable(e.to_string())),
            },
        };

        if decision.cancel {
            info!(reservation = id, reason = ?decision.reason, "guard: cancellation verified");
        } else {
            warn!(reservation = id, reason = ?decision.reason, "guard: absence not confirmed, skipping");
        }
        decision
    }

    /// Permit for a transition the source itself reported, either as a
    /// record carrying the new status or as an explicit cancellation event.
    /// `None` when the transition is not destructive and needs no permit.
    pub fn permit_for_remote(
        &self,
        current: Option<&CanonicalReservation>,
        patch: &ReservationPatch,
    ) -> Option<TransitionPermit> {
        let to = patch.status?;
        let needs = match current {
            Some(cur) => calendar::requires_permit(cur.status, to),
            None => to == ReservationStatus::Cancelled,
        };
        if !needs {
            return None;
        }
        let reason = (to == ReservationStatus::Cancelled).then_some(CancellationReason::RemoteCancelled);
        debug!(reservation = %patch.external_id, %to, "guard: permit from remote evidence");
        Some(TransitionPermit::issue(patch.external_id.clone(), to, reason))
    }

    /// Re-validate a cancelled reservation by direct lookup.
    pub async fn verify_for_restore(&self, local: &CanonicalReservation) -> RestoreVerdict {
        let id = local.external_id.as_str();
        let record = match self.api.fetch_by_id(Resource::Reservations, id).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return RestoreVerdict::StillCancelled,
            Err(e) if e.is_auth() => return RestoreVerdict::Skip(DecisionReason::AuthFailed(e.to_string())),
            Err(e) => return RestoreVerdict::Skip(DecisionReason::LookupFailed(e.to_string())),
        };
        match self.remote_patch(&record) {
            Ok(patch) => match patch.status {
                Some(ReservationStatus::Cancelled) => RestoreVerdict::StillCancelled,
                Some(_) if patch.external_id == id => RestoreVerdict::Restore(patch),
                Some(_) => RestoreVerdict::Skip(DecisionReason::Unmappable(format!(
                    "lookup for {id} returned {}",
                    patch.external_id
                ))),
                None => RestoreVerdict::Skip(DecisionReason::Unmappable("record has no status".into())),
            },
            Err(e) => RestoreVerdict::Skip(DecisionReason::Unmappable(e.to_string())),
        }
    }

    fn remote_patch(&self, record: &Value) -> Result<ReservationPatch, MappingError> {
        self.mapper.map_reservation(record)
    }
}

enum LookupError {
    Channel(ChannelError),
    Failed(String),
    BreakerOpen,
}
