//! Round trips around one edited document.
//!
//! The orchestrator owns the reconciliation context and runs every round
//! trip the same way: prepare a batch under the lock, release it for the
//! network call, then settle the response under the lock again. The lock is
//! never held across an await, so edits made while a request is in flight go
//! straight into the live document and survive the merge.

use crate::codec::DocumentCodec;
use crate::endpoint::{SaveAction, SaveEndpoint};
use crate::error::{ClientError, ClientResult, EndpointError};
use crate::throttle::Throttle;
use draftline_engine::{
    AppliedResponse, ApplyOutcome, EditEffect, Error, FailureOutcome, ReconciliationContext,
    RoundTrip, RoundTripKind, Timestamp,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a round trip ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundTripOutcome {
    /// The response was merged into the live document
    Applied(AppliedResponse),
    /// A newer round trip was issued. Nothing was touched.
    Superseded,
    /// Not sent: recalculations are refused while a save is outstanding
    Rejected,
}

impl RoundTripOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RoundTripOutcome::Applied(_))
    }
}

struct Shared<E, C> {
    context: Mutex<ReconciliationContext>,
    endpoint: E,
    codec: C,
}

impl<E, C> Shared<E, C> {
    fn lock(&self) -> MutexGuard<'_, ReconciliationContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A round trip awaiting its response.
///
/// Dropped while still armed, when the caller's future is cancelled
/// mid-request, it releases the round trip so a lost save cannot block
/// recalculations.
struct InFlight<'a, E, C> {
    shared: &'a Shared<E, C>,
    round_trip: RoundTrip,
    armed: bool,
}

impl<E, C> InFlight<'_, E, C> {
    /// The response arrived; settling is up to the caller.
    fn land(mut self) {
        self.armed = false;
    }
}

impl<E, C> Drop for InFlight<'_, E, C> {
    fn drop(&mut self) {
        if self.armed && self.shared.lock().release(&self.round_trip) {
            debug!(sequence = self.round_trip.sequence, "round trip cancelled before its response");
        }
    }
}

/// Drives round trips for one document.
pub struct Orchestrator<E, C> {
    shared: Arc<Shared<E, C>>,
    throttle: Throttle<(), ClientResult<RoundTripOutcome>>,
}

/// Wall-clock milliseconds for round trip stamps.
fn now_ms() -> Timestamp {
    Timestamp::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

impl<E, C> Orchestrator<E, C>
where
    E: SaveEndpoint,
    C: DocumentCodec,
{
    pub fn new(context: ReconciliationContext, endpoint: E, codec: C, throttle: Duration) -> Self {
        let shared = Arc::new(Shared {
            context: Mutex::new(context),
            endpoint,
            codec,
        });

        let for_throttle = Arc::clone(&shared);
        let throttle = Throttle::new(throttle, move |()| {
            let shared = Arc::clone(&for_throttle);
            async move { round_trip(&shared, RoundTripKind::DryRun).await }
        });

        Self { shared, throttle }
    }

    /// Read the context.
    pub fn with_context<T>(&self, read: impl FnOnce(&ReconciliationContext) -> T) -> T {
        read(&*self.shared.lock())
    }

    /// Apply one edit to the context.
    pub fn edit(
        &self,
        edit: impl FnOnce(&mut ReconciliationContext) -> draftline_engine::Result<EditEffect>,
    ) -> ClientResult<EditEffect> {
        let mut ctx = self.shared.lock();
        Ok(edit(&mut *ctx)?)
    }

    /// Apply an edit and recalculate the way it requires.
    ///
    /// Field edits go through the throttle. Structural edits recalculate at
    /// once so the new round trip supersedes any outstanding one.
    pub async fn edit_and_recalculate(
        &self,
        edit: impl FnOnce(&mut ReconciliationContext) -> draftline_engine::Result<EditEffect>,
    ) -> ClientResult<Option<RoundTripOutcome>> {
        if self.edit(edit)?.is_structural() {
            self.recalculate_now().await.map(Some)
        } else {
            self.recalculate().await
        }
    }

    /// Throttled recalculation.
    ///
    /// `None` means the call was collapsed into one that was later cancelled.
    pub async fn recalculate(&self) -> ClientResult<Option<RoundTripOutcome>> {
        self.throttle.call(()).await.transpose()
    }

    /// Recalculate immediately. A pending throttled recalculation is dropped.
    pub async fn recalculate_now(&self) -> ClientResult<RoundTripOutcome> {
        if self.throttle.cancel() {
            debug!("dropped pending recalculation");
        }
        round_trip(&self.shared, RoundTripKind::DryRun).await
    }

    /// Recalculate and let the server plan transport.
    pub async fn auto_plan(&self) -> ClientResult<RoundTripOutcome> {
        round_trip(&self.shared, RoundTripKind::AutoPlan).await
    }

    /// Persist the document.
    pub async fn save(&self) -> ClientResult<RoundTripOutcome> {
        self.throttle.cancel();
        round_trip(&self.shared, RoundTripKind::FullSave).await
    }

    /// Consume the orchestrator and return the context.
    ///
    /// Pending throttled calls are cancelled. Round trips still in flight
    /// keep their own handle and are settled against a context nobody reads.
    pub fn into_context(self) -> ReconciliationContext {
        self.throttle.cancel();
        self.shared.lock().clone()
    }
}

async fn round_trip<E, C>(shared: &Shared<E, C>, kind: RoundTripKind) -> ClientResult<RoundTripOutcome>
where
    E: SaveEndpoint,
    C: DocumentCodec,
{
    let prepared = match shared.lock().prepare(kind, now_ms()) {
        Ok(prepared) => prepared,
        Err(Error::SaveInProgress) => {
            debug!(?kind, "save in progress, recalculation rejected");
            return Ok(RoundTripOutcome::Rejected);
        }
        Err(err) => return Err(err.into()),
    };

    let sequence = prepared.round_trip.sequence;
    info!(sequence, ?kind, operations = prepared.batch.len(), "issuing round trip");

    let in_flight = InFlight {
        shared,
        round_trip: prepared.round_trip,
        armed: true,
    };
    let response = shared
        .endpoint
        .submit(&prepared.batch, SaveAction::from(kind))
        .await;
    in_flight.land();

    let mut ctx = shared.lock();
    let results = match response {
        Ok(results) => results,
        Err(EndpointError::Validation(errors)) => {
            return match ctx.fail(&prepared, &errors)? {
                FailureOutcome::Recorded(resolved) => {
                    info!(sequence, errors = resolved.len(), "round trip rejected by server");
                    Err(ClientError::Validation(resolved))
                }
                FailureOutcome::Superseded => {
                    debug!(sequence, "stale validation errors dropped");
                    Ok(RoundTripOutcome::Superseded)
                }
            };
        }
        Err(err) => {
            if ctx.abort(&prepared)? {
                warn!(sequence, error = %err, "round trip failed");
                return Err(err.into());
            }
            debug!(sequence, "stale failure dropped");
            return Ok(RoundTripOutcome::Superseded);
        }
    };

    if !ctx.is_relevant(&prepared) {
        ctx.abort(&prepared)?;
        debug!(sequence, "stale response dropped");
        return Ok(RoundTripOutcome::Superseded);
    }

    let root_index = prepared.batch.root_index;
    let replacement = match results
        .get(root_index)
        .ok_or(ClientError::Engine(Error::MissingRootResult(root_index)))
        .and_then(|result| shared.codec.decode(result))
    {
        Ok(document) => document,
        Err(err) => {
            ctx.abort(&prepared)?;
            warn!(sequence, error = %err, "unreadable response");
            return Err(err);
        }
    };

    match ctx.apply_response(prepared, replacement)? {
        ApplyOutcome::Applied(applied) => {
            if !applied.skipped_additions.is_empty() {
                warn!(
                    sequence,
                    ids = ?applied.skipped_additions,
                    "children added during the round trip were left out of the merge"
                );
            }
            if !applied.overridden.is_empty() {
                debug!(sequence, fields = applied.overridden.len(), "user edits kept over recalculated values");
            }
            info!(sequence, ?kind, "round trip applied");
            Ok(RoundTripOutcome::Applied(applied))
        }
        ApplyOutcome::Superseded => Ok(RoundTripOutcome::Superseded),
    }
}
