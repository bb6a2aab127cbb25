//! Chunked processing of candidate case ids

use std::collections::BTreeMap;

use super::global_state::GlobalSyncState;
use super::{BatchedSyncPlanner, CancelHandle, PlanContext};
use crate::classifier;
use crate::error::Result;
use crate::footprint::FootprintResolver;
use crate::models::{Case, CaseId};
use crate::store::CaseStore;

/// Why a case id entered a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reason {
    /// Owned by one of the request's owners, according to the store query
    Candidate,
    /// Referenced by, or extending, a justified case
    Dependency,
    /// Held by the previous log and not reached otherwise
    Held,
}

impl<S: CaseStore> BatchedSyncPlanner<'_, S> {
    /// Fetch, classify and expand `seed` until no new dependency turns up
    pub(crate) async fn process_batch(
        &self,
        ctx: &PlanContext<'_>,
        state: &mut GlobalSyncState,
        seed: impl IntoIterator<Item = (CaseId, Reason)>,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let domain = ctx.request.domain.as_str();
        let resolver = FootprintResolver::new(self.store, domain, self.chunk_size);
        let mut pending: BTreeMap<CaseId, Reason> = BTreeMap::new();
        for (case_id, reason) in seed {
            queue(&mut pending, state, case_id, reason);
        }

        let mut chunks = 0_usize;
        while !pending.is_empty() {
            cancel.check()?;
            let mut chunk = Vec::with_capacity(self.chunk_size.min(pending.len()));
            while chunk.len() < self.chunk_size {
                let Some(entry) = pending.pop_first() else {
                    break;
                };
                chunk.push(entry);
            }

            let ids: Vec<CaseId> = chunk.iter().map(|(case_id, _)| case_id.clone()).collect();
            let mut fetched: BTreeMap<CaseId, Case> = self
                .store
                .get_cases(domain, &ids)
                .await?
                .into_iter()
                .map(|case| (case.case_id.clone(), case))
                .collect();

            let mut newly_justified = Vec::new();
            for (case_id, reason) in chunk {
                match fetched.remove(&case_id) {
                    Some(case) if !case.deleted => {
                        if visit(ctx, state, &case, reason) {
                            newly_justified.push(case);
                        }
                    }
                    _ => {
                        if ctx.previous_holds(&case_id) {
                            tracing::debug!(case_id = %case_id, "Held case is gone from the store");
                            state.mark_removed(case_id);
                        }
                    }
                }
            }

            if !newly_justified.is_empty() {
                for case_id in resolver.expand_one_hop(&newly_justified).await? {
                    queue(&mut pending, state, case_id, Reason::Dependency);
                }
            }
            chunks += 1;
            tracing::debug!(
                chunk = chunks,
                justified = state.justified_count(),
                pending = pending.len(),
                "Processed sync chunk"
            );
        }
        Ok(())
    }
}

fn queue(
    pending: &mut BTreeMap<CaseId, Reason>,
    state: &GlobalSyncState,
    case_id: CaseId,
    reason: Reason,
) {
    if state.is_justified(&case_id) || state.is_removed(&case_id) {
        return;
    }
    // a case already judged stale is only worth another look as a dependency
    if state.is_relevant(&case_id) && reason != Reason::Dependency {
        return;
    }
    pending
        .entry(case_id)
        .and_modify(|queued| {
            if reason == Reason::Dependency {
                *queued = Reason::Dependency;
            }
        })
        .or_insert(reason);
}

/// Record one fetched case. Returns whether it became justified.
fn visit(ctx: &PlanContext<'_>, state: &mut GlobalSyncState, case: &Case, reason: Reason) -> bool {
    let justified = ctx.owns(case)
        || reason == Reason::Dependency
        || (reason == Reason::Held && !case.closed && ctx.previous_dependent(&case.case_id));
    let held = ctx.previous_holds(&case.case_id);
    if !justified && !held {
        tracing::trace!(case_id = %case.case_id, "Skipping case with no reason to sync");
        return false;
    }

    if !state.is_synced(&case.case_id) && ctx.modified_since_previous(case) {
        if let Some(update) = classifier::sync_update(case, ctx.previous) {
            state.emit(update);
        }
    }
    state.record(case, justified)
}
