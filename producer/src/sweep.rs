//! The deletion sweep: the first phase of a fresh morsel, removing
//! destination content that no longer exists at the source.
//!
//! The source space is enumerated in full into a bounded membership set,
//! then the destination is scanned against it. Stray ids are buffered and
//! flushed in chunks so a pathological destination cannot balloon memory.
//! The emitted tasks are ordinary duplication tasks; the processor deletes
//! because the source turns out to be absent when they run.

use crate::{
    fetch_chunk, membership::DigestSet, Error, MembershipSnafu, SweepStorageSnafu, TaskSink,
    LISTING_PAGE_SIZE,
};
use backoff::{Backoff, BackoffConfig};
use data_types::{ContentId, Morsel, Task};
use observability_deps::tracing::{debug, info};
use snafu::ResultExt;
use storage::StorageProvider;

/// Stray ids buffered before being turned into delete tasks.
pub(crate) const SWEEP_FLUSH_SIZE: usize = 10_000;

pub(crate) async fn deletion_sweep(
    src: &dyn StorageProvider,
    dst: &dyn StorageProvider,
    morsel: &Morsel,
    spill_threshold: usize,
    backoff_config: &BackoffConfig,
    sink: &mut TaskSink<'_>,
) -> Result<(), Error> {
    let dst_exists = Backoff::new(backoff_config)
        .retry_all_errors("destination space exists", || {
            dst.space_exists(&morsel.space_id)
        })
        .await
        .context(SweepStorageSnafu {
            account: morsel.account.clone(),
            space_id: morsel.space_id.clone(),
        })?;
    if !dst_exists {
        info!(morsel=%morsel, "destination space does not exist, skipping deletion sweep");
        return Ok(());
    }

    // phase 1: full source enumeration into the membership set
    let mut membership = DigestSet::new(spill_threshold);
    let mut source_ids = 0usize;
    let mut marker: Option<ContentId> = None;
    loop {
        let page = match fetch_chunk(
            src,
            &morsel.space_id,
            marker.as_ref(),
            LISTING_PAGE_SIZE,
            backoff_config,
        )
        .await
        {
            Ok(page) => page,
            // an absent source space means every destination id is stray
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                return Err(e).context(SweepStorageSnafu {
                    account: morsel.account.clone(),
                    space_id: morsel.space_id.clone(),
                })
            }
        };
        if page.is_empty() {
            break;
        }
        for id in &page {
            membership.insert(id).context(MembershipSnafu)?;
        }
        source_ids += page.len();
        marker = page.last().cloned();
    }

    // phase 2: destination scan against the set
    let mut candidates: Vec<ContentId> = Vec::new();
    let mut stray = 0usize;
    let mut marker: Option<ContentId> = None;
    loop {
        let page = match fetch_chunk(
            dst,
            &morsel.space_id,
            marker.as_ref(),
            LISTING_PAGE_SIZE,
            backoff_config,
        )
        .await
        {
            Ok(page) => page,
            // the destination space vanished mid-sweep; nothing left to do
            Err(e) if e.is_not_found() => break,
            Err(e) => {
                return Err(e).context(SweepStorageSnafu {
                    account: morsel.account.clone(),
                    space_id: morsel.space_id.clone(),
                })
            }
        };
        if page.is_empty() {
            break;
        }
        marker = page.last().cloned();
        for id in page {
            if !membership.contains(&id).context(MembershipSnafu)? {
                candidates.push(id);
                stray += 1;
                if candidates.len() >= SWEEP_FLUSH_SIZE {
                    flush_candidates(morsel, &mut candidates, sink).await?;
                }
            }
        }
    }
    flush_candidates(morsel, &mut candidates, sink).await?;
    membership.clear();

    debug!(morsel=%morsel, source_ids, stray, "deletion sweep complete");
    Ok(())
}

async fn flush_candidates(
    morsel: &Morsel,
    candidates: &mut Vec<ContentId>,
    sink: &mut TaskSink<'_>,
) -> Result<(), Error> {
    for id in candidates.drain(..) {
        sink.push(Task::duplicate(
            morsel.account.clone(),
            morsel.space_id.clone(),
            Some(id),
            &morsel.store_policy,
        ))
        .await?;
    }
    sink.flush().await
}
