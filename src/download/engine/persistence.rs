use std::sync::Arc;

use tracing::{debug, warn};

use super::task::{TaskShared, lock};
use crate::download::block::DownloadBlock;
use crate::download::resume::{BlockPositions, ResumeRecord, ResumeStore};

/// Writes the current block positions to the sidecar, if this download keeps one.
///
/// Failures are logged, never escalated: losing the sidecar only costs
/// re-downloaded bytes. Nothing is written once finalization has begun.
pub(super) fn persist_resume_record(shared: &TaskShared) -> bool {
    let (path, file_size) = {
        let task = lock(&shared.task);
        if task.api_like {
            return false;
        }
        let Some(path) = task.path.clone() else {
            return false;
        };
        (path, task.file_size)
    };

    let positions: Vec<BlockPositions> = lock(&shared.blocks)
        .iter()
        .map(|block| BlockPositions {
            start: block.start(),
            current: block.current(),
            end: block.end(),
        })
        .collect();
    if positions.is_empty() {
        return false;
    }

    let record = ResumeRecord::new(shared.request.url.clone(), file_size, positions);
    let _guard = lock(&shared.persist_lock);
    // checked under the persist lock so a save cannot land after the final discard
    if lock(&shared.control).finalizing {
        debug!("download is finalizing, resume record not saved");
        return false;
    }
    match ResumeStore::for_target(&path).save(&record) {
        Ok(()) => true,
        Err(error) => {
            warn!(%error, "failed to save resume record");
            false
        }
    }
}

/// Removes the sidecar after a successful download.
pub(super) fn discard_resume_record(shared: &TaskShared) {
    let Some(path) = lock(&shared.task).path.clone() else {
        return;
    };
    let store = ResumeStore::for_target(&path);
    let _guard = lock(&shared.persist_lock);
    if let Err(error) = store.delete() {
        warn!(%error, "failed to remove resume record");
    } else {
        debug!(path = %store.path().display(), "resume record removed");
    }
}

/// Blocks rebuilt from a sidecar, ordered by start offset.
pub(super) fn restore_blocks(record: &ResumeRecord) -> Vec<Arc<DownloadBlock>> {
    let mut positions = record.blocks.clone();
    positions.sort_by_key(|p| p.start);
    positions
        .into_iter()
        .map(|p| Arc::new(DownloadBlock::restored(p.start, p.current, p.end)))
        .collect()
}
