use crate::manifest::{head_key, manifest_key, to_json_bytes, Head, Manifest};
use crate::placement::PlacementMap;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use veclite_core::{CancelFlag, Result, VecliteError};
use veclite_store::segment::decode_segment;

/// One planned segment relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub segment: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Re-decode each copied frame at the destination before committing.
    pub verify: bool,
    /// Delete the source copy after the new manifest is committed.
    pub cleanup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub epoch: u64,
    pub moved: usize,
    pub skipped: usize,
}

/// Computes the moves that bring `manifest` onto `new_map` by re-running
/// placement for every segment.
pub fn plan_rebalance(manifest: &Manifest, new_map: &PlacementMap) -> Vec<Move> {
    manifest
        .segments
        .iter()
        .filter_map(|entry| {
            let to = new_map.primary(&entry.name)?;
            if to == entry.target_key {
                None
            } else {
                Some(Move {
                    segment: entry.name.clone(),
                    from: entry.target_key.clone(),
                    to: to.to_string(),
                })
            }
        })
        .collect()
}

impl Session {
    /// Applies a rebalance plan: copy each moved segment, commit an
    /// updated manifest under CAS, then optionally delete source copies.
    ///
    /// Idempotent: re-running after a partial failure skips copies that
    /// already landed and completes the rest.
    pub async fn apply_rebalance(
        &self,
        new_map: &PlacementMap,
        moves: &[Move],
        opts: ApplyOptions,
        cancel: Option<&CancelFlag>,
    ) -> Result<RebalanceReport> {
        let lock_name = format!("{}.rebalance", self.options().name);
        let acquired = self
            .lock_provider()
            .acquire(&lock_name, self.options().lock_ttl_ms, self.holder_id())
            .await?;
        let result = self.apply_rebalance_locked(new_map, moves, opts, cancel).await;
        let _ = self
            .lock_provider()
            .release(&lock_name, acquired.epoch, self.holder_id())
            .await;
        result
    }

    async fn apply_rebalance_locked(
        &self,
        new_map: &PlacementMap,
        moves: &[Move],
        opts: ApplyOptions,
        cancel: Option<&CancelFlag>,
    ) -> Result<RebalanceReport> {
        let name = self.options().name.clone();
        let head = self.read_head_pub().await?.ok_or_else(|| {
            VecliteError::NotFound(format!("{name}: nothing committed to rebalance"))
        })?;
        let old_epoch = head.epoch;
        let mut manifest = head.manifest;

        let mut moved = 0usize;
        let mut skipped = 0usize;
        for mv in moves {
            if let Some(flag) = cancel {
                if flag.is_cancelled() {
                    return Err(VecliteError::Cancelled);
                }
            }
            let dest = self.stores().data_for(&mv.to)?;
            // Replay safety: a copy that already landed is not repeated.
            if dest.read(&mv.segment).await.is_ok() {
                debug!(segment = %mv.segment, to = %mv.to, "copy already present");
                skipped += 1;
            } else {
                let frame = match self.stores().data_for(&mv.from) {
                    Ok(src) => src.read(&mv.segment).await?,
                    Err(_) => {
                        return Err(VecliteError::NotFound(format!(
                            "source target {} for {}",
                            mv.from, mv.segment
                        )))
                    }
                };
                if opts.verify {
                    decode_segment(&frame)?;
                }
                dest.atomic_write(&mv.segment, frame).await?;
                moved += 1;
            }
            if let Some(entry) = manifest.segments.iter_mut().find(|e| e.name == mv.segment) {
                entry.target_key.clone_from(&mv.to);
            } else {
                warn!(segment = %mv.segment, "move references an unknown segment");
            }
        }

        manifest.epoch = old_epoch + 1;
        manifest.commit_ts = self.clock_now();
        manifest.placement = new_map.clone();

        self.stores()
            .index
            .atomic_write(&manifest_key(&name), to_json_bytes(&manifest)?)
            .await?;

        // CAS HEAD exactly like the save path.
        let current = self.read_head_pub().await?;
        let current_epoch = current.map_or(0, |h| h.epoch);
        if current_epoch != old_epoch {
            return Err(VecliteError::ConflictEpoch {
                expected: old_epoch,
                found: current_epoch,
            });
        }
        let head = Head {
            epoch: manifest.epoch,
            commit_ts: manifest.commit_ts,
            manifest: manifest.clone(),
        };
        self.stores()
            .index
            .atomic_write(&head_key(&name), to_json_bytes(&head)?)
            .await?;
        self.set_last_epoch(manifest.epoch);

        if opts.cleanup {
            for mv in moves {
                if mv.from == mv.to {
                    continue;
                }
                if let Ok(src) = self.stores().data_for(&mv.from) {
                    let _ = src.del(&mv.segment).await;
                }
            }
        }

        info!(
            collection = %name,
            epoch = manifest.epoch,
            moved,
            skipped,
            "rebalance committed"
        );
        Ok(RebalanceReport {
            epoch: manifest.epoch,
            moved,
            skipped,
        })
    }
}
