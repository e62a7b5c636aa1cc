//! Triplet dispatch queue.
//!
//! Holds the FIFO of triplets scanned from the work directory and remembers
//! the last one handed to the session so the device's verdict can archive
//! it. `reload` rebuilds the queue from scratch, which is what lets a
//! partial tail triplet complete on a later cycle.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Result;
use crate::grouping::{Grouping, Triplet};
use crate::ingress;
use crate::mapping::{Mapper, Payload};

/// FIFO of pending triplets plus the archive-on-result bookkeeping.
pub struct Dispatcher {
    work_dir: PathBuf,
    done_dir: PathBuf,
    error_dir: PathBuf,
    grouping: Grouping,
    mapper: Mapper,
    queue: VecDeque<Triplet>,
    pending: Option<Triplet>,
}

impl Dispatcher {
    /// Build from the loaded configuration and run the initial scan.
    pub fn new(cfg: &Config, grouping: Grouping, mapper: Mapper) -> Result<Dispatcher> {
        let mut dispatcher = Dispatcher {
            work_dir: cfg.grouping.work_dir.clone(),
            done_dir: cfg.grouping.done_dir.clone(),
            error_dir: cfg.grouping.error_dir.clone(),
            grouping,
            mapper,
            queue: VecDeque::new(),
            pending: None,
        };
        dispatcher.reload()?;
        Ok(dispatcher)
    }

    /// Rebuild the queue from the current work directory contents.
    pub fn reload(&mut self) -> Result<()> {
        self.queue = self.grouping.scan(&self.work_dir)?.into();
        Ok(())
    }

    /// Pop the next triplet and compose its payload.
    ///
    /// The popped triplet becomes "pending" until a device verdict archives
    /// it. An empty queue yields the empty payload; composition failures are
    /// logged and also yield the empty payload so the protocol cadence is
    /// never disturbed.
    pub fn request_next_payload(&mut self) -> Payload {
        let Some(triplet) = self.queue.pop_front() else {
            debug!("request with empty queue");
            return Payload::empty();
        };
        let payload = match self.mapper.compose_payload(&triplet) {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %triplet.key, "compose failed: {e}");
                Payload::empty()
            }
        };
        self.pending = Some(triplet);
        payload
    }

    /// Archive the pending triplet to done (success) or error (failure).
    ///
    /// Only present colors are archived; individual move failures are
    /// logged and never interrupt the remaining files.
    pub fn archive_pending(&mut self, success: bool) {
        let Some(triplet) = self.pending.take() else {
            debug!("archive_pending: nothing to archive");
            return;
        };
        let dst = if success {
            &self.done_dir
        } else {
            &self.error_dir
        };
        for (color, pair) in &triplet.files {
            for path in [&pair.txt, &pair.img] {
                match ingress::atomic_move_to_dir(path, dst) {
                    Ok(_) => {}
                    Err(e) => error!(
                        color = ?color,
                        "archive failed for {}: {e}",
                        path.display()
                    ),
                }
            }
            info!(key = %triplet.key, color = ?color, dst = %dst.display(), "archived");
        }
    }

    /// Number of queued triplets (excluding the pending one).
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a dispatched triplet is awaiting its verdict.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
