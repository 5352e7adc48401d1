// SPDX-License-Identifier: Apache-2.0

//! Registry garbage collector.
//!
//! Periodically removes Closed entries whose TTL deadline has passed. Each
//! removal runs under the entry's slot lock, so it serializes with any reopen
//! the controller attempts for the same key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::metrics::Counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::BoxError;
use crate::receivers::file::error::Result;
use crate::receivers::file::persistence::RegistryStore;
use crate::receivers::get_meter;

pub struct GarbageCollector {
    store: Arc<RegistryStore>,
    entries_removed: Counter<u64>,
}

impl GarbageCollector {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        let entries_removed = get_meter()
            .u64_counter("filestream_registry_entries_removed")
            .with_description("Number of expired registry entries removed by the garbage collector.")
            .with_unit("entries")
            .build();

        Self {
            store,
            entries_removed,
        }
    }

    /// Remove every Closed entry whose deadline is at or before `now`.
    /// Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;

        for key in self.store.keys()? {
            let outcome = self.store.with_entry(&key, |entry| match entry.state() {
                Some(state) if state.is_expired(now) => {
                    // Validates Closed → Removed before anything is written
                    state.remove()?;
                    entry.remove().map(|seq| seq.is_some())
                }
                _ => Ok(false),
            });

            match outcome {
                Ok(true) => {
                    debug!(key = %key, "Removed expired registry entry");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    // Left in place, retried on the next sweep
                    error!(key = %key, "Failed to remove registry entry: {}", e);
                }
            }
        }

        if removed > 0 {
            info!("{} entries removed", removed);
            self.entries_removed.add(removed as u64, &[]);
        }
        Ok(removed)
    }

    /// Sweep every `cleanup_interval` until cancelled. Sweeps run on the
    /// blocking pool since every removal is an fsynced append.
    pub async fn run(
        self,
        cleanup_interval: Duration,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        info!(
            cleanup_interval = %humantime::format_duration(cleanup_interval),
            "Registry garbage collector started"
        );

        let gc = Arc::new(self);
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let gc = gc.clone();
                    match tokio::task::spawn_blocking(move || gc.sweep(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Registry sweep failed: {}", e),
                        Err(e) => return Err(format!("registry sweep task failed: {}", e).into()),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Garbage collector cancelled");
                    break;
                }
            }
        }

        info!("Registry garbage collector stopped");
        Ok(())
    }
}
