// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BoxError;
use crate::bounded_channel::bounded;
use crate::init::config::AgentConfig;
use crate::init::wait;
use crate::receivers::file::config::FILESTREAM_INPUT_TYPE;
use crate::receivers::file::controller::{ReaderController, close_entries};
use crate::receivers::file::gc::GarbageCollector;
use crate::receivers::file::input::GlobFileFinder;
use crate::receivers::file::persistence::{RegistryKey, RegistryStore};
use crate::receivers::file::scanner::Scanner;
use crate::receivers::file::sink::{DiscardSink, LineSink};
use crate::receivers::file::validate::{ResolvedInput, validate};

const INPUTS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const GC_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Agent {
    config: AgentConfig,
    event_queue_size: usize,
    sink: Arc<dyn LineSink>,
}

impl Agent {
    pub fn new(config: AgentConfig, event_queue_size: usize) -> Self {
        Self {
            config,
            event_queue_size,
            sink: Arc::new(DiscardSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the inputs, then run every input and the registry garbage
    /// collector until cancelled or a task fails. Nothing is scanned when
    /// validation fails.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let inputs = validate(&self.config.inputs)?;
        self.config
            .registry
            .validate()
            .map_err(|e| format!("invalid registry configuration: {}", e))?;

        info!(
            inputs = inputs.len(),
            registry_path = %self.config.registry.path.display(),
            "Starting filestream agent."
        );

        let store = {
            let registry = self.config.registry.clone();
            tokio::task::spawn_blocking(move || RegistryStore::open(&registry)).await??
        };
        let store = Arc::new(store);

        close_unconfigured(&store, &inputs)?;

        let mut inputs_task_set: JoinSet<Result<(), BoxError>> = JoinSet::new();
        let mut gc_task_set: JoinSet<Result<(), BoxError>> = JoinSet::new();

        let inputs_cancel = CancellationToken::new();
        let gc_cancel = CancellationToken::new();

        for input in inputs {
            self.start_input(input, &store, &mut inputs_task_set, &inputs_cancel)?;
        }

        {
            let gc = GarbageCollector::new(store.clone());
            let cleanup_interval = self.config.registry.cleanup_interval;
            let gc_cancel = gc_cancel.clone();
            gc_task_set.spawn(async move { gc.run(cleanup_interval, gc_cancel).await });
        }

        let has_inputs = !inputs_task_set.is_empty();
        if !has_inputs {
            warn!("No enabled inputs, only the registry garbage collector will run.");
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut inputs_task_set), if has_inputs => {
                match e {
                    Ok(()) => info!("Unexpected early exit of input."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut gc_task_set) => {
                match e {
                    Ok(()) => info!("Unexpected early exit of registry garbage collector."),
                    Err(e) => result = Err(e),
                }
            },
        }

        // Inputs stop first so their final transitions land before the last
        // checkpoint.
        inputs_cancel.cancel();
        if let Err(e) =
            wait::wait_for_tasks_with_timeout(&mut inputs_task_set, INPUTS_SHUTDOWN_TIMEOUT).await
        {
            error!(error = e, "Inputs did not stop cleanly.");
        }

        gc_cancel.cancel();
        if let Err(e) =
            wait::wait_for_tasks_with_timeout(&mut gc_task_set, GC_SHUTDOWN_TIMEOUT).await
        {
            error!(error = e, "Registry garbage collector did not stop cleanly.");
        }

        let close_result = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.close()).await?
        };
        if let Err(e) = close_result {
            error!("Failed to write final registry checkpoint: {}", e);
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        info!("Filestream agent stopped.");
        result
    }

    fn start_input(
        &self,
        input: ResolvedInput,
        store: &Arc<RegistryStore>,
        task_set: &mut JoinSet<Result<(), BoxError>>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let ResolvedInput { id, definition } = input;

        let finder = GlobFileFinder::new(
            definition.paths.clone(),
            definition.prospector.scanner.exclude_files.clone(),
        )?;
        let check_interval = definition.check_interval();
        let scanner = Scanner::new(id.clone(), Box::new(finder));
        let controller =
            ReaderController::new(id.clone(), definition, store.clone(), self.sink.clone());

        let (events_tx, events_rx) = bounded(self.event_queue_size);

        info!(input_id = %id, "Input '{}' starting", FILESTREAM_INPUT_TYPE);

        {
            let cancel = cancel.clone();
            task_set.spawn(run_blocking("scanner", move || {
                scanner.run(events_tx, check_interval, cancel)
            }));
        }
        {
            let cancel = cancel.clone();
            task_set.spawn(run_blocking("controller", move || {
                controller.run(events_rx, cancel)
            }));
        }

        Ok(())
    }
}

async fn run_blocking<F>(name: &'static str, f: F) -> Result<(), BoxError>
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) => Err(format!("{} task failed: {}", name, e).into()),
    }
}

/// Close the open entries of inputs that are no longer configured, so every
/// entry in the registry eventually expires.
fn close_unconfigured(store: &RegistryStore, inputs: &[ResolvedInput]) -> Result<(), BoxError> {
    let configured: HashSet<&str> = inputs.iter().map(|i| i.id.as_str()).collect();
    let orphaned: Vec<RegistryKey> = store
        .keys()?
        .into_iter()
        .filter(|key| !configured.contains(key.input_id.as_str()))
        .collect();

    if orphaned.is_empty() {
        return Ok(());
    }

    let (closed, failed) = close_entries(store, &orphaned, None, Utc::now());
    if closed > 0 {
        info!(
            "Closed {} registry entries of inputs that are no longer configured",
            closed
        );
    }
    if !failed.is_empty() {
        warn!(
            failed = failed.len(),
            "Some registry entries of unconfigured inputs could not be closed"
        );
    }
    Ok(())
}
