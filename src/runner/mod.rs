pub mod composer;
pub mod context;
pub mod events;
pub mod executor;
pub mod reconcile;
pub mod state;

use crate::error::FlowError;
use crate::parser::types::FlowConfig;
use crate::provider::{EventBridge, FileProvider, RunRequest};
use composer::FlowComposer;
use context::Environment;
use events::{EventEmitter, RunEvent};
use reconcile::ProgressReconciler;
use state::{StepResult, TestResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller-side run settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Default request timeout when the flow config sets none
    pub timeout_ms: u64,
    /// Cosmetic pacing between steps
    pub step_delay_ms: u64,
    /// Variables seeded into the run environment
    pub variables: HashMap<String, String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_ms: executor::DEFAULT_TIMEOUT_MS,
            step_delay_ms: 0,
            variables: HashMap::new(),
        }
    }
}

/// Run one flow document. `on_update` receives the partial result after
/// every completed step for live display, `on_step_complete` each settled
/// step; the returned record is final.
#[allow(clippy::too_many_arguments)]
pub async fn run_flow(
    source: &str,
    file_id: &str,
    file_name: &str,
    provider: Arc<dyn FileProvider>,
    emitter: Arc<EventEmitter>,
    options: &RunOptions,
    mut on_update: impl FnMut(&TestResult) + Send,
    mut on_step_complete: impl FnMut(&StepResult) + Send,
    cancel: &CancellationToken,
) -> Result<TestResult, FlowError> {
    let mut result = TestResult::new(file_id, file_name);
    let mut env = Environment::from_strings(options.variables.clone());
    let base = FlowConfig {
        timeout: Some(options.timeout_ms),
        ..Default::default()
    };

    emitter.emit(RunEvent::FlowStarted {
        depth: 0,
        flow_path: file_id.to_string(),
        flow_name: file_name.to_string(),
    });

    let mut composer = FlowComposer::new(provider, Arc::clone(&emitter), options.step_delay_ms);
    let run_outcome = {
        let mut sink = |step: StepResult| {
            on_step_complete(&step);
            result.record_step(step);
            on_update(&result);
        };
        composer
            .run_file(
                source,
                Path::new(file_id),
                &base,
                &mut env,
                cancel,
                &mut sink,
            )
            .await
    };

    run_outcome?;
    result.finalize(cancel.is_cancelled());
    emitter.emit(RunEvent::FlowFinished {
        depth: 0,
        status: result.status,
    });
    Ok(result)
}

/// Run every flow file under `dir`, strictly sequentially, tagging each
/// file's result with one shared batch id. Files in `subflows/` helper
/// directories are skipped; they only run when referenced.
pub async fn run_folder(
    dir: &Path,
    provider: Arc<dyn FileProvider>,
    emitter: Arc<EventEmitter>,
    options: &RunOptions,
    mut on_update: impl FnMut(&TestResult) + Send,
    cancel: &CancellationToken,
) -> Result<Vec<TestResult>, FlowError> {
    let batch_id = Uuid::new_v4().to_string();
    let folder_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.to_string_lossy().to_string());

    let mut files: Vec<PathBuf> = provider
        .list_files(dir)
        .map_err(|e| FlowError::Load(e.to_string()))?
        .into_iter()
        .filter(|p| {
            let is_yaml = p
                .extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml");
            let path_str = p.to_string_lossy();
            let in_subflows =
                path_str.contains("/subflows/") || path_str.contains("\\subflows\\");
            is_yaml && !in_subflows
        })
        .collect();
    files.sort();

    let mut results = Vec::new();
    for file in files {
        if cancel.is_cancelled() {
            break;
        }
        let file_id = file.to_string_lossy().to_string();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_id.clone());

        let mut result = match provider.read_file(&file) {
            Ok(source) => {
                match run_flow(
                    &source,
                    &file_id,
                    &file_name,
                    Arc::clone(&provider),
                    Arc::clone(&emitter),
                    options,
                    &mut on_update,
                    |_| {},
                    cancel,
                )
                .await
                {
                    Ok(result) => result,
                    Err(e) => failed_result(&file_id, &file_name, e),
                }
            }
            Err(e) => failed_result(&file_id, &file_name, FlowError::Load(e.to_string())),
        };

        result.batch_id = Some(batch_id.clone());
        result.folder_name = Some(folder_name.clone());
        results.push(result);
    }

    Ok(results)
}

/// A file that could not even start: one synthetic failed step
fn failed_result(file_id: &str, file_name: &str, error: FlowError) -> TestResult {
    let mut result = TestResult::new(file_id, file_name);
    result.record_step(StepResult::flow_error(
        file_name.to_string(),
        error.to_string(),
        0,
        file_id,
        0,
    ));
    result.finalize(false);
    result
}

/// Delegate execution to an external backend and assemble the same result
/// shape from its event stream. The reconciler is the primary consumer
/// here; this loop only folds command events into step results.
pub async fn run_delegated(
    bridge: &dyn EventBridge,
    request: RunRequest,
    reconciler: &mut ProgressReconciler,
    cancel: &CancellationToken,
) -> Result<TestResult, FlowError> {
    let mut rx = bridge.subscribe();
    bridge
        .invoke(request.clone())
        .await
        .map_err(|e| FlowError::Network(e.to_string()))?;

    let mut result = TestResult::new(&request.file_id, &request.file_name);
    let mut open: HashMap<(String, usize), StepResult> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        };

        reconciler.handle(&event);

        match &event {
            RunEvent::CommandStarted {
                depth,
                index,
                command,
            } => {
                let file = reconciler.current_path().to_string();
                let mut step = StepResult::new(command, *depth, &file, *index);
                step.start();
                open.insert((file, *index), step);
            }
            RunEvent::CommandPassed { index, duration_ms } => {
                let file = reconciler.current_path().to_string();
                if let Some(mut step) = open.remove(&(file, *index)) {
                    step.pass();
                    step.duration_ms = Some(*duration_ms);
                    result.record_step(step);
                }
            }
            RunEvent::CommandFailed {
                index,
                error,
                duration_ms,
            } => {
                let file = reconciler.current_path().to_string();
                if let Some(mut step) = open.remove(&(file, *index)) {
                    step.fail(error.clone());
                    step.duration_ms = Some(*duration_ms);
                    result.record_step(step);
                }
            }
            RunEvent::Log { message, .. } => {
                let file = reconciler.current_path().to_string();
                if let Some(step) = reconciler
                    .state_of(&file)
                    .and_then(|s| s.executing_step_index)
                    .and_then(|i| open.get_mut(&(file, i)))
                {
                    step.logs.push(message.clone());
                }
            }
            RunEvent::FlowFinished { depth, .. } if *depth == 0 => break,
            _ => {}
        }
    }

    result.finalize(cancel.is_cancelled());
    Ok(result)
}
