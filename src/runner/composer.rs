use super::context::Environment;
use super::events::{EventEmitter, RunEvent};
use super::executor::StepExecutor;
use super::state::{RunStatus, RunTotals, StepResult, StepStatus};
use crate::error::FlowError;
use crate::parser::types::{FlowConfig, TestStep};
use crate::parser::yaml::load_flow;
use crate::provider::{normalize, FileProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives every step result, including synthetic flow markers, in
/// execution order.
pub type StepSink<'a> = dyn FnMut(StepResult) + Send + 'a;

/// Recursive descent over a flow's step lists. Nested flow references are
/// resolved through the file provider relative to the referencing file;
/// a failed or missing nested flow counts as one failure and the parent
/// continues with its remaining steps.
pub struct FlowComposer {
    provider: Arc<dyn FileProvider>,
    executor: StepExecutor,
    emitter: Arc<EventEmitter>,
    /// Cosmetic pacing between steps; skipped while cancelled
    step_delay_ms: u64,
    /// Files currently on the recursion path, for the cycle guard
    visited: Vec<PathBuf>,
}

impl FlowComposer {
    pub fn new(
        provider: Arc<dyn FileProvider>,
        emitter: Arc<EventEmitter>,
        step_delay_ms: u64,
    ) -> Self {
        Self {
            provider,
            executor: StepExecutor::new(),
            emitter,
            step_delay_ms,
            visited: Vec::new(),
        }
    }

    /// Run one parsed file's sections against a shared environment.
    /// `beforeTest`, `steps` and `afterTest` share one contiguous index
    /// space; `file_path` marks the file identity on every result.
    pub async fn run_file(
        &mut self,
        source: &str,
        file_path: &Path,
        base: &FlowConfig,
        env: &mut Environment,
        cancel: &CancellationToken,
        on_step: &mut StepSink<'_>,
    ) -> Result<RunTotals, FlowError> {
        let flow = load_flow(source)?;
        let config = base.merged_with(flow.config.as_ref());
        let file_id = file_path.to_string_lossy().to_string();
        let base_dir = file_path.parent().unwrap_or(Path::new(".")).to_path_buf();

        self.visited.push(normalize(file_path));
        let mut index = 0usize;
        let mut totals = RunTotals::default();

        if flow.is_pure_delegation() {
            let wrapper = TestStep {
                flow: flow.flow.clone(),
                ..Default::default()
            };
            let sub = self
                .run_section(
                    std::slice::from_ref(&wrapper),
                    &mut index,
                    env,
                    &config,
                    0,
                    &base_dir,
                    &file_id,
                    cancel,
                    on_step,
                )
                .await;
            totals.absorb(sub);
        } else {
            for section in [&flow.before_test, &flow.steps, &flow.after_test] {
                let sub = self
                    .run_section(
                        section, &mut index, env, &config, 0, &base_dir, &file_id, cancel, on_step,
                    )
                    .await;
                totals.absorb(sub);
            }
        }

        self.visited.pop();
        Ok(totals)
    }

    /// Process one step list in order, sharing the caller's index counter
    #[allow(clippy::too_many_arguments)]
    async fn run_section(
        &mut self,
        steps: &[TestStep],
        index: &mut usize,
        env: &mut Environment,
        config: &FlowConfig,
        depth: usize,
        base_dir: &Path,
        file_id: &str,
        cancel: &CancellationToken,
        on_step: &mut StepSink<'_>,
    ) -> RunTotals {
        let mut totals = RunTotals::default();

        for step in steps {
            let local_index = *index;
            *index += 1;

            // Once cancelled, stop issuing steps; unstarted steps are
            // reported cancelled, in-flight work has already settled.
            if cancel.is_cancelled() {
                let mut result =
                    StepResult::new(&step.display_name(), depth, file_id, local_index);
                result.cancel();
                on_step(result);
                continue;
            }

            if let Some(ref flow_ref) = step.flow {
                let sub = self
                    .run_flow_ref(
                        flow_ref,
                        local_index,
                        env,
                        config,
                        depth,
                        base_dir,
                        file_id,
                        cancel,
                        on_step,
                    )
                    .await;
                totals.absorb(sub);
                continue;
            }

            self.emitter.emit(RunEvent::CommandStarted {
                depth,
                index: local_index,
                command: step.display_name(),
            });

            let result = self
                .executor
                .execute(step, env, config, depth, file_id, local_index, cancel)
                .await;

            match result.status {
                StepStatus::Passed => {
                    totals.passed += 1;
                    self.emitter.emit(RunEvent::CommandPassed {
                        index: local_index,
                        duration_ms: result.duration_ms.unwrap_or(0),
                    });
                }
                StepStatus::Failed => {
                    totals.failed += 1;
                    self.emitter.emit(RunEvent::CommandFailed {
                        index: local_index,
                        error: result.error.clone().unwrap_or_default(),
                        duration_ms: result.duration_ms.unwrap_or(0),
                    });
                }
                _ => {}
            }
            on_step(result);

            if self.step_delay_ms > 0 && !cancel.is_cancelled() {
                tokio::time::sleep(std::time::Duration::from_millis(self.step_delay_ms)).await;
            }
        }

        totals
    }

    /// Resolve and run one flow-reference step at `depth + 1`
    #[allow(clippy::too_many_arguments)]
    async fn run_flow_ref(
        &mut self,
        flow_ref: &str,
        local_index: usize,
        env: &mut Environment,
        config: &FlowConfig,
        depth: usize,
        base_dir: &Path,
        file_id: &str,
        cancel: &CancellationToken,
        on_step: &mut StepSink<'_>,
    ) -> RunTotals {
        let mut totals = RunTotals::default();

        // Group boundary marker for observers
        on_step(StepResult::flow_marker(
            format!("Flow: {} (Start)", flow_ref),
            depth,
            file_id,
            local_index,
        ));

        let path = normalize(&base_dir.join(flow_ref));

        if self.visited.contains(&path) {
            let error = FlowError::CyclicFlowReference(flow_ref.to_string()).to_string();
            self.emitter.emit(RunEvent::Log {
                depth,
                message: error.clone(),
            });
            on_step(StepResult::flow_error(
                format!("Flow: {} (Error)", flow_ref),
                error,
                depth,
                file_id,
                local_index,
            ));
            totals.failed += 1;
            return totals;
        }

        let source = match self.provider.read_file(&path) {
            Ok(s) => s,
            Err(_) => {
                let error = FlowError::FlowNotFound(flow_ref.to_string()).to_string();
                on_step(StepResult::flow_error(
                    format!("Flow: {} (Error)", flow_ref),
                    error,
                    depth,
                    file_id,
                    local_index,
                ));
                totals.failed += 1;
                return totals;
            }
        };

        let child = match load_flow(&source) {
            Ok(f) => f,
            Err(e) => {
                on_step(StepResult::flow_error(
                    format!("Flow: {} (Error)", flow_ref),
                    e.to_string(),
                    depth,
                    file_id,
                    local_index,
                ));
                totals.failed += 1;
                return totals;
            }
        };

        let merged = config.merged_with(child.config.as_ref());
        let child_id = path.to_string_lossy().to_string();
        let child_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let child_name = if child.name.is_empty() {
            flow_ref.to_string()
        } else {
            child.name.clone()
        };

        self.emitter.emit(RunEvent::FlowStarted {
            depth: depth + 1,
            flow_path: child_id.clone(),
            flow_name: child_name,
        });
        self.visited.push(path);

        let mut child_index = 0usize;
        let mut child_totals = RunTotals::default();

        if child.is_pure_delegation() {
            // A file that only points elsewhere: wrap the reference as a
            // single synthetic step and recurse one more level
            let wrapper = TestStep {
                flow: child.flow.clone(),
                ..Default::default()
            };
            let sub = Box::pin(self.run_section(
                std::slice::from_ref(&wrapper),
                &mut child_index,
                env,
                &merged,
                depth + 1,
                &child_dir,
                &child_id,
                cancel,
                on_step,
            ))
            .await;
            child_totals.absorb(sub);
        } else {
            for section in [&child.before_test, &child.steps, &child.after_test] {
                let sub = Box::pin(self.run_section(
                    section,
                    &mut child_index,
                    env,
                    &merged,
                    depth + 1,
                    &child_dir,
                    &child_id,
                    cancel,
                    on_step,
                ))
                .await;
                child_totals.absorb(sub);
            }
        }

        self.visited.pop();

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if child_totals.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
        self.emitter.emit(RunEvent::FlowFinished {
            depth: depth + 1,
            status,
        });

        totals.absorb(child_totals);
        totals
    }
}
