use super::events::RunEvent;
use super::state::{RunStatus, StepStatus};
use crate::parser::line_map::map_step_lines;
use crate::provider::{normalize, FileProvider};
use log::warn;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Executing line value while the source has not been line-mapped yet
pub const LINE_UNRESOLVED: i64 = -1;

/// Live execution view of one open file. Created when the file's execution
/// begins, cleared when a new run starts, never persisted. Observers read
/// snapshots concurrently; every mutation replaces the whole record.
#[derive(Debug, Clone, Default)]
pub struct FileExecutionState {
    /// Flattened step index -> 1-based source line
    pub step_lines: HashMap<usize, usize>,
    pub step_statuses: HashMap<usize, StepStatus>,
    pub step_errors: HashMap<usize, String>,
    pub step_logs: HashMap<usize, Vec<String>>,
    pub executing_step_index: Option<usize>,
    pub executing_line: i64,
    line_map_ready: bool,
}

impl FileExecutionState {
    fn new() -> Self {
        Self {
            executing_line: LINE_UNRESOLVED,
            ..Default::default()
        }
    }

    /// Whether the source has been line-mapped yet
    pub fn has_line_map(&self) -> bool {
        self.line_map_ready
    }
}

/// Map shared with observers; values are replaced atomically, never
/// mutated in place
pub type SharedFileStates = Arc<RwLock<HashMap<String, FileExecutionState>>>;

/// One nested-flow boundary on the reconciliation stack. The stack depth
/// always equals the nesting depth reported by the event stream; popping
/// restores the parent's index origin so indices reported after the nested
/// flow resumes continue unambiguously.
#[derive(Debug, Clone)]
struct FlowFrame {
    /// Path that was current before this flow started
    path: String,
    /// Parent index origin before the nested flow began
    offset_before: usize,
    /// The parent step that triggered this flow, resolved on FlowFinished
    parent_step: Option<usize>,
}

/// Consumes the ordered event stream of a run and maintains, per file
/// identity, a `FileExecutionState` a live viewer can read at any time.
pub struct ProgressReconciler {
    provider: Arc<dyn FileProvider>,
    /// Known file identities, normalized
    file_tree: Vec<String>,
    root_path: String,
    current_path: String,
    /// Step-index origin currently in effect for the current file
    global_offset: usize,
    /// Total commands seen this run, for diagnostics
    steps_emitted: usize,
    flow_stack: Vec<FlowFrame>,
    states: SharedFileStates,
    /// Most recently started step, the fallback target for logs
    last_started: Option<(String, usize)>,
}

impl ProgressReconciler {
    pub fn new(root_path: &str, file_tree: Vec<String>, provider: Arc<dyn FileProvider>) -> Self {
        let root = normalize_str(root_path);
        Self {
            provider,
            file_tree: file_tree.iter().map(|p| normalize_str(p)).collect(),
            current_path: root.clone(),
            root_path: root,
            global_offset: 0,
            steps_emitted: 0,
            flow_stack: Vec::new(),
            states: Arc::new(RwLock::new(HashMap::new())),
            last_started: None,
        }
    }

    /// Handle for concurrent observers (editor gutter, log view, report)
    pub fn states(&self) -> SharedFileStates {
        Arc::clone(&self.states)
    }

    /// Snapshot of one file's state, resolved like an event path
    pub fn state_of(&self, path: &str) -> Option<FileExecutionState> {
        let resolved = self.resolve_event_path(path);
        self.states.read().unwrap().get(&resolved).cloned()
    }

    /// Nested-flow frames currently open; equals the event stream's depth
    pub fn stack_depth(&self) -> usize {
        self.flow_stack.len()
    }

    /// File identity the stream is currently executing in
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn steps_emitted(&self) -> usize {
        self.steps_emitted
    }

    /// Apply one event from the stream
    pub fn handle(&mut self, event: &RunEvent) {
        match event {
            RunEvent::FlowStarted {
                depth,
                flow_path,
                flow_name: _,
            } => {
                let resolved = self.resolve_event_path(flow_path);
                if *depth == 0 {
                    self.reset(resolved);
                } else {
                    // The parent step that triggered this flow is exactly
                    // the offset in effect; it resolves on FlowFinished.
                    let parent_path = self.current_path.clone();
                    let flow_step = self.global_offset;
                    self.mark_running(&parent_path, flow_step);
                    self.flow_stack.push(FlowFrame {
                        path: parent_path,
                        offset_before: flow_step,
                        parent_step: Some(flow_step),
                    });
                    self.current_path = resolved.clone();
                    self.global_offset = 0;
                    self.ensure_state(&resolved);
                }
            }

            RunEvent::CommandStarted { index, .. } => {
                self.steps_emitted += 1;
                let path = self.current_path.clone();
                self.mark_running(&path, *index);
                self.global_offset = index + 1;
                self.last_started = Some((path, *index));
            }

            RunEvent::CommandPassed { index, .. } => {
                let path = self.current_path.clone();
                self.settle(&path, *index, StepStatus::Passed, None);
            }

            RunEvent::CommandFailed { index, error, .. } => {
                let path = self.current_path.clone();
                self.settle(&path, *index, StepStatus::Failed, Some(error.clone()));
            }

            RunEvent::FlowFinished { depth, status } => {
                // Resolve the finishing file before restoring path context
                let finishing = self.current_path.clone();
                self.clear_executing(&finishing);

                if *depth == 0 {
                    return;
                }
                let Some(frame) = self.flow_stack.pop() else {
                    warn!("flow finished at depth {} with an empty path stack", depth);
                    return;
                };
                self.current_path = frame.path.clone();
                // One past the flow-reference step, so the parent's next
                // reported index lines up regardless of the child's length
                self.global_offset = frame.offset_before + 1;

                if let Some(step) = frame.parent_step {
                    let step_status = match status {
                        RunStatus::Passed => StepStatus::Passed,
                        RunStatus::Failed => StepStatus::Failed,
                        RunStatus::Cancelled => StepStatus::Cancelled,
                        RunStatus::Running => StepStatus::Running,
                    };
                    let error = match step_status {
                        StepStatus::Failed => Some("nested flow failed".to_string()),
                        _ => None,
                    };
                    self.settle(&frame.path, step, step_status, error);
                }
            }

            RunEvent::Log { message, .. } => {
                let target = {
                    let states = self.states.read().unwrap();
                    states
                        .get(&self.current_path)
                        .and_then(|s| s.executing_step_index)
                        .map(|i| (self.current_path.clone(), i))
                        .or_else(|| self.last_started.clone())
                };
                if let Some((path, index)) = target {
                    self.update(&path, |state| {
                        state.step_logs.entry(index).or_default().push(message.clone());
                    });
                }
            }
        }
    }

    /// Attach freshly known source text for a file, backfilling any
    /// executing line recorded while the mapping was missing
    pub fn attach_source(&mut self, path: &str, source: &str) {
        let resolved = self.resolve_event_path(path);
        let lines = map_step_lines(source);
        self.update(&resolved, |state| {
            state.step_lines = lines.clone();
            state.line_map_ready = true;
            if let Some(index) = state.executing_step_index {
                state.executing_line = state
                    .step_lines
                    .get(&index)
                    .map(|l| *l as i64)
                    .unwrap_or(LINE_UNRESOLVED);
            }
        });
    }

    /// Resolve a reported path to a known file identity.
    ///
    /// The backend may report internal temporary paths, absolute paths, or
    /// paths relative to the originating file. Resolution order: exact tree
    /// match, join against the run root's directory, join against the
    /// current flow's directory, filename-suffix match over the tree, then
    /// the normalized string itself with a warning.
    pub fn resolve_event_path(&self, reported: &str) -> String {
        let norm = normalize_str(reported);
        if self.file_tree.iter().any(|p| *p == norm) {
            return norm;
        }

        for base in [&self.root_path, &self.current_path] {
            if let Some(dir) = Path::new(base).parent() {
                let candidate = normalize_str(&dir.join(&norm).to_string_lossy());
                if self.file_tree.iter().any(|p| *p == candidate) {
                    return candidate;
                }
            }
        }

        if let Some(name) = Path::new(&norm).file_name().and_then(|n| n.to_str()) {
            let suffix = format!("/{}", name);
            if let Some(found) = self
                .file_tree
                .iter()
                .find(|p| p.ends_with(&suffix) || *p == name)
            {
                return found.clone();
            }
        }

        warn!("could not resolve event path '{}', using it verbatim", reported);
        norm
    }

    fn reset(&mut self, root: String) {
        self.states.write().unwrap().clear();
        self.flow_stack.clear();
        self.global_offset = 0;
        self.steps_emitted = 0;
        self.last_started = None;
        self.root_path = root.clone();
        self.current_path = root.clone();
        self.ensure_state(&root);
    }

    /// Create the state record lazily, line-mapping from source if the
    /// provider can produce it
    fn ensure_state(&mut self, path: &str) {
        if self.states.read().unwrap().contains_key(path) {
            return;
        }
        let mut state = FileExecutionState::new();
        if let Ok(source) = self.provider.read_file(Path::new(path)) {
            state.step_lines = map_step_lines(&source);
            state.line_map_ready = true;
        }
        self.states.write().unwrap().insert(path.to_string(), state);
    }

    fn mark_running(&mut self, path: &str, index: usize) {
        self.ensure_state(path);
        self.update(path, |state| {
            state.step_statuses.insert(index, StepStatus::Running);
            state.executing_step_index = Some(index);
            state.executing_line = state
                .step_lines
                .get(&index)
                .map(|l| *l as i64)
                .unwrap_or(LINE_UNRESOLVED);
        });
    }

    fn settle(&mut self, path: &str, index: usize, status: StepStatus, error: Option<String>) {
        self.ensure_state(path);
        self.update(path, |state| {
            state.step_statuses.insert(index, status);
            if let Some(error) = error {
                state.step_errors.insert(index, error);
            }
            if state.executing_step_index == Some(index) {
                state.executing_step_index = None;
                state.executing_line = LINE_UNRESOLVED;
            }
        });
    }

    fn clear_executing(&mut self, path: &str) {
        self.update(path, |state| {
            state.executing_step_index = None;
            state.executing_line = LINE_UNRESOLVED;
        });
    }

    /// Clone-mutate-replace so readers never observe a torn record
    fn update(&self, path: &str, mutate: impl FnOnce(&mut FileExecutionState)) {
        let current = self.states.read().unwrap().get(path).cloned();
        let mut next = current.unwrap_or_else(FileExecutionState::new);
        mutate(&mut next);
        self.states.write().unwrap().insert(path.to_string(), next);
    }
}

fn normalize_str(path: &str) -> String {
    let unified = path.replace('\\', "/");
    normalize(Path::new(&unified)).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryFileProvider;

    const PARENT_SRC: &str = "name: parent\nsteps:\n  - name: S0\n    url: /s0\n  - name: into child\n    flow: child.yaml\n  - name: S2\n    url: /s2\n";
    const CHILD_SRC: &str = "name: child\nsteps:\n  - name: C0\n    url: /c0\n  - name: C1\n    url: /c1\n";

    fn reconciler() -> ProgressReconciler {
        let provider = Arc::new(MemoryFileProvider::new());
        provider.insert("flows/parent.yaml", PARENT_SRC);
        provider.insert("flows/child.yaml", CHILD_SRC);
        ProgressReconciler::new(
            "flows/parent.yaml",
            vec!["flows/parent.yaml".to_string(), "flows/child.yaml".to_string()],
            provider,
        )
    }

    fn started(depth: usize, path: &str) -> RunEvent {
        RunEvent::FlowStarted {
            depth,
            flow_path: path.to_string(),
            flow_name: path.to_string(),
        }
    }

    fn cmd(index: usize) -> RunEvent {
        RunEvent::CommandStarted {
            depth: 0,
            index,
            command: format!("step {}", index),
        }
    }

    fn passed(index: usize) -> RunEvent {
        RunEvent::CommandPassed {
            index,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_nested_flow_scenario_reconciles_parent_indices() {
        let mut r = reconciler();

        r.handle(&started(0, "flows/parent.yaml"));
        r.handle(&cmd(0));
        r.handle(&passed(0));

        r.handle(&started(1, "child.yaml"));
        // the triggering parent step is marked running immediately
        let parent = r.state_of("flows/parent.yaml").unwrap();
        assert_eq!(parent.step_statuses[&1], StepStatus::Running);
        assert_eq!(parent.executing_step_index, Some(1));

        r.handle(&cmd(0));
        r.handle(&passed(0));
        r.handle(&cmd(1));
        r.handle(&passed(1));
        r.handle(&RunEvent::FlowFinished {
            depth: 1,
            status: RunStatus::Passed,
        });

        // child indices landed in the child's state
        let child = r.state_of("flows/child.yaml").unwrap();
        assert_eq!(child.step_statuses[&0], StepStatus::Passed);
        assert_eq!(child.step_statuses[&1], StepStatus::Passed);

        // the parent flow-reference step resolved to passed
        let parent = r.state_of("flows/parent.yaml").unwrap();
        assert_eq!(parent.step_statuses[&1], StepStatus::Passed);

        // S2 is addressed at parent index 2, not 3 or 1
        r.handle(&cmd(2));
        let parent = r.state_of("flows/parent.yaml").unwrap();
        assert_eq!(parent.executing_step_index, Some(2));
        assert_eq!(parent.step_statuses[&2], StepStatus::Running);
        assert!(!parent.step_statuses.contains_key(&3));

        r.handle(&passed(2));
        r.handle(&RunEvent::FlowFinished {
            depth: 0,
            status: RunStatus::Passed,
        });
        let parent = r.state_of("flows/parent.yaml").unwrap();
        assert_eq!(parent.executing_step_index, None);
    }

    #[test]
    fn test_consecutive_flow_references_advance_parent_offset() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut r = ProgressReconciler::new(
            "flows/main.yaml",
            vec![
                "flows/main.yaml".to_string(),
                "flows/a.yaml".to_string(),
                "flows/b.yaml".to_string(),
            ],
            provider,
        );

        r.handle(&started(0, "flows/main.yaml"));
        r.handle(&started(1, "a.yaml"));
        r.handle(&cmd(0));
        r.handle(&passed(0));
        r.handle(&RunEvent::FlowFinished {
            depth: 1,
            status: RunStatus::Passed,
        });
        r.handle(&started(1, "b.yaml"));
        r.handle(&cmd(0));
        r.handle(&RunEvent::CommandFailed {
            index: 0,
            error: "boom".to_string(),
            duration_ms: 1,
        });
        r.handle(&RunEvent::FlowFinished {
            depth: 1,
            status: RunStatus::Failed,
        });

        let main = r.state_of("flows/main.yaml").unwrap();
        assert_eq!(main.step_statuses[&0], StepStatus::Passed);
        assert_eq!(main.step_statuses[&1], StepStatus::Failed);
        assert_eq!(main.step_errors[&1], "nested flow failed");
    }

    #[test]
    fn test_push_pop_symmetry_tracks_event_depth() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut r = ProgressReconciler::new(
            "m.yaml",
            vec!["m.yaml".into(), "a.yaml".into(), "b.yaml".into()],
            provider,
        );

        r.handle(&started(0, "m.yaml"));
        assert_eq!(r.stack_depth(), 0);
        r.handle(&started(1, "a.yaml"));
        assert_eq!(r.stack_depth(), 1);
        r.handle(&started(2, "b.yaml"));
        assert_eq!(r.stack_depth(), 2);
        r.handle(&RunEvent::FlowFinished {
            depth: 2,
            status: RunStatus::Passed,
        });
        assert_eq!(r.stack_depth(), 1);
        r.handle(&RunEvent::FlowFinished {
            depth: 1,
            status: RunStatus::Passed,
        });
        assert_eq!(r.stack_depth(), 0);
        r.handle(&RunEvent::FlowFinished {
            depth: 0,
            status: RunStatus::Passed,
        });
        assert_eq!(r.stack_depth(), 0);
    }

    #[test]
    fn test_executing_line_comes_from_static_map() {
        let mut r = reconciler();
        r.handle(&started(0, "flows/parent.yaml"));
        r.handle(&cmd(0));

        let parent = r.state_of("flows/parent.yaml").unwrap();
        // "  - name: S0" is line 3 of PARENT_SRC
        assert_eq!(parent.executing_line, 3);
        assert_eq!(parent.step_lines[&2], 7);
    }

    #[test]
    fn test_unmapped_file_records_unresolved_line_then_backfills() {
        let provider = Arc::new(MemoryFileProvider::new());
        let mut r = ProgressReconciler::new(
            "ghost.yaml",
            vec!["ghost.yaml".to_string()],
            provider,
        );

        r.handle(&started(0, "ghost.yaml"));
        r.handle(&cmd(1));
        let state = r.state_of("ghost.yaml").unwrap();
        assert_eq!(state.executing_line, LINE_UNRESOLVED);
        assert_eq!(state.executing_step_index, Some(1));

        r.attach_source("ghost.yaml", "steps:\n  - name: a\n    url: /a\n  - name: b\n    url: /b\n");
        let state = r.state_of("ghost.yaml").unwrap();
        assert_eq!(state.executing_line, 4);
    }

    #[test]
    fn test_logs_attach_to_running_step_with_fallback() {
        let mut r = reconciler();
        r.handle(&started(0, "flows/parent.yaml"));
        r.handle(&cmd(0));
        r.handle(&RunEvent::Log {
            depth: 0,
            message: "while running".to_string(),
        });
        r.handle(&passed(0));
        r.handle(&RunEvent::Log {
            depth: 0,
            message: "after settle".to_string(),
        });

        let parent = r.state_of("flows/parent.yaml").unwrap();
        assert_eq!(
            parent.step_logs[&0],
            vec!["while running".to_string(), "after settle".to_string()]
        );
    }

    #[test]
    fn test_path_resolution_order() {
        let r = reconciler();
        // exact match
        assert_eq!(r.resolve_event_path("flows/child.yaml"), "flows/child.yaml");
        // relative to the run root's directory
        assert_eq!(r.resolve_event_path("child.yaml"), "flows/child.yaml");
        // backend temp path, matched by filename suffix
        assert_eq!(
            r.resolve_event_path("/backend/tmp/child.yaml"),
            "flows/child.yaml"
        );
        // unresolvable: normalized verbatim fallback
        assert_eq!(r.resolve_event_path("no/such.yaml"), "no/such.yaml");
    }

    #[test]
    fn test_new_run_clears_previous_state() {
        let mut r = reconciler();
        r.handle(&started(0, "flows/parent.yaml"));
        r.handle(&cmd(0));
        r.handle(&passed(0));
        assert!(!r.state_of("flows/parent.yaml").unwrap().step_statuses.is_empty());

        r.handle(&started(0, "flows/parent.yaml"));
        assert!(r.state_of("flows/parent.yaml").unwrap().step_statuses.is_empty());
        assert_eq!(r.steps_emitted(), 0);
    }
}
