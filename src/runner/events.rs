use super::state::RunStatus;
use tokio::sync::broadcast;

/// Execution events for real-time observers. `index` values are local to
/// the emitting file's flattened step space; flow boundaries carry the
/// nesting depth so consumers can track the path stack.
#[derive(Debug, Clone)]
pub enum RunEvent {
    FlowStarted {
        depth: usize,
        flow_path: String,
        flow_name: String,
    },
    FlowFinished {
        depth: usize,
        status: RunStatus,
    },
    CommandStarted {
        depth: usize,
        index: usize,
        command: String,
    },
    CommandPassed {
        index: usize,
        duration_ms: u64,
    },
    CommandFailed {
        index: usize,
        error: String,
        duration_ms: u64,
    },
    Log {
        depth: usize,
        message: String,
    },
}

/// Event emitter for broadcasting run events
pub struct EventEmitter {
    sender: broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, broadcast::Receiver<RunEvent>) {
        let (sender, receiver) = broadcast::channel(256);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration as StdDuration;

/// Console event listener for printing real-time updates
pub struct ConsoleEventListener;

impl ConsoleEventListener {
    pub async fn listen(mut receiver: broadcast::Receiver<RunEvent>) {
        use std::io::IsTerminal;

        let multi = if std::io::stdout().is_terminal() {
            MultiProgress::new()
        } else {
            // Piped output: no terminal escape codes
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        // One spinner slot per nesting depth
        let mut spinners: Vec<Option<ProgressBar>> = Vec::new();
        let mut command_texts: Vec<String> = Vec::new();
        let mut depth = 0usize;

        while let Ok(event) = receiver.recv().await {
            match event {
                RunEvent::FlowStarted {
                    depth: d,
                    flow_name,
                    ..
                } => {
                    depth = d;
                    let indent = "    ".repeat(d);
                    multi
                        .println(format!(
                            "{}{} Flow: {}",
                            indent,
                            "→".blue(),
                            flow_name.white().bold()
                        ))
                        .ok();
                }

                RunEvent::FlowFinished { depth: d, status } => {
                    if d < spinners.len() {
                        if let Some(pb) = spinners[d].take() {
                            pb.finish();
                        }
                    }
                    let status_str = match status {
                        RunStatus::Passed => "PASSED".green().bold(),
                        RunStatus::Failed => "FAILED".red().bold(),
                        RunStatus::Cancelled => "CANCELLED".yellow().bold(),
                        RunStatus::Running => "RUNNING".white().bold(),
                    };
                    let indent = "    ".repeat(d);
                    multi
                        .println(format!("{}{} Flow [{}]", indent, "←".blue(), status_str))
                        .ok();
                    depth = d.saturating_sub(1);
                }

                RunEvent::CommandStarted {
                    depth: d,
                    index,
                    command,
                } => {
                    depth = d;
                    if d >= spinners.len() {
                        spinners.resize(d + 1, None);
                        command_texts.resize(d + 1, String::new());
                    }

                    let pb = multi.add(ProgressBar::new_spinner());
                    let indent = "    ".repeat(d);
                    let style = ProgressStyle::default_spinner()
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                        .template(&format!("{}  {{spinner}} {{msg}}", indent))
                        .unwrap();
                    pb.set_style(style);

                    let body = format!("[{}] {}... ", index, command.dimmed());
                    pb.set_message(body.clone());
                    pb.enable_steady_tick(StdDuration::from_millis(100));

                    spinners[d] = Some(pb);
                    command_texts[d] = body;
                }

                RunEvent::CommandPassed { duration_ms, .. } => {
                    if depth < spinners.len() {
                        let indent = "    ".repeat(depth);
                        let done = format!(
                            "{}  {} {}({}ms)",
                            indent,
                            "✓".green(),
                            command_texts[depth],
                            duration_ms
                        );
                        if let Some(pb) = spinners[depth].take() {
                            pb.finish_and_clear();
                        }
                        multi.println(done).ok();
                    }
                }

                RunEvent::CommandFailed {
                    error, duration_ms, ..
                } => {
                    if depth < spinners.len() {
                        let indent = "    ".repeat(depth);
                        let done = format!(
                            "{}  {} {}({}ms)\n{}      {}",
                            indent,
                            "✗".red(),
                            command_texts[depth],
                            duration_ms,
                            indent,
                            error.red()
                        );
                        if let Some(pb) = spinners[depth].take() {
                            pb.finish_and_clear();
                        }
                        multi.println(done).ok();
                    }
                }

                RunEvent::Log { depth: d, message } => {
                    let indent = "    ".repeat(d);
                    multi.println(format!("{}      {}", indent, message)).ok();
                }
            }
        }
    }
}
