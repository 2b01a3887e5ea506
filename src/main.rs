use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use flowtest::provider::{FileProvider, FsFileProvider};
use flowtest::report;
use flowtest::report::types::TestResults;
use flowtest::runner::events::{ConsoleEventListener, EventEmitter};
use flowtest::runner::executor::DEFAULT_TIMEOUT_MS;
use flowtest::runner::{run_flow, run_folder, RunOptions};

#[derive(Parser)]
#[command(name = "flowtest")]
#[command(version = "0.1.0")]
#[command(about = "YAML-driven API test flow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow file or a folder of flows
    Run {
        /// Path to a flow file or directory
        path: PathBuf,

        /// Output directory for reports
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Default request timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Pacing delay between steps in milliseconds
        #[arg(long, default_value = "0")]
        delay: u64,

        /// Generate reports (JSON, JUnit)
        #[arg(long, default_value = "false")]
        report: bool,

        /// Seed variables, key=value. Can be specified multiple times.
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
    },

    /// Generate report from saved test results
    Report {
        /// Path to test results JSON
        results: PathBuf,

        /// Output format (json, junit)
        #[arg(short, long, default_value = "junit")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            path,
            output,
            timeout,
            delay,
            report,
            env,
        } => {
            let mut variables = HashMap::new();
            for pair in &env {
                match pair.split_once('=') {
                    Some((key, value)) => {
                        variables.insert(key.trim().to_string(), value.to_string());
                    }
                    None => anyhow::bail!("Invalid variable format: {}. Use NAME=VALUE", pair),
                }
            }

            println!(
                "{} Running flows from: {}",
                "▶".green().bold(),
                path.display()
            );
            if let Some(t) = timeout {
                println!("  Timeout: {}ms", t.to_string().cyan());
            }
            if !variables.is_empty() {
                println!("  Variables: {}", variables.len().to_string().cyan());
            }
            if report {
                println!("  Reports: {}", "Enabled".green());
            }

            let cancel = CancellationToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                println!("\n{} Cancelling run...", "⏹".yellow());
                handler_token.cancel();
            })?;

            let (emitter, receiver) = EventEmitter::new();
            let emitter = Arc::new(emitter);
            tokio::spawn(ConsoleEventListener::listen(receiver));

            let provider = Arc::new(FsFileProvider);
            let options = RunOptions {
                timeout_ms: timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
                step_delay_ms: delay,
                variables,
            };

            let results = if path.is_dir() {
                run_folder(&path, provider, emitter, &options, |_| {}, &cancel).await?
            } else {
                let source = provider.read_file(&path)?;
                let file_id = path.to_string_lossy().to_string();
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file_id.clone());
                vec![
                    run_flow(
                        &source, &file_id, &file_name, provider, emitter, &options,
                        |_| {},
                        |_| {},
                        &cancel,
                    )
                    .await?,
                ]
            };

            let all = TestResults::from_results(results);
            println!(
                "\n{} {} files, {} passed, {} failed ({}ms)",
                "■".blue().bold(),
                all.summary.total_files,
                all.summary.passed.to_string().green(),
                all.summary.failed.to_string().red(),
                all.summary.total_duration_ms
            );

            if report {
                std::fs::create_dir_all(&output)?;
                let json_path = output.join("results.json");
                report::json::generate(&all, Some(&json_path)).await?;
                report::junit::write_report(&all, &output)?;
            }

            if !all.all_passed() {
                anyhow::bail!("Some flows failed");
            }
        }

        Commands::Report {
            results,
            format,
            output,
        } => {
            println!(
                "{} Generating {} report from: {}",
                "📊".blue(),
                format.cyan(),
                results.display()
            );
            report::generate_report(&results, &format, output.as_deref()).await?;
        }
    }

    Ok(())
}
