use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mend::config::Config;
use mend::orchestration::{run_project, RunEvent};
use mend::state::StateDir;
use mend::{mlog, mlog_error, Result, RunReport};

/// Mend - drive a project towards zero errors with fix, scan and verify passes
#[derive(Parser, Debug)]
#[command(name = "mend")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MEND_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to <state dir>/mend.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the convergence loop until the project is clean or a budget runs out
    Run {
        /// Project root (defaults to the current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Configuration file (defaults to <root>/mend.toml, then ~/.mend/mend.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Override [run].max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Override [run].threshold (0-100)
        #[arg(long)]
        threshold: Option<f64>,

        /// Override [run].pool_size
        #[arg(long)]
        pool_size: Option<usize>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recorded iterations from previous runs
    History {
        /// Project root (defaults to the current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Number of most recent iterations to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },
}

/// `[run]` overrides taken from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Overrides {
    max_iterations: Option<u32>,
    threshold: Option<f64>,
    pool_size: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(max_iterations) = self.max_iterations {
            config.run.max_iterations = max_iterations;
        }
        if let Some(threshold) = self.threshold {
            config.run.threshold = threshold;
        }
        if let Some(pool_size) = self.pool_size {
            config.run.pool_size = Some(pool_size);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            root,
            config,
            max_iterations,
            threshold,
            pool_size,
            json,
        } => {
            let overrides = Overrides {
                max_iterations,
                threshold,
                pool_size,
            };
            let code = run(resolve_root(root)?, config, overrides, json, cli.debug)?;
            process::exit(code);
        }
        Command::History { root, limit } => run_history(&resolve_root(root)?, limit),
    }
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(std::env::current_dir()?),
    }
}

/// Run the loop and print the report.
///
/// # Returns
///
/// The process exit code for the outcome.
fn run(root: PathBuf, config_path: Option<PathBuf>, overrides: Overrides, json: bool, debug: bool) -> Result<i32> {
    let mut config = Config::load(&root, config_path.as_deref())?;
    overrides.apply(&mut config);
    config.validate()?;

    mend::log::init(&config.state_dir(&root), debug);
    mlog!("mend starting on {} (debug={})", root.display(), mend::log::is_debug());

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, stopping after the current batch");
                ctrl_c.cancel();
            }
        });

        let (event_tx, event_rx) = mpsc::channel(256);
        let printer = (!json).then(|| tokio::spawn(print_progress(event_rx)));
        let result = run_project(&root, config, cancel, Some(event_tx)).await;
        if let Some(printer) = printer {
            let _ = printer.await;
        }
        result
    });

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            mlog_error!("run aborted: {}", e);
            return Err(e);
        }
    };
    print_report(&report, json)?;
    Ok(report.exit_code())
}

async fn print_progress(mut events: mpsc::Receiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::IterationStarted { index } => eprintln!("iteration {}", index),
            RunEvent::TaskFinished {
                label, success: false, ..
            } => eprintln!("  failed: {}", label),
            RunEvent::IterationFinished {
                index,
                score,
                best_score,
                converged,
            } => eprintln!(
                "iteration {} score {:.1} (best {:.1}){}",
                index,
                score,
                best_score,
                if converged { ", converged" } else { "" }
            ),
            RunEvent::Escalated {
                worker, pool_capacity, ..
            } => eprintln!("  escalating {} worker (pool {})", worker, pool_capacity),
            RunEvent::Stalled { tasks } => eprintln!("  {} task(s) stalled", tasks.len()),
            _ => {}
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

fn run_history(root: &Path, limit: usize) -> Result<()> {
    let config = Config::load(root, None)?;
    let state = StateDir::at(&config.state_dir(root));
    let entries = state.history().read(Some(limit))?;
    if entries.is_empty() {
        println!("No recorded iterations in {}", state.path().display());
        return Ok(());
    }

    println!("{:<36}  {:>4}  {:>7}  {:>7}  {:>6}  {:>5}", "RUN", "ITER", "SCORE", "BEST", "ERRORS", "TASKS");
    for entry in entries {
        let r = &entry.record;
        println!(
            "{:<36}  {:>4}  {:>7.1}  {:>7.1}  {:>6}  {:>5}{}",
            entry.run_id,
            r.index,
            r.score,
            r.best_score,
            r.errors,
            r.tasks_dispatched,
            if r.converged { "  converged" } else { "" }
        );
    }
    Ok(())
}
