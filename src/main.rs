//! jobworker — entry point.
//!
//! Runs one confined job per invocation. By default the job's combined
//! stdout/stderr is streamed to stdout as it arrives; with `--json`,
//! stdout carries a single JSON object instead. Tracing logs go to
//! stderr either way.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobworker::cgroup::{CpuMax, JobLimits};
use jobworker::config::Config;
use jobworker::error::Error;
use jobworker::job::JobStatus;
use jobworker::launcher::LaunchSpec;
use jobworker::manager::JobManager;
use jobworker::schema::{ErrorResponse, Response, RunData, wire_status};

#[derive(Debug, Parser)]
#[command(name = "jobworker")]
#[command(about = "Run a command confined by kernel resource limits", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a job, stream its output, and wait for it to finish.
    Run {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<String>,

        /// Override the cgroup hierarchy root.
        #[arg(long)]
        cgroup_root: Option<String>,

        /// Relative CPU weight, 1-10000 (cpu.weight).
        #[arg(long)]
        cpu_weight: Option<u32>,

        /// CPU cap as QUOTA[:PERIOD] in microseconds (cpu.max); the period
        /// defaults to 100000.
        #[arg(long)]
        cpu_max: Option<String>,

        /// Hard memory ceiling in bytes (memory.max).
        #[arg(long)]
        memory_max: Option<u64>,

        /// Relative block-I/O weight, 1-10000 (io.weight).
        #[arg(long)]
        io_weight: Option<u32>,

        /// Raw io.max line, e.g. "8:0 rbps=1048576".
        #[arg(long)]
        io_max: Option<String>,

        /// Override the SIGTERM-to-SIGKILL grace interval in milliseconds.
        #[arg(long)]
        grace_ms: Option<u64>,

        /// Additional environment variables for the child.
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,

        /// Working directory for the child.
        #[arg(long)]
        cwd: Option<String>,

        /// Suppress raw streaming; print a final JSON object instead.
        #[arg(long)]
        json: bool,

        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays job output / JSON only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(err) = e.downcast_ref::<Error>() {
                ErrorResponse::new(err.code(), format!("{e:#}"), err.retryable()).print();
            } else {
                ErrorResponse::new("internal_error", format!("{e:#}"), false).print();
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            cgroup_root,
            cpu_weight,
            cpu_max,
            memory_max,
            io_weight,
            io_max,
            grace_ms,
            env_vars,
            cwd,
            json,
            command,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(root) = cgroup_root {
                config.cgroup_root = root.into();
            }
            if let Some(ms) = grace_ms {
                config.stop_grace_ms = ms;
            }

            let limits = JobLimits {
                cpu_weight,
                cpu_max: cpu_max.as_deref().map(parse_cpu_max).transpose()?,
                memory_max,
                io_weight,
                io_max,
            };

            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("no command specified"))?;

            let spec = LaunchSpec {
                program: program.clone(),
                args: args.to_vec(),
                env: env_vars
                    .iter()
                    .map(|kv| parse_env_var(kv))
                    .collect::<Result<_>>()?,
                cwd,
                limits,
            };

            run_job(config, spec, json).await
        }
    }
}

async fn run_job(config: Config, spec: LaunchSpec, json: bool) -> Result<i32> {
    let manager = Arc::new(JobManager::new(config));
    let job_id = manager.start(spec).await?;

    // Ctrl-C triggers the graceful stop protocol; the output stream ends
    // once the reaper closes the log.
    {
        let manager = Arc::clone(&manager);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(job_id = %job_id, "interrupt, stopping job");
                let _ = manager.stop(&job_id).await;
            }
        });
    }

    let mut stream = manager.stream(&job_id, CancellationToken::new())?;
    let mut stdout = tokio::io::stdout();
    let mut output_bytes: u64 = 0;
    while let Some(item) = stream.recv().await {
        match item {
            Ok(chunk) => {
                output_bytes += chunk.len() as u64;
                if !json {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "output stream dropped");
                break;
            }
        }
    }

    let report = manager.wait(&job_id).await?;
    let (exit_code, exited) = wire_status(&report.status);
    if json {
        Response::new(
            "run",
            RunData {
                job_id: report.id.clone(),
                state: report.status.label().to_string(),
                exit_code,
                exited,
                output_bytes,
            },
        )
        .print();
    }
    manager.shutdown().await;

    Ok(match report.status {
        JobStatus::Exited(code) => code,
        JobStatus::Signaled(signal) => 128 + signal,
        JobStatus::Failed(_) | JobStatus::Running => 1,
    })
}

/// Parse QUOTA[:PERIOD] microseconds into a `cpu.max` record.
fn parse_cpu_max(raw: &str) -> Result<CpuMax> {
    let (quota, period) = match raw.split_once(':') {
        Some((q, p)) => (q, Some(p)),
        None => (raw, None),
    };
    let quota_usec = quota
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid cpu quota: {quota}"))?;
    let period_usec = match period {
        Some(p) => p
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid cpu period: {p}"))?,
        None => 100_000,
    };
    Ok(CpuMax {
        quota_usec,
        period_usec,
    })
}

/// Parse a single KEY=VALUE string into (key, value).
fn parse_env_var(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("invalid environment variable (expected KEY=VALUE): {raw}"),
    }
}
