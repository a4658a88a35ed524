//! Reconciliation commands
//!
//! - `diff` - Preview what apply would change
//! - `apply` - Reconcile synchronously
//! - `submit` - Queue a task through the job protocol and poll it

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use declarative::{
    DesiredBatch, ExecuteOptions, ExternalResourceAdapter, NoProgress, ProtocolError,
    ProtocolResponse, ReconcileReport, ReconcileService, TaskRunner, TaskStatus,
    TaskStatusResponse, reconcile_sync,
};

use crate::Context;
use crate::cli::{ApplyArgs, SubmitArgs};
use crate::config::{ConvergeConfig, FileSource};
use crate::display;
use crate::paths;
use crate::progress::{self, ApplyProgress};
use crate::store::FileAdapter;
use crate::ui;

// ============================================================================
// Loading
// ============================================================================

fn load_config(ctx: &Context) -> Result<(ConvergeConfig, PathBuf)> {
    let path = paths::config_file(ctx.config.as_deref())?;
    if !path.exists() {
        bail!(
            "No config found at {} (use --config or set {})",
            path.display(),
            paths::ENV_CONFIG_DIR
        );
    }
    let config = ConvergeConfig::load(&path)?;
    Ok((config, path))
}

fn open_store() -> Result<FileAdapter> {
    let path = paths::live_state_file()?;
    FileAdapter::open(&path).context("Failed to open live state")
}

/// Compute actions without touching the adapter's resources
fn plan(
    batch: &DesiredBatch,
    adapter: &dyn ExternalResourceAdapter,
    opts: &ExecuteOptions,
) -> ReconcileReport {
    let opts = ExecuteOptions {
        dry_run: true,
        ..opts.clone()
    };
    reconcile_sync(batch, adapter, &opts, &mut NoProgress)
}

/// Turn the outcome of a run into the command result
fn finish(report: &ReconcileReport, fail_on_partial_error: bool) -> Result<()> {
    let errors = report.errors().len();
    match report.status(fail_on_partial_error) {
        TaskStatus::Failed => bail!("{} during reconciliation", ui::plural(errors, "error")),
        _ if errors > 0 => {
            ui::warn(&format!(
                "Completed with {}",
                ui::plural(errors, "error")
            ));
            Ok(())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Diff
// ============================================================================

pub fn diff(ctx: &Context, target: Option<&str>) -> Result<()> {
    let (config, _) = load_config(ctx)?;
    ui::header("Configuration Diff");

    let batch = config.batch(target)?;
    let adapter = open_store()?;
    let report = plan(&batch, &adapter, &config.execute_options(true));

    display::display_plan(&report.actions);
    display::display_errors(report.errors());

    if report.actions.is_empty() && report.errors().is_empty() {
        println!();
        ui::success("No changes - live state matches declared state");
    }
    Ok(())
}

// ============================================================================
// Apply
// ============================================================================

pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let (config, path) = load_config(ctx)?;
    ui::header("Applying Configuration");
    if ctx.verbose > 0 {
        ui::kv("Config", &path.display().to_string());
    }

    if args.dry_run {
        ui::warn("Dry run - no changes will be made");
    }

    let fail_on_partial = args.fail_on_partial(config.settings.fail_on_partial_error);
    let mut opts = config.execute_options(true);
    opts.fail_on_partial_error = fail_on_partial;
    opts.prune |= args.prune;

    let batch = config.batch(args.target.as_deref())?;
    let adapter = open_store()?;
    let planned = plan(&batch, &adapter, &opts);
    display::display_plan(&planned.actions);

    if args.dry_run || planned.actions.is_empty() {
        display::display_report(&planned, true);
        return finish(&planned, fail_on_partial);
    }

    if !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    opts.dry_run = false;
    let mut progress = ApplyProgress::new(ctx.quiet);
    let report = reconcile_sync(&batch, &adapter, &opts, &mut progress);
    progress.finish();

    display::display_report(&report, false);
    finish(&report, fail_on_partial)?;
    if report.result.is_success() {
        ui::success("Apply complete!");
    }
    Ok(())
}

/// Ask for confirmation before applying
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    println!();
    let confirmed = Confirm::new()
        .with_prompt("Apply these changes?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")?;

    Ok(confirmed)
}

// ============================================================================
// Submit
// ============================================================================

/// Status code and body, the way a transport would send them
#[derive(Serialize)]
struct Envelope<'a, T> {
    status_code: u16,
    body: &'a T,
}

fn print_json<T: Serialize>(status_code: u16, body: &T) -> Result<()> {
    let envelope = Envelope { status_code, body };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

pub fn submit(ctx: &Context, args: &SubmitArgs) -> Result<()> {
    let (config, path) = load_config(ctx)?;
    let dry_run = !args.apply;

    let mut opts = config.execute_options(dry_run);
    if let Some(jobs) = args.jobs {
        opts.jobs = jobs.max(1);
    }

    let adapter: Arc<dyn ExternalResourceAdapter> = Arc::new(open_store()?);
    let runner = TaskRunner::new(adapter, opts)?;
    let service = ReconcileService::new(
        runner,
        config.policy.clone(),
        Arc::new(config.resolver()),
    );

    let created =
        service.create_task_from_source(&FileSource::new(path), dry_run, args.target.as_deref())?;
    if args.json {
        print_json(created.status_code, &created.body)?;
    } else {
        ui::header(if dry_run {
            "Submitted Task (dry run)"
        } else {
            "Submitted Task"
        });
        display::display_created(&created.body);
    }

    let task_id = created.body.task_id.to_string();
    let outcome = wait_for(
        &service,
        &task_id,
        Duration::from_secs(args.wait),
        config.settings.poll_interval(),
        ctx.quiet || args.json,
    );

    match outcome {
        Ok(response) => {
            if args.json {
                print_json(response.status_code, &response.body)?;
            } else {
                display::display_task_status(&response.body);
            }
            if response.body.status == TaskStatus::Failed {
                bail!("Task {task_id} failed");
            }
            Ok(())
        }
        Err(e) => {
            if args.json {
                print_json(e.status_code(), &e.body())?;
            } else {
                ui::error(&e.to_string());
            }
            if matches!(e, ProtocolError::RequestTimeout { .. }) {
                ui::dim("The task is abandoned when converge exits; raise --wait to let it finish");
            }
            Err(e.into())
        }
    }
}

/// Poll a task until it is terminal or `wait` runs out
///
/// Each poll blocks for at most `interval` so the spinner keeps moving.
fn wait_for(
    service: &ReconcileService,
    task_id: &str,
    wait: Duration,
    interval: Duration,
    quiet: bool,
) -> Result<ProtocolResponse<TaskStatusResponse>, ProtocolError> {
    let spinner = progress::spinner("Waiting for task", quiet);
    let deadline = Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match service.get_task_status(task_id, Some(remaining.min(interval))) {
            Err(ProtocolError::RequestTimeout { .. }) if Instant::now() < deadline => {
                spinner.tick();
            }
            outcome => {
                spinner.finish_and_clear();
                return outcome;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
