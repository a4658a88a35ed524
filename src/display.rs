//! Terminal rendering of plans, reports and task responses

use colored::{ColoredString, Colorize};
use std::collections::BTreeSet;

use declarative::diff::group_by_kind;
use declarative::{
    Action, ActionError, CreateTaskResponse, DiffSummary, ReconcileReport, TaskStatus,
    TaskStatusResponse,
};

use crate::ui;

/// Display planned actions grouped by kind
pub fn display_plan(actions: &[Action]) {
    if actions.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Reconciliation Plan".bold()
    );
    println!("│");

    for (kind, kind_actions) in group_by_kind(actions) {
        println!("│ {}", kind.bold());
        for action in kind_actions {
            println!(
                "│   {} {:<30} {}",
                symbol(action),
                action.key().id,
                detail(action).dimmed()
            );
        }
        println!("│");
    }

    let summary = DiffSummary::from_actions(actions);
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} ({} create, {} update, {} delete)",
        ui::plural(summary.total(), "change").as_str().bold(),
        summary.creates.to_string().green(),
        (summary.member_updates + summary.metadata_updates)
            .to_string()
            .yellow(),
        summary.deletes.to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn symbol(action: &Action) -> ColoredString {
    match action {
        Action::Create { .. } => "+".green(),
        Action::UpdateMembers { .. } | Action::UpdateMetadata { .. } => "~".yellow(),
        Action::Delete { .. } => "-".red(),
    }
}

/// Short description of what an action changes
pub fn detail(action: &Action) -> String {
    match action {
        Action::Create { spec, .. } => format!(
            "(new) {}, {}",
            ui::plural(spec.members.len(), "member"),
            ui::plural(spec.channels.len(), "channel")
        ),
        Action::UpdateMembers { add, remove, .. } => {
            let mut parts = Vec::new();
            if !add.is_empty() {
                parts.push(format!("+{}", join(add)));
            }
            if !remove.is_empty() {
                parts.push(format!("-{}", join(remove)));
            }
            format!("members {}", parts.join(" "))
        }
        Action::UpdateMetadata {
            channels,
            description,
            ..
        } => format!(
            "channels [{}] description {}",
            join(channels),
            description.as_deref().map_or("(none)".to_string(), |d| format!("{d:?}"))
        ),
        Action::Delete { .. } => "(will remove)".to_string(),
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Display collected errors, one per line
pub fn display_errors(errors: &[ActionError]) {
    if errors.is_empty() {
        return;
    }
    ui::section(&format!("Errors ({})", errors.len()));
    for error in errors {
        let action = error
            .action_type
            .map(|t| format!(" [{t}]"))
            .unwrap_or_default();
        println!(
            "  {} {}{} {}",
            "✗".red(),
            error.key,
            action.dimmed(),
            error.message
        );
        ui::dim(&format!("    {}", error.kind.description()));
    }
}

/// Final summary line for a synchronous run
pub fn display_report(report: &ReconcileReport, dry_run: bool) {
    println!();
    if dry_run {
        ui::info(&format!(
            "Dry run: {} planned, nothing applied",
            ui::plural(report.actions.len(), "action")
        ));
    } else {
        ui::kv("Applied", &report.result.applied_count.to_string());
        ui::kv("Failed", &report.errors().len().to_string());
    }
    display_errors(report.errors());
}

pub fn status_label(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().yellow(),
        TaskStatus::Success => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
    }
}

pub fn display_created(response: &CreateTaskResponse) {
    ui::kv("Task", &response.task_id.to_string());
    ui::kv("Status URL", &response.status_url);
    ui::kv("Status", &status_label(response.status).to_string());
}

pub fn display_task_status(response: &TaskStatusResponse) {
    ui::section("Task Status");
    ui::kv("Status", &status_label(response.status).to_string());
    if let Some(applied) = response.applied_count {
        ui::kv("Applied", &applied.to_string());
    }
    if let Some(actions) = &response.actions {
        display_plan(actions);
    }
    if let Some(errors) = &response.errors {
        display_errors(errors);
    }
}
