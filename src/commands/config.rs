use anyhow::{Result, bail};

use declarative::DesiredBatch;

use crate::Context;
use crate::cli::ConfigCommand;
use crate::config::ConvergeConfig;
use crate::paths;
use crate::ui;

pub fn run(ctx: &Context, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(ctx),
        ConfigCommand::Path => path(ctx),
        ConfigCommand::Validate => validate(ctx),
    }
}

fn path(ctx: &Context) -> Result<()> {
    println!("{}", paths::config_file(ctx.config.as_deref())?.display());
    Ok(())
}

fn show(ctx: &Context) -> Result<()> {
    ui::header("Configuration");

    let file = paths::config_file(ctx.config.as_deref())?;
    println!();
    ui::kv("Config file", &file.display().to_string());
    ui::kv("Live state", &paths::live_state_file()?.display().to_string());

    if !file.exists() {
        println!();
        ui::dim("Config file not found");
        return Ok(());
    }

    let config = ConvergeConfig::load(&file)?;
    let settings = &config.settings;

    ui::section("Settings");
    ui::kv("jobs", &settings.jobs.to_string());
    ui::kv(
        "fail_on_partial_error",
        &settings.fail_on_partial_error.to_string(),
    );
    ui::kv(
        "empty_members_placeholder",
        settings
            .empty_members_placeholder
            .as_deref()
            .unwrap_or("(none)"),
    );
    ui::kv("prune", &settings.prune.to_string());
    ui::kv("poll_interval_ms", &settings.poll_interval_ms.to_string());

    ui::section(&format!("Resources ({})", config.resources.len()));
    for decl in &config.resources {
        let state = if decl.enabled { "" } else { " (disabled)" };
        println!("  {}{}", decl.key(), state);
    }

    if !config.secrets.is_empty() {
        println!();
        ui::dim(&format!(
            "{} defined inline",
            ui::plural(config.secrets.len(), "secret")
        ));
    }
    Ok(())
}

/// Problems found in a config, one message per rejected declaration
fn problems(config: &ConvergeConfig) -> Vec<String> {
    match DesiredBatch::load(&config.resources, &config.policy, &config.resolver()) {
        Ok(batch) => batch.errors.iter().map(ToString::to_string).collect(),
        Err(e) => vec![e.to_string()],
    }
}

fn validate(ctx: &Context) -> Result<()> {
    ui::header("Validating Configuration");

    let file = paths::config_file(ctx.config.as_deref())?;
    let config = ConvergeConfig::load(&file)?;
    ui::success(&format!(
        "{}: {}",
        file.display(),
        ui::plural(config.resources.len(), "declaration")
    ));

    let problems = problems(&config);
    if problems.is_empty() {
        ui::success("All declarations are valid");
        return Ok(());
    }

    for problem in &problems {
        ui::error(problem);
    }
    bail!("{} found", ui::plural(problems.len(), "problem"))
}
