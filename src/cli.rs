use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Reconcile declared resources against the systems that own them", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/converge.toml)
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Diff(TargetArgs),

    /// Reconcile now and wait for the result
    Apply(ApplyArgs),

    /// Queue a reconciliation task and poll its status
    Submit(SubmitArgs),

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct TargetArgs {
    /// Limit to a kind or kind.id-substring (e.g. "usergroup.oncall")
    pub target: Option<String>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Limit to a kind or kind.id-substring
    pub target: Option<String>,

    /// Dry run - show what would be done
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Treat any collected error as a failed run
    #[arg(long, conflicts_with = "allow_partial")]
    pub fail_on_partial_error: bool,

    /// Report errors but still exit successfully
    #[arg(long)]
    pub allow_partial: bool,

    /// Delete live resources of declared kinds that are not declared
    #[arg(long)]
    pub prune: bool,
}

impl ApplyArgs {
    /// Partial-failure policy: flags override the configured default
    pub fn fail_on_partial(&self, configured: bool) -> bool {
        if self.allow_partial {
            false
        } else {
            self.fail_on_partial_error || configured
        }
    }
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Limit to a kind or kind.id-substring
    pub target: Option<String>,

    /// Apply changes instead of a dry run
    #[arg(long)]
    pub apply: bool,

    /// Seconds to wait for the task to finish
    #[arg(short, long, default_value = "30")]
    pub wait: u64,

    /// Print protocol responses as JSON
    #[arg(long)]
    pub json: bool,

    /// Number of worker threads
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show config location, settings and declared resources
    Show,

    /// Print the config file path
    Path,

    /// Validate declarations against policy and secrets
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::parse_from(["converge", "-vv", "apply", "usergroup", "-n", "--allow-partial"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.target.as_deref(), Some("usergroup"));
                assert!(args.dry_run);
                assert!(!args.fail_on_partial(true));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_partial_flags_conflict() {
        let result = Cli::try_parse_from([
            "converge",
            "apply",
            "--fail-on-partial-error",
            "--allow-partial",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_submit_defaults_to_dry_run() {
        let cli = Cli::parse_from(["converge", "submit"]);
        match cli.command {
            Command::Submit(args) => {
                assert!(!args.apply);
                assert_eq!(args.wait, 30);
                assert!(args.jobs.is_none());
            }
            _ => panic!("expected submit"),
        }
    }
}
