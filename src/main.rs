use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use shipwright::config::{DEFAULT_CONFIG_PATH, ShipwrightConfig};
use shipwright::orchestrator::RunTrigger;
use shipwright_common::ApprovalResponsePayload;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Durable, human-gated feature delivery from request to pull request")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to shipwright.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and sweep expired approvals
    Serve {
        /// Address to bind, overriding server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Start a run and drive it until it needs a human
    Run {
        /// The feature request, in plain language
        request: String,
        /// Repository URL
        #[arg(long)]
        repo: String,
        /// Branch the pull request targets
        #[arg(long, default_value = "main")]
        branch: String,
        /// Runtime image key for docker environments
        #[arg(long, default_value = "node")]
        runtime: String,
        /// Answer approvals inline instead of exiting
        #[arg(short, long)]
        interactive: bool,
    },
    /// Answer a pending approval
    Respond(RespondArgs),
    /// Drive a run that is not waiting on anyone
    Resume {
        run_id: String,
        #[arg(short, long)]
        interactive: bool,
    },
    /// List runs, or show one in detail
    Status { run_id: Option<String> },
    /// List pending approvals
    Approvals,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("answer").required(true).args(["approve", "reject", "text", "choice"])))]
pub struct RespondArgs {
    pub approval_id: String,
    #[arg(long)]
    pub approve: bool,
    #[arg(long)]
    pub reject: bool,
    /// Reason, for --reject
    #[arg(long, requires = "reject")]
    pub reason: Option<String>,
    /// Free-text answer
    #[arg(long)]
    pub text: Option<String>,
    /// Id of the chosen option
    #[arg(long)]
    pub choice: Option<String>,
    /// Only record the answer; do not resume the run here
    #[arg(long)]
    pub no_resume: bool,
}

impl RespondArgs {
    fn response(&self) -> ApprovalResponsePayload {
        if let Some(text) = &self.text {
            ApprovalResponsePayload::Text { text: text.clone() }
        } else if let Some(selected_id) = &self.choice {
            ApprovalResponsePayload::Choice {
                selected_id: selected_id.clone(),
            }
        } else {
            ApprovalResponsePayload::Approval {
                approved: self.approve,
                reason: self.reason.clone(),
            }
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default shipwright.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ShipwrightConfig::load_or_default(&cli.config)?;
    let _log_guard = shipwright::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind } => cmd::cmd_serve(&config, bind.as_deref()).await?,
        Commands::Run {
            request,
            repo,
            branch,
            runtime,
            interactive,
        } => {
            let trigger = RunTrigger {
                request,
                repo_url: repo,
                target_branch: branch,
                runtime,
            };
            cmd::cmd_run(&config, trigger, interactive).await?;
        }
        Commands::Respond(args) => {
            let response = args.response();
            cmd::cmd_respond(&config, &args.approval_id, response, !args.no_resume).await?;
        }
        Commands::Resume { run_id, interactive } => cmd::cmd_resume(&config, &run_id, interactive).await?,
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref()).await?,
        Commands::Approvals => cmd::cmd_approvals(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_respond_choice() {
        let cli = Cli::parse_from(["shipwright", "respond", "ap-1", "--choice", "b"]);
        let Commands::Respond(args) = cli.command else {
            panic!("expected respond");
        };
        assert_eq!(
            args.response(),
            ApprovalResponsePayload::Choice {
                selected_id: "b".into()
            }
        );
    }

    #[test]
    fn test_cli_parses_reject_with_reason() {
        let cli = Cli::parse_from(["shipwright", "respond", "ap-1", "--reject", "--reason", "scope creep"]);
        let Commands::Respond(args) = cli.command else {
            panic!("expected respond");
        };
        assert_eq!(
            args.response(),
            ApprovalResponsePayload::Approval {
                approved: false,
                reason: Some("scope creep".into())
            }
        );
    }

    #[test]
    fn test_cli_respond_requires_an_answer() {
        assert!(Cli::try_parse_from(["shipwright", "respond", "ap-1"]).is_err());
        assert!(Cli::try_parse_from(["shipwright", "respond", "ap-1", "--approve", "--reject"]).is_err());
    }

    #[test]
    fn test_cli_verify() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
