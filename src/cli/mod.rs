pub mod commands;
pub mod errors;
pub mod output;

use crate::config::{CliArgs, ServerConfig};
use crate::export::ExportMode;
use crate::runtime::stateless::StatelessRuntime;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "sheetpilot-cli",
    version,
    about = "Inspect, edit and export workbooks from the command line"
)]
pub struct Cli {
    /// Print JSON on one line.
    #[arg(long, global = true)]
    pub compact: bool,

    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(flatten)]
    pub settings: CliSettings,

    #[command(subcommand)]
    pub command: Commands,
}

/// The subset of server settings that matters for one-shot commands.
#[derive(Debug, Clone, Default, Args)]
pub struct CliSettings {
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "SHEETPILOT_WORKSPACE", value_name = "DIR", global = true)]
    pub workspace_root: Option<PathBuf>,

    #[arg(long, env = "SHEETPILOT_API_BASE", value_name = "URL", global = true)]
    pub api_base: Option<String>,

    #[arg(
        long,
        env = "SHEETPILOT_API_KEY",
        value_name = "KEY",
        hide_env_values = true,
        global = true
    )]
    pub api_key: Option<String>,

    #[arg(long, env = "SHEETPILOT_MODEL", value_name = "MODEL", global = true)]
    pub model: Option<String>,

    #[arg(long, env = "SHEETPILOT_MAX_TOOL_ROUNDS", value_name = "N", global = true)]
    pub max_tool_rounds: Option<u32>,

    #[arg(long, env = "SHEETPILOT_REQUEST_TIMEOUT_MS", value_name = "MS", global = true)]
    pub request_timeout_ms: Option<u64>,
}

impl CliSettings {
    pub fn into_config(self) -> Result<ServerConfig> {
        ServerConfig::from_args(CliArgs {
            config: self.config,
            workspace_root: self.workspace_root,
            api_base: self.api_base,
            api_key: self.api_key,
            model: self.model,
            max_tool_rounds: self.max_tool_rounds,
            request_timeout_ms: self.request_timeout_ms,
            ..CliArgs::default()
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the workbook summary.
    Inspect { file: PathBuf },
    /// Render one sheet with evaluated values.
    View {
        file: PathBuf,
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Apply a JSON change list and write the result.
    Apply {
        file: PathBuf,
        #[arg(long, value_name = "JSON")]
        changes: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = ExportMode::Patch)]
        mode: ExportMode,
    },
    /// Ask the assistant for changes; writes them only with --apply.
    Chat {
        file: PathBuf,
        #[arg(long)]
        message: String,
        #[arg(long)]
        sheet: Option<String>,
        #[arg(long)]
        selection: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        apply: bool,
    },
}

pub async fn run_command(command: Commands, config: ServerConfig) -> Result<Value> {
    let runtime = StatelessRuntime::new(config);
    match command {
        Commands::Inspect { file } => commands::read::inspect(&runtime, file).await,
        Commands::View { file, sheet } => commands::read::view(&runtime, file, sheet).await,
        Commands::Apply {
            file,
            changes,
            out,
            mode,
        } => commands::write::apply(&runtime, file, changes, out, mode).await,
        Commands::Chat {
            file,
            message,
            sheet,
            selection,
            out,
            apply,
        } => {
            let client = runtime.llm_client()?;
            commands::assistant::chat(
                &runtime,
                client.as_ref(),
                commands::assistant::ChatArgs {
                    file,
                    message,
                    sheet,
                    selection,
                    out,
                    apply,
                },
            )
            .await
        }
    }
}
