use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CACHE_CAPACITY: usize = 8;
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_CONTEXT_CELLS: usize = 400;
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;

/// Connection and loop settings for the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantSettings {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub max_tool_rounds: u32,
    pub temperature: Option<f32>,
    pub max_context_cells: usize,
    pub request_timeout_ms: Option<u64>,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            temperature: None,
            max_context_cells: DEFAULT_MAX_CONTEXT_CELLS,
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl AssistantSettings {
    pub fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root for CLI input and output paths.
    pub workspace_root: PathBuf,
    pub http_bind_address: SocketAddr,
    pub cache_capacity: usize,
    pub max_upload_bytes: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub assistant: AssistantSettings,
}

impl ServerConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let CliArgs {
            config,
            workspace_root: cli_workspace_root,
            http_bind: cli_http_bind,
            cache_capacity: cli_cache_capacity,
            max_upload_bytes: cli_max_upload_bytes,
            request_timeout_ms: cli_request_timeout_ms,
            max_context_cells: cli_max_context_cells,
            api_base: cli_api_base,
            api_key: cli_api_key,
            model: cli_model,
            max_tokens: cli_max_tokens,
            max_tool_rounds: cli_max_tool_rounds,
            temperature: cli_temperature,
        } = args;

        let file_config = if let Some(path) = config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            workspace_root: file_workspace_root,
            http_bind: file_http_bind,
            cache_capacity: file_cache_capacity,
            max_upload_bytes: file_max_upload_bytes,
            request_timeout_ms: file_request_timeout_ms,
            max_context_cells: file_max_context_cells,
            assistant: file_assistant,
        } = file_config;
        let PartialAssistant {
            api_base: file_api_base,
            api_key: file_api_key,
            model: file_model,
            max_tokens: file_max_tokens,
            max_tool_rounds: file_max_tool_rounds,
            temperature: file_temperature,
        } = file_assistant.unwrap_or_default();

        let workspace_root = cli_workspace_root
            .or(file_workspace_root)
            .unwrap_or_else(|| PathBuf::from("."));

        let http_bind_address = cli_http_bind.or(file_http_bind).unwrap_or_else(|| {
            DEFAULT_HTTP_BIND
                .parse()
                .expect("default bind address valid")
        });

        let cache_capacity = cli_cache_capacity
            .or(file_cache_capacity)
            .unwrap_or(DEFAULT_CACHE_CAPACITY)
            .max(1);

        let max_upload_bytes = cli_max_upload_bytes
            .or(file_max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let max_upload_bytes = if max_upload_bytes == 0 {
            None
        } else {
            Some(max_upload_bytes)
        };

        let request_timeout_ms = cli_request_timeout_ms
            .or(file_request_timeout_ms)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let request_timeout_ms = if request_timeout_ms == 0 {
            None
        } else {
            Some(request_timeout_ms)
        };

        let max_tool_rounds = cli_max_tool_rounds
            .or(file_max_tool_rounds)
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS);
        anyhow::ensure!(max_tool_rounds >= 1, "max_tool_rounds must be at least 1");

        let temperature = cli_temperature.or(file_temperature);
        if let Some(t) = temperature {
            anyhow::ensure!((0.0..=1.0).contains(&t), "temperature must be within 0..=1");
        }

        let assistant = AssistantSettings {
            api_base: cli_api_base
                .or(file_api_base)
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: cli_api_key.or(file_api_key).filter(|k| !k.trim().is_empty()),
            model: cli_model
                .or(file_model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: cli_max_tokens
                .or(file_max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS)
                .max(1),
            max_tool_rounds,
            temperature,
            max_context_cells: cli_max_context_cells
                .or(file_max_context_cells)
                .unwrap_or(DEFAULT_MAX_CONTEXT_CELLS),
            request_timeout_ms,
        };

        Ok(Self {
            workspace_root,
            http_bind_address,
            cache_capacity,
            max_upload_bytes,
            request_timeout_ms,
            assistant,
        })
    }

    pub fn ensure_workspace_root(&self) -> Result<()> {
        anyhow::ensure!(
            self.workspace_root.exists(),
            "workspace root {:?} does not exist",
            self.workspace_root
        );
        anyhow::ensure!(
            self.workspace_root.is_dir(),
            "workspace root {:?} is not a directory",
            self.workspace_root
        );
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.workspace_root.join(relative)
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_upload_bytes(&self) -> Option<usize> {
        self.max_upload_bytes.map(|bytes| bytes as usize)
    }
}

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "sheetpilot", about = "Spreadsheet editor with an AI assistant", version)]
pub struct CliArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)",
        global = true
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEETPILOT_WORKSPACE",
        value_name = "DIR",
        help = "Directory that CLI input and output paths must stay within"
    )]
    pub workspace_root: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEETPILOT_HTTP_BIND",
        value_name = "ADDR",
        help = "HTTP bind address"
    )]
    pub http_bind: Option<SocketAddr>,

    #[arg(
        long,
        env = "SHEETPILOT_CACHE_CAPACITY",
        value_name = "N",
        help = "Maximum number of workbook sessions kept in memory",
        value_parser = clap::value_parser!(usize)
    )]
    pub cache_capacity: Option<usize>,

    #[arg(
        long,
        env = "SHEETPILOT_MAX_UPLOAD_BYTES",
        value_name = "BYTES",
        help = "Largest accepted upload (default: 26214400; 0 disables)",
        value_parser = clap::value_parser!(u64)
    )]
    pub max_upload_bytes: Option<u64>,

    #[arg(
        long,
        env = "SHEETPILOT_REQUEST_TIMEOUT_MS",
        value_name = "MS",
        help = "Request timeout in milliseconds (default: 120000; 0 disables)",
        value_parser = clap::value_parser!(u64)
    )]
    pub request_timeout_ms: Option<u64>,

    #[arg(
        long,
        env = "SHEETPILOT_MAX_CONTEXT_CELLS",
        value_name = "N",
        help = "Cells of the active sheet included in assistant context (default: 400)",
        value_parser = clap::value_parser!(usize)
    )]
    pub max_context_cells: Option<usize>,

    #[arg(
        long,
        env = "SHEETPILOT_API_BASE",
        value_name = "URL",
        help = "Base URL of the Messages API"
    )]
    pub api_base: Option<String>,

    #[arg(
        long,
        env = "SHEETPILOT_API_KEY",
        value_name = "KEY",
        hide_env_values = true,
        help = "API key; the assistant is disabled without one"
    )]
    pub api_key: Option<String>,

    #[arg(long, env = "SHEETPILOT_MODEL", value_name = "MODEL", help = "Model name")]
    pub model: Option<String>,

    #[arg(
        long,
        env = "SHEETPILOT_MAX_TOKENS",
        value_name = "N",
        help = "Max tokens per model response",
        value_parser = clap::value_parser!(u32)
    )]
    pub max_tokens: Option<u32>,

    #[arg(
        long,
        env = "SHEETPILOT_MAX_TOOL_ROUNDS",
        value_name = "N",
        help = "Max model round trips per chat request (default: 8)",
        value_parser = clap::value_parser!(u32)
    )]
    pub max_tool_rounds: Option<u32>,

    #[arg(
        long,
        env = "SHEETPILOT_TEMPERATURE",
        value_name = "T",
        help = "Sampling temperature between 0 and 1"
    )]
    pub temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    workspace_root: Option<PathBuf>,
    http_bind: Option<SocketAddr>,
    cache_capacity: Option<usize>,
    max_upload_bytes: Option<u64>,
    request_timeout_ms: Option<u64>,
    max_context_cells: Option<usize>,
    assistant: Option<PartialAssistant>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAssistant {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    max_tool_rounds: Option<u32>,
    temperature: Option<f32>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}
