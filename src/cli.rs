//! Command-line surface: a `serve` subcommand that starts the HTTP server
//! and a `run` subcommand that generates once from a prompt (arguments or
//! piped stdin) and writes the result to stdout, per spec §6 "CLI surface".

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ServerConfig;
use crate::core::tool_parsers::ToolCallParserKind;

#[derive(Parser, Debug)]
#[command(
    name = "synap-forge-serve",
    version,
    about = "Local, OpenAI-compatible inference server and CLI for on-device language models"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server.
    Serve(ServeArgs),
    /// Generate once from a prompt and print the result; no HTTP server.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Hugging Face model repo id.
    #[arg(long, default_value = "meta-llama/Llama-3.2-3B-Instruct")]
    pub model_id: String,

    /// Model repo revision (branch, tag, or commit).
    #[arg(long, default_value = "main")]
    pub model_revision: String,

    /// System prompt injected when a request has no system/developer message.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Tool-call wire syntax to parse from generated text.
    #[arg(long, value_enum, default_value = "json")]
    pub tool_call_parser: ToolCallParserKind,

    /// Disable `<think>...</think>` extraction; emit all text as visible content.
    #[arg(long, default_value_t = false)]
    pub raw_mode: bool,

    /// Best-effort repair of malformed tool-call JSON before giving up on it.
    #[arg(long, default_value_t = false)]
    pub fix_tool_args: bool,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP listener to.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Disable prefix-cache reuse across requests sharing a prompt prefix.
    #[arg(long, default_value_t = false)]
    pub disable_prefix_caching: bool,

    /// Maximum number of requests allowed to queue for the generation slot
    /// before the server returns `queue_full`.
    #[arg(long, default_value_t = 64)]
    pub max_queue_depth: usize,

    /// Number of concurrent generation slots (requires a reentrant runtime
    /// to safely exceed 1; defaults to the single-slot model of §5).
    #[arg(long, default_value_t = 1)]
    pub generation_slots: usize,

    /// Maximum number of prefix-cache entries retained at once.
    #[arg(long, default_value_t = 32)]
    pub max_cache_entries: usize,

    /// Maximum total tokens of KV state retained across all cached prefixes.
    #[arg(long, default_value_t = 131_072)]
    pub max_retained_cache_tokens: usize,

    /// Per-request wall-clock timeout, in seconds.
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Allowed CORS origins; repeat the flag for multiple origins.
    #[arg(long = "cors-allow-origin", default_value = "*")]
    pub cors_allow_origins: Vec<String>,

    /// Default stop sequence applied to every request unless overridden;
    /// repeat the flag for multiple sequences.
    #[arg(long = "default-stop")]
    pub default_stop: Vec<String>,

    /// Requests allowed per minute before `rate_limited`/429 is returned.
    /// Unset (the default) disables rate limiting entirely.
    #[arg(long)]
    pub rate_limit_per_minute: Option<u32>,
}

impl ServeArgs {
    pub fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            model_id: self.model.model_id,
            model_revision: self.model.model_revision,
            system_prompt: self.model.system_prompt,
            default_stop: self.default_stop,
            tool_call_parser: self.model.tool_call_parser,
            raw_mode: self.model.raw_mode,
            enable_prefix_caching: !self.disable_prefix_caching,
            max_queue_depth: self.max_queue_depth,
            request_timeout: std::time::Duration::from_secs(self.request_timeout_secs),
            cors_allow_origins: self.cors_allow_origins,
            fix_tool_args: self.model.fix_tool_args,
            rate_limit_per_minute: self.rate_limit_per_minute,
            generation_slots: self.generation_slots,
            max_retained_cache_tokens: self.max_retained_cache_tokens,
            max_cache_entries: self.max_cache_entries,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Prompt text. If omitted, `--stdin` must be set.
    pub prompt: Option<String>,

    /// Read the prompt from standard input instead of the positional argument.
    #[arg(long, default_value_t = false)]
    pub stdin: bool,

    /// Stream tokens to stdout as they're generated instead of printing once
    /// at the end.
    #[arg(long, default_value_t = false)]
    pub stream: bool,

    #[arg(long, default_value_t = 256)]
    pub max_tokens: usize,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    #[arg(long, default_value_t = 1.0)]
    pub top_p: f64,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl RunArgs {
    /// A `ServerConfig` sized for a single in-process generation rather than
    /// a listening server; host/port/queueing knobs are irrelevant here.
    pub fn into_server_config(&self) -> ServerConfig {
        ServerConfig {
            model_id: self.model.model_id.clone(),
            model_revision: self.model.model_revision.clone(),
            system_prompt: self.model.system_prompt.clone(),
            tool_call_parser: self.model.tool_call_parser,
            raw_mode: self.model.raw_mode,
            fix_tool_args: self.model.fix_tool_args,
            enable_prefix_caching: false,
            generation_slots: 1,
            max_queue_depth: 1,
            max_cache_entries: 1,
            max_retained_cache_tokens: 0,
            ..ServerConfig::default()
        }
    }
}

/// Directory override for downloaded model artifacts (spec §6 "model-cache
/// directory path variable"); read directly by `core::load_model`, exposed
/// here only so `main` can log which one is in effect.
pub fn cache_dir_override() -> Option<PathBuf> {
    std::env::var_os("SYNAP_FORGE_CACHE_DIR").map(PathBuf::from)
}
