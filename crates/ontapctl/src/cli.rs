//! Clap derive structures for the `ontapctl` CLI.
//!
//! Also compiled by `build.rs` for man pages, so nothing here may depend
//! on anything beyond clap and clap_complete.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// ontapctl -- declarative reconciliation for NetApp ONTAP clusters
#[derive(Debug, Parser)]
#[command(
    name = "ontapctl",
    version,
    about = "Reconcile NetApp ONTAP objects to a declared state",
    long_about = "Reads a task (resource kind + parameters), compares it with the\n\
        cluster's current state over REST or ZAPI, and issues only the calls\n\
        needed to converge. Run with --check to see the plan without changing anything.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Cluster profile to use
    #[arg(long, short = 'p', env = "ONTAP_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Cluster management hostname (overrides profile)
    #[arg(long, short = 'H', env = "ONTAP_HOSTNAME", global = true)]
    pub hostname: Option<String>,

    /// Username (overrides profile)
    #[arg(long, short = 'u', env = "ONTAP_USERNAME", global = true)]
    pub username: Option<String>,

    /// Management interface preference
    #[arg(long, env = "ONTAP_USE_REST", global = true)]
    pub use_rest: Option<UseRestArg>,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "ONTAP_INSECURE", global = true)]
    pub insecure: bool,

    /// HTTP request timeout in seconds
    #[arg(long, env = "ONTAP_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', env = "ONTAP_OUTPUT", default_value = "json", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Log line format on stderr
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Value Enums ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON (default)
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Human-readable summary and tables
    Table,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UseRestArg {
    /// REST only; fail when an attribute needs ZAPI
    Always,
    /// REST when every requested attribute allows it
    Auto,
    /// ZAPI only
    Never,
}

impl UseRestArg {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Auto => "auto",
            Self::Never => "never",
        }
    }
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reconcile one object from a task file
    Apply(ApplyArgs),

    /// List resource handlers or show one handler's attributes
    #[command(alias = "res")]
    Resources(ResourcesArgs),

    /// Inspect configuration and store credentials
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Apply ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Resource kind (e.g. volume, snapmirror_policy); may come from the task file
    pub resource: Option<String>,

    /// Task file (YAML or JSON); `-` reads stdin
    #[arg(long, short = 'f')]
    pub file: PathBuf,

    /// Report the plan without changing anything
    #[arg(long)]
    pub check: bool,
}

// ── Resources ────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ResourcesArgs {
    /// Show the attribute table for this resource
    pub resource: Option<String>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration (secrets masked)
    Show,

    /// Store the active profile's password in the system keyring
    SetPassword,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
