//! CLI argument definitions for memscope

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Largest region a process-wide scan copies by default.
pub const DEFAULT_MAX_REGION_SIZE: usize = 256 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "memscope")]
#[command(about = "Inspect, patch and signature-scan the memory of running processes", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub target: Target,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which process to attach to. Defaults to memscope itself.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Process id to attach to
    #[arg(short, long, env = "MEMSCOPE_PID", conflicts_with = "name", global = true)]
    pub pid: Option<u32>,

    /// Attach to the first process whose name contains this string
    #[arg(short, long, env = "MEMSCOPE_PROCESS", global = true)]
    pub name: Option<String>,

    /// Keep polling until a process matching --name appears
    #[arg(short, long, requires = "name", global = true)]
    pub wait: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show pid, executable and module count of the target
    Info,

    /// Describe the page range containing an address
    Query {
        /// Address (hex with 0x prefix, or decimal)
        address: String,
    },

    /// Walk the target's address space
    Regions {
        /// Only list committed regions
        #[arg(short, long)]
        committed: bool,
    },

    /// List loaded modules
    Modules,

    /// Read memory as a hex dump or a typed value
    Read {
        /// Address to read from
        address: String,

        /// Number of bytes to dump
        #[arg(short, long, default_value = "64", conflicts_with = "kind")]
        len: usize,

        /// Decode a single value (u8, i32, f32, ptr, ...)
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Write hex bytes, or a typed value with --kind
    Write {
        /// Address to write to
        address: String,

        /// Space-separated hex bytes, or the value when --kind is given
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        data: Vec<String>,

        /// Encode the value as this type instead of raw bytes
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Change page protection and print the previous one
    Protect {
        /// Start address
        address: String,

        /// Length in bytes
        len: usize,

        /// New protection: rwx-style (e.g. "r-x") or a raw value (e.g. 0x40)
        protection: String,
    },

    /// Find the first match of a wildcard byte pattern (e.g. "48 8B ?? ?? 89")
    Scan {
        /// Pattern of hex bytes and ?/?? wildcards
        pattern: String,

        /// Only scan this module
        #[arg(short, long)]
        module: Option<String>,

        /// Skip regions larger than this many bytes when scanning the whole process (0 for no limit)
        #[arg(long, default_value_t = DEFAULT_MAX_REGION_SIZE)]
        max_region_size: usize,
    },

    /// Resolve a pointer chain: dereference, then add each offset
    Chain {
        /// Base address
        base: String,

        /// Offsets (hex or decimal, may be negative)
        #[arg(allow_hyphen_values = true)]
        offsets: Vec<String>,
    },
}
