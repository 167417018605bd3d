use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::compress::Codec;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log debug details to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Encrypt files, compressing them first unless --no-compress is given.
    #[command(alias = "e")]
    Encrypt {
        #[command(flatten)]
        common: CommonArgs,

        /// Skip the compression stage.
        #[arg(long)]
        no_compress: bool,

        /// Compression codec used before encryption.
        #[arg(long, value_enum)]
        codec: Option<CodecArg>,

        /// Codec level: zstd 1-22, xz preset 0-9.
        #[arg(long)]
        level: Option<i32>,

        /// AES key size in bits (128 or 256).
        #[arg(long)]
        key_size: Option<u32>,
    },

    /// Decrypt `.enc` files, decompressing them when the name says so.
    #[command(alias = "d")]
    Decrypt {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Encrypt { common, .. } | Commands::Decrypt { common } => common,
        }
    }
}

/// Options shared by both directions.
#[derive(ClapArgs, Clone, Debug)]
pub struct CommonArgs {
    /// Files or directories to process. Directories are walked recursively.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory for the outputs. Defaults to each input's own directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON settings file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of parallel jobs. [0 = one per CPU core]
    #[arg(long)]
    pub workers: Option<usize>,

    /// Keep intermediate files (e.g. the `.zst` next to the `.enc`).
    #[arg(long)]
    pub keep_intermediate: bool,

    /// Passphrase. If not provided, read from BLITZSEAL_PASSWORD or prompted interactively.
    #[arg(long)]
    pub password: Option<String>,

    /// Print per-file progress to stderr.
    #[arg(long)]
    pub progress: bool,
}

/// Command line codec names.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecArg {
    Zstd,
    Xz,
}

impl CodecArg {
    pub fn to_codec(self, level: Option<i32>) -> Codec {
        let name = match self {
            CodecArg::Zstd => "zstd",
            CodecArg::Xz => "xz",
        };
        Codec::from_name(name, level).unwrap_or_default()
    }
}

pub const PASSWORD_ENV: &str = "BLITZSEAL_PASSWORD";

/// Gets the password from the command-line option or the `BLITZSEAL_PASSWORD` environment variable.
///
/// Priority:
/// 1. `--password` command-line argument.
/// 2. `BLITZSEAL_PASSWORD` environment variable.
/// 3. Returns `None` if neither is present, allowing the caller to prompt interactively.
pub fn get_password_from_opt_or_env(password_opt: Option<String>) -> Option<String> {
    if let Some(pass) = password_opt {
        return Some(pass);
    }
    std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty())
}

/// Resolves the password, falling back to an interactive prompt.
pub fn resolve_password(password_opt: Option<String>) -> std::io::Result<String> {
    match get_password_from_opt_or_env(password_opt) {
        Some(pass) => Ok(pass),
        None => rpassword::prompt_password("Password: "),
    }
}
