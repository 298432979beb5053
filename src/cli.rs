use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "patchup")]
#[command(
    about = "An interactive terminal pair-programmer that proposes and applies LLM edits to your git working tree"
)]
#[command(version, long_about = None)]
pub struct Cli {
    /// Files, directories, or globs to include in context (path[:ranges])
    pub paths: Vec<String>,

    /// Files, directories, or globs to exclude from included directories
    #[arg(short, long)]
    pub exclude: Vec<String>,

    /// Extra ignore globs for auto-context enumeration
    #[arg(short = 'g', long)]
    pub ignore: Vec<String>,

    /// Tree-ish to diff active changes against
    #[arg(short, long)]
    pub diff: Option<String>,

    /// Tree-ish whose common ancestor with HEAD is the diff base
    #[arg(short, long)]
    pub pr_diff: Option<String>,

    /// Working directory (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Chat model
    #[arg(long)]
    pub model: Option<String>,

    /// Total prompt token budget
    #[arg(long)]
    pub prompt_tokens: Option<usize>,

    /// Enable auto-context selection
    #[arg(long)]
    pub auto_context: bool,

    /// Token budget for auto-selected features
    #[arg(long)]
    pub auto_tokens: Option<usize>,

    /// Disable embedding-similarity ranking
    #[arg(long)]
    pub no_embeddings: bool,

    /// Edit stream format the model is asked to use
    #[arg(long, value_parser = ["block", "git-diff"])]
    pub format: Option<String>,

    /// Maximum file size (bytes) considered for auto-context
    #[arg(long)]
    pub max_file_chars: Option<usize>,

    /// Start with agent mode enabled
    #[arg(long)]
    pub agent: bool,

    /// Write a default patchup.toml to the working directory and exit
    #[arg(long)]
    pub init_config: bool,
}
