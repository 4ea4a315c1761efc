use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;

mod command;
mod progress_bar;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "context")]
#[command(about = "Incremental context indexing and file retrieval for AI agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for results)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the shadow tree and the vector store up to date
    Index(IndexArgs),

    /// Ask which project files are relevant to a task
    Find(FindArgs),

    /// Index once, then reindex changed files until interrupted
    Watch(WatchArgs),

    /// Show what has been indexed so far
    Status(StatusArgs),
}

#[derive(Args)]
pub(crate) struct RunOptions {
    /// Skip context augmentation and index the raw sources
    #[arg(long)]
    pub no_context: bool,

    /// Parallel augmentation requests (1..=32)
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args)]
pub(crate) struct IndexArgs {
    #[command(flatten)]
    pub options: RunOptions,

    /// Only index these files or directories
    pub paths: Vec<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub(crate) struct FindArgs {
    /// Task description, e.g. "add retry to the payment client"
    pub task: String,

    /// Query the store built without context augmentation
    #[arg(long)]
    pub no_context: bool,

    /// Print the result as a JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub(crate) struct WatchArgs {
    #[command(flatten)]
    pub options: RunOptions,
}

#[derive(Args)]
pub(crate) struct StatusArgs {
    /// Inspect the store built without context augmentation
    #[arg(long)]
    pub no_context: bool,

    #[arg(long)]
    pub json: bool,
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // Keep stdout clean for JSON consumers.
    let json_output = match &cli.command {
        Commands::Index(args) => args.json,
        Commands::Find(args) => args.json,
        Commands::Status(args) => args.json,
        Commands::Watch(_) => false,
    };
    if json_output {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    // reqwest/hyper connection chatter is only useful when debugging
    if !cli.verbose {
        builder.filter_module("reqwest", log::LevelFilter::Warn);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Index(args) => command::index(&cli.root, args, cli.quiet).await,
        Commands::Find(args) => command::find(&cli.root, args).await,
        Commands::Watch(args) => command::watch(&cli.root, args, cli.quiet).await,
        Commands::Status(args) => command::status(&cli.root, args).await,
    }
}
