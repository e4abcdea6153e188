use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use confed::editor::Editor;
use confed::watch::DirWatcher;

/// Root path the service is rooted under for virtual/physical path mapping.
#[derive(Parser)]
#[command(name = "confed-cli", version, about = "Configuration editor service")]
struct Cli {
    /// Filesystem root that virtual config/schema paths are resolved against.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Directories to scan (and watch) for `*.schema.json` files.
    #[arg(long = "schema-dir", value_name = "DIR")]
    schema_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a single config file against its registered schema and exit.
    Validate {
        /// Virtual config path (as registered by a schema's configFile.path).
        path: String,
    },
    /// Print a schema's preprocessed, validator-ready form and exit.
    Dump {
        /// Virtual schema or config path.
        path: String,
    },
}

fn main() -> ExitCode {
    let filter = match tracing_subscriber::EnvFilter::try_from_env("CONFED_LOG") {
        Ok(f) => f,
        Err(_) => tracing_subscriber::EnvFilter::new("info"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "confed-cli failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let editor = Editor::new(&cli.root)?;

    let schema_pattern = regex::Regex::new(r"^.*\.schema\.json$")?;
    let mut watchers = Vec::new();
    for dir in &cli.schema_dirs {
        let mut watcher = DirWatcher::new(schema_pattern.clone(), editor.watcher_client());
        watcher.load(dir)?;
        watchers.push(watcher);
    }

    match cli.command {
        Some(Commands::Validate { path }) => {
            let response = editor.load(&path).map_err(|e| anyhow::anyhow!("{}: {}", e.code(), e))?;
            println!("{}", serde_json::to_string_pretty(&response.content)?);
        }
        Some(Commands::Dump { path }) => {
            let response = editor.load(&path).map_err(|e| anyhow::anyhow!("{}: {}", e.code(), e))?;
            println!("{}", serde_json::to_string_pretty(&response.schema)?);
        }
        None => {
            tracing::info!(root = %cli.root.display(), schemas = cli.schema_dirs.len(), "confed ready (no RPC transport wired up by this binary)");
        }
    }

    for mut watcher in watchers {
        watcher.stop();
    }
    Ok(())
}
