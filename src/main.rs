mod cache;
mod client;
mod codec;
mod config;
mod doctor;
mod launcher;
mod pcat;
mod render;
mod server;
mod source;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pcat",
    version,
    about = "Query-aware file reader backed by a code-pruning server",
    long_about = "Reads a file or stdin, asks a local pruning model which lines matter for a query, and prints only those lines with collapsed elision markers. Results are cached on disk."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (-v, -vv); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a file (or stdin) pruned to the lines relevant to a query
    Read(ReadArgs),

    /// Send one prune request and print the server's pruned code
    Prune(PruneArgs),

    /// Check that model weights and the pruner server are in place
    Doctor {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct InputArgs {
    /// File to read (`-` reads stdin)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Read from stdin
    #[arg(long)]
    stdin: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct CodeArgs {
    /// File to prune
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Code passed inline
    #[arg(long)]
    code: Option<String>,

    /// Read code from stdin
    #[arg(long)]
    stdin: bool,
}

#[derive(Args)]
struct ServerArgs {
    /// Prune endpoint
    #[arg(long, env = "PRUNER_URL")]
    url: Option<String>,

    /// Model directory (must contain model.safetensors for auto-start)
    #[arg(long, env = "SWEPRUNER_MODEL_PATH")]
    model_path: Option<PathBuf>,
}

#[derive(Args)]
struct ReadArgs {
    #[command(flatten)]
    input: InputArgs,

    /// What you are looking for in the code
    #[arg(short, long)]
    query: String,

    /// Source label shown for stdin input
    #[arg(long)]
    label: Option<String>,

    /// Read at most this many bytes (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_bytes: u64,

    #[command(flatten)]
    server: ServerArgs,

    /// Do not try to start a local server when it is down
    #[arg(long)]
    no_auto_start_server: bool,

    /// Log file for an auto-started server
    #[arg(long)]
    server_log: Option<PathBuf>,

    /// Seconds to wait for an auto-started server to become healthy
    #[arg(long)]
    server_start_timeout: Option<f64>,

    /// Seconds to wait for the prune response
    #[arg(long)]
    request_timeout: Option<f64>,

    /// Relevance threshold in [0, 1]
    #[arg(short, long, default_value = "0.5", value_parser = parse_threshold)]
    threshold: f64,

    /// Ask the server to always keep the first fragments
    #[arg(long)]
    always_keep_first_frags: bool,

    /// Token overlap between chunks on the server side
    #[arg(long, default_value = "50")]
    chunk_overlap_tokens: u32,

    /// Lines of context kept around each relevant line
    #[arg(short = 'C', long, default_value = "1")]
    context_lines: usize,

    /// Print lines without the line number column
    #[arg(long)]
    no_line_numbers: bool,

    /// Omit the `# File:` / `# Query:` header
    #[arg(long)]
    no_header: bool,

    /// Print the raw server response instead (never cached)
    #[arg(long)]
    json: bool,

    /// Neither read nor write the result cache
    #[arg(long)]
    no_cache: bool,

    /// Result cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PruneArgs {
    #[command(flatten)]
    input: CodeArgs,

    /// What you are looking for in the code
    #[arg(short, long)]
    query: String,

    #[command(flatten)]
    server: ServerArgs,

    /// Seconds to wait for the prune response
    #[arg(long)]
    request_timeout: Option<f64>,

    /// Relevance threshold in [0, 1]
    #[arg(short, long, default_value = "0.5", value_parser = parse_threshold)]
    threshold: f64,

    /// Ask the server to always keep the first fragments
    #[arg(long)]
    always_keep_first_frags: bool,

    /// Token overlap between chunks on the server side
    #[arg(long, default_value = "50")]
    chunk_overlap_tokens: u32,

    /// Print the full server response instead of `pruned_code`
    #[arg(long)]
    json: bool,
}

fn parse_threshold(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is outside [0, 1]"))
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path =
        config::config_path(std::env::var_os(config::CONFIG_PATH_ENV).map(PathBuf::from));
    let file_config = config::Config::load_from(&config_path)?;

    match cli.command {
        Commands::Read(args) => {
            let overrides = config::Overrides {
                url: args.server.url.clone(),
                model_path: args.server.model_path.clone(),
                server_log: args.server_log.clone(),
                cache_dir: args.cache_dir.clone(),
                no_cache: args.no_cache,
                no_auto_start: args.no_auto_start_server,
                start_timeout_secs: args.server_start_timeout,
                request_timeout_secs: args.request_timeout,
            };
            let settings = config::Settings::resolve(&overrides, &file_config);
            let opts = read_options(args);

            emit(pcat::run(&opts, &settings, &launcher::ProcessLauncher));
        }

        Commands::Prune(args) => {
            let overrides = config::Overrides {
                url: args.server.url.clone(),
                model_path: args.server.model_path.clone(),
                request_timeout_secs: args.request_timeout,
                ..Default::default()
            };
            let settings = config::Settings::resolve(&overrides, &file_config);
            emit(pcat::prune(&prune_options(args), &settings));
        }

        Commands::Doctor { server } => {
            let overrides = config::Overrides {
                url: server.url,
                model_path: server.model_path,
                ..Default::default()
            };
            let settings = config::Settings::resolve(&overrides, &file_config);
            let code = doctor::run(&settings);
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Config => {
            let settings = config::Settings::resolve(&config::Overrides::default(), &file_config);
            config::show_config(&config_path, &settings)?;
        }
    }

    Ok(())
}

/// Print a finished run, or its diagnostic and exit 2.
fn emit(result: Result<pcat::Outcome, pcat::PcatError>) {
    match result {
        Ok(outcome) => {
            print!("{}", outcome.stdout);
            if let Some(tokens) = outcome.tokens {
                eprintln!("{tokens}");
            }
        }
        Err(err) => {
            eprintln!("{}", err.diagnostic().trim_end());
            std::process::exit(2);
        }
    }
}

fn read_options(args: ReadArgs) -> pcat::ReadOptions {
    let source = match args.input.file {
        Some(path) if path.as_os_str() != "-" => {
            pcat::InputSource::File(config::expand_tilde(&path))
        }
        _ => pcat::InputSource::Stdin,
    };
    pcat::ReadOptions {
        source,
        label: args.label,
        query: args.query,
        max_bytes: args.max_bytes,
        threshold: args.threshold,
        context_lines: args.context_lines,
        chunk_overlap_tokens: args.chunk_overlap_tokens,
        always_keep_first_frags: args.always_keep_first_frags,
        line_numbers: !args.no_line_numbers,
        header: !args.no_header,
        json: args.json,
    }
}

fn prune_options(args: PruneArgs) -> pcat::PruneOptions {
    let source = match (args.input.file, args.input.code) {
        (Some(path), _) => pcat::CodeSource::File(config::expand_tilde(&path)),
        (None, Some(code)) => pcat::CodeSource::Inline(code),
        (None, None) => pcat::CodeSource::Stdin,
    };
    pcat::PruneOptions {
        source,
        query: args.query,
        threshold: args.threshold,
        always_keep_first_frags: args.always_keep_first_frags,
        chunk_overlap_tokens: args.chunk_overlap_tokens,
        json: args.json,
    }
}
