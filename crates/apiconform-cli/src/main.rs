//! apiconform CLI - API and webhook conformance testing

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use apiconform_core::{Config, Report, ReportPolicy};
use apiconform_runner::{
    Listener, RunContext, Scheduler, SchemaGenerators, Suite, ValueGenerators,
};

const CONFIG_FILE: &str = ".apiconform.toml";

#[derive(Parser)]
#[command(name = "apiconform")]
#[command(about = "API and webhook conformance testing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "terminal")]
    output: OutputFormat,

    /// Inconclusive results and unmatched inbound requests fail the run
    #[arg(long, global = true)]
    strict: bool,

    /// Verbose logging to stderr (RUST_LOG also works)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite file (YAML, TOML or JSON)
    Run {
        /// Suite file
        suite: PathBuf,

        /// Config file (default: .apiconform.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured base URL
        #[arg(long)]
        base_url: Option<String>,

        /// Override the configured schema directory
        #[arg(long)]
        schemas: Option<PathBuf>,

        /// Serve async callbacks on this address (host:port)
        #[arg(long)]
        listen: Option<String>,

        /// Also write the JSON report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Initialize config file
    Init,

    /// Export JSON Schema of the JSON report
    Schema,
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Terminal,
    Json,
    Silent,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(3)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,apiconform_core=debug,apiconform_runner=debug,apiconform=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            suite,
            config,
            base_url,
            schemas,
            listen,
            report,
        } => {
            let mut cfg = match config {
                Some(path) => Config::load(&path)?,
                None => Config::load_default()?,
            };
            if let Some(url) = base_url {
                cfg.base_url = url;
            }
            if schemas.is_some() {
                cfg.schemas = schemas;
            }
            if listen.is_some() {
                cfg.listener.address = listen;
            }
            let policy = ReportPolicy {
                strict: cli.strict,
                mask_headers: cfg.mask_headers,
            };

            if cli.output != OutputFormat::Silent {
                eprintln!("Config:");
                eprintln!("  base_url:  {}", cfg.base_url);
                eprintln!("  transport: {}", cfg.transport);
                if let Some(dir) = &cfg.schemas {
                    eprintln!("  schemas:   {}", dir.display());
                }
                if !cfg.headers.is_empty() {
                    eprintln!("  headers:   {} configured", cfg.headers.len());
                }
                eprintln!();
            }

            let ctx = Arc::new(RunContext::from_config(cfg)?);
            let listener = match ctx.config().listener.address.clone() {
                Some(address) => Some(Listener::bind(Arc::clone(&ctx), &address)?),
                None => None,
            };
            if let Some(listener) = &listener {
                if cli.output != OutputFormat::Silent {
                    eprintln!("Listening for callbacks on {}", listener.url());
                }
            }
            let generators: Arc<dyn ValueGenerators> =
                Arc::new(SchemaGenerators::new(Arc::clone(ctx.registry())));
            let groups = Suite::load(&suite)?.into_groups(ctx.registry(), &generators)?;
            info!(suite = %suite.display(), groups = groups.len(), "suite loaded");

            let mut scheduler = Scheduler::new();
            for group in groups {
                scheduler.add(group);
            }

            let start = Instant::now();
            let tree = scheduler.run(&ctx)?;
            info!(elapsed_ms = start.elapsed().as_millis(), "run complete");
            if let Some(listener) = listener {
                listener.shutdown();
            }

            let result = Report::new(tree, &policy);

            // Nothing was checked: a broken suite, not a passing server
            if result.summary.total() == 0 {
                eprintln!("Error: {}. Check the suite file.", result.verdict.reason);
                return Ok(3);
            }

            match cli.output {
                OutputFormat::Terminal => println!("{}", result.render_terminal()),
                OutputFormat::Json => println!("{}", result.to_json()?),
                OutputFormat::Silent => {}
            }
            if let Some(path) = report {
                write_report(&result, &path)?;
                if cli.output != OutputFormat::Silent {
                    eprintln!("Report saved: {}", path.display());
                }
            }

            Ok(result.verdict.exit_code)
        }

        Commands::Init => {
            if Path::new(CONFIG_FILE).exists() {
                eprintln!("{CONFIG_FILE} already exists");
                return Ok(1);
            }

            std::fs::write(CONFIG_FILE, Config::example())?;
            println!("Created {CONFIG_FILE}");
            println!("\nEdit the file to configure:");
            println!("  - base_url: server to test");
            println!("  - schemas: directory of named JSON schemas");
            println!("  - headers: auth tokens, API keys");
            println!("  - correlation: webhook wait times");
            println!("  - listener: address for webhook callbacks");
            Ok(0)
        }

        Commands::Schema => {
            println!("{}", apiconform_core::report::generate_schema());
            Ok(0)
        }
    }
}

fn write_report(report: &Report, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(path, report.to_json()?)
        .with_context(|| format!("cannot write {}", path.display()))
}
