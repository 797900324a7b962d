use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use clap_complete::Shell;
use rootpack_core::{DEFAULT_ARCH, KNOWN_ARCHES};
use rootpack_installer::{install_packages, InstallOptions, RootLayout};
use rootpack_registry::{load_repository_config, RepositoryConfig, RepositoryLocation, RepositorySet};
use tracing::debug;

mod completion;
mod logging;
mod render;

use completion::write_completions_script;
use logging::init_tracing;
use render::{format_install_report, TerminalRenderer};

#[derive(Parser, Debug)]
#[command(name = "rootpack")]
#[command(about = "Installs SquashFS package images into a root filesystem", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install packages and their runtime dependencies
    Install(InstallArgs),
    /// Print a shell completion script
    Completions { shell: Shell },
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Root filesystem to install into
    #[arg(long, default_value = "/")]
    root: PathBuf,
    /// Repository path or URL; replaces the configured repositories
    #[arg(long = "repo", value_name = "PATH_OR_URL")]
    repos: Vec<String>,
    /// Architecture for package names without one
    #[arg(long, value_parser = parse_arch)]
    arch: Option<String>,
    /// Do not ask the filesystem daemon to rescan packages
    #[arg(long)]
    no_daemon: bool,
    /// Cap on concurrent install tasks; unbounded when omitted
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,
    #[arg(required = true, value_name = "PACKAGE")]
    packages: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Install(args) => run_install(args),
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)
        }
    }
}

fn run_install(args: InstallArgs) -> Result<()> {
    let layout = RootLayout::new(&args.root);
    let config_path = layout.repos_config_path();
    let config = load_repository_config(&config_path)?;
    debug!(config = %config_path.display(), repos = config.repos.len(), "loaded repository config");

    let locations = select_repositories(&args.repos, &config)?;
    let repos = RepositorySet::new(locations)?;
    let options = InstallOptions {
        default_arch: select_arch(args.arch.as_deref(), &config),
        jobs: args.jobs,
        notify_daemon: !args.no_daemon,
        ..InstallOptions::default()
    };

    let renderer = TerminalRenderer::current();
    renderer.print_section("install");
    let report = install_packages(&layout, &repos, &args.packages, &options)?;
    renderer.print_lines(&format_install_report(&report, renderer.style()));
    Ok(())
}

fn select_repositories(
    overrides: &[String],
    config: &RepositoryConfig,
) -> Result<Vec<RepositoryLocation>> {
    let locations: Vec<RepositoryLocation> = if overrides.is_empty() {
        config.locations()
    } else {
        overrides
            .iter()
            .map(|location| RepositoryLocation::parse(location))
            .collect()
    };
    if locations.is_empty() {
        return Err(anyhow!("no repositories configured"));
    }
    Ok(locations)
}

fn select_arch(requested: Option<&str>, config: &RepositoryConfig) -> String {
    requested
        .or(config.arch.as_deref())
        .unwrap_or(DEFAULT_ARCH)
        .to_string()
}

fn parse_arch(value: &str) -> Result<String, String> {
    if KNOWN_ARCHES.contains(&value) {
        Ok(value.to_string())
    } else {
        Err(format!(
            "unsupported architecture '{value}' (expected one of: {})",
            KNOWN_ARCHES.join(", ")
        ))
    }
}
