use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use toml::Value;
use toml::value::Table;
use tracing_subscriber::EnvFilter;

use alpine_image_builder::config::{BuildConfig, ConfigDoc};
use alpine_image_builder::error::ErrorKind;
use alpine_image_builder::executor::{ExecCtx, StdoutSink};
use alpine_image_builder::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about = "Build an Alpine Linux root filesystem image")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision, customize and package an image
    Build {
        #[command(flatten)]
        build: BuildArgs,
        /// Print what each stage would do without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the ordered stage list
    Plan {
        #[command(flatten)]
        build: BuildArgs,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the fully-resolved TOML (after extends/imports and flags)
    Resolve {
        #[command(flatten)]
        build: BuildArgs,
    },
}

/// Flags override the matching `[build]` keys of the config file.
#[derive(Debug, clap::Args)]
struct BuildArgs {
    /// Build definition TOML
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Alpine release, e.g. 3.2
    #[arg(short = 'r', long)]
    release: Option<String>,
    /// apk-tools-static package version, e.g. 2.6.5-r1
    #[arg(short = 'a', long)]
    apk_tools: Option<String>,
    /// Target directory the root filesystem is built in
    #[arg(short = 'd', long)]
    install_dir: Option<String>,
    /// Package mirror base URL
    #[arg(short = 'm', long)]
    mirror: Option<String>,
    /// Image file name prefix
    #[arg(short = 'i', long)]
    image: Option<String>,
    /// Display name written to motd and product
    #[arg(short = 'n', long)]
    name: Option<String>,
    #[arg(short = 'D', long)]
    description: Option<String>,
    /// Documentation URL
    #[arg(short = 'u', long)]
    docs: Option<String>,
    /// Guest tooling installer, run with the target directory as argument
    #[arg(long)]
    guest_tools: Option<String>,
    /// Where the archive is written (default: current directory)
    #[arg(long)]
    output_dir: Option<String>,
}

impl BuildArgs {
    fn overlay(&self) -> Value {
        let mut build = Table::new();
        for (key, v) in [
            ("release", &self.release),
            ("apk_tools", &self.apk_tools),
            ("install_dir", &self.install_dir),
            ("mirror", &self.mirror),
            ("image", &self.image),
            ("name", &self.name),
            ("description", &self.description),
            ("docs", &self.docs),
        ] {
            if let Some(v) = v {
                build.insert(key.into(), Value::String(v.clone()));
            }
        }

        let mut root = Table::new();
        root.insert("build".into(), Value::Table(build));
        if let Some(installer) = &self.guest_tools {
            let mut guest = Table::new();
            guest.insert("installer".into(), Value::String(installer.clone()));
            root.insert("guest".into(), Value::Table(guest));
        }
        if let Some(out) = &self.output_dir {
            let mut ws = Table::new();
            ws.insert("out_dir".into(), Value::String(out.clone()));
            root.insert("workspace".into(), Value::Table(ws));
        }
        Value::Table(root)
    }

    fn load(&self) -> Result<ConfigDoc> {
        let mut doc = match &self.config {
            Some(path) => alpine_image_builder::config::load(path)?,
            None => ConfigDoc::empty(),
        };
        doc.merge_overlay(self.overlay());
        Ok(doc)
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if e.kind() == ErrorKind::Config {
                let mut cmd = Args::command();
                if let Some(build) = cmd.find_subcommand_mut("build") {
                    eprintln!("{}", build.render_usage());
                }
                eprintln!("Run 'alpine-image build --help' for all options.");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Args) -> Result<()> {
    match args.cmd {
        Command::Build { build, dry_run } => cmd_build(&build.load()?, dry_run),
        Command::Plan { build, dot } => cmd_plan(&build.load()?, dot),
        Command::Resolve { build } => cmd_resolve(&build.load()?),
    }
}

fn cmd_plan(doc: &ConfigDoc, dot: bool) -> Result<()> {
    let plan = alpine_image_builder::modules::build_plan(doc)?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        let requires = if task.requires.is_empty() {
            String::new()
        } else {
            format!("  [{}]", task.requires.join(", "))
        };
        println!(
            "{:>2}. {:<24}  {:<10} {:<10}  {}{requires}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(doc: &ConfigDoc) -> Result<()> {
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_build(doc: &ConfigDoc, dry_run: bool) -> Result<()> {
    // Nothing is touched before the inputs check out.
    let build = BuildConfig::load(doc)?;
    let plan = alpine_image_builder::modules::build_plan(doc)?;
    let reg = alpine_image_builder::executor::builtin_registry()?;

    let ws: alpine_image_builder::workspace::WorkspaceConfig =
        doc.deserialize_path("workspace")?.unwrap_or_default();
    let logs = alpine_image_builder::workspace::load_paths(&ws)?.error_logs_dir();
    let sink = Arc::new(StdoutSink::with_error_logs(logs));
    let mut ctx = ExecCtx::new(dry_run, sink);

    tracing::info!(
        release = %build.release,
        root = %build.root().display(),
        dry_run,
        "starting image build"
    );
    alpine_image_builder::executor::execute_plan(doc, &plan, &reg, &mut ctx)
}
