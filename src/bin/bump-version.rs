//! Release tool: bumps the version and rewrites every file that carries it.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::Parser;
use console::style;

use detailer_pwa::release::{ReleaseDraft, ReleaseTargets, collect_draft, plan_release};
use detailer_pwa::{AppConfig, BumpKind, format_bytes, release_summary};

#[derive(Parser, Debug)]
#[command(name = "bump-version")]
#[command(about = "Bump the app version, record release notes and retag the worker cache")]
#[command(version)]
struct Args {
    /// major, minor or patch
    #[arg(default_value = "patch")]
    kind: BumpKind,

    /// Skip note collection and use a placeholder release entry
    #[arg(long)]
    auto: bool,

    /// Print what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Project root the configured release paths are relative to
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (default: <config dir>/detailer-pwa/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> detailer_pwa::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_create(&AppConfig::default_path())?,
    };
    let targets = ReleaseTargets::from_config(&args.root, &config.release, &config.cache.prefix);

    let draft = if args.auto || !io::stdin().is_terminal() {
        ReleaseDraft::placeholder()
    } else {
        println!("{} {} release", style("Preparing").bold(), args.kind);
        collect_draft(io::stdin().lock(), io::stdout().lock())?
    };

    let today = chrono::Local::now().date_naive();
    let plan = plan_release(&targets, args.kind, draft, today)?;

    println!(
        "{} {} -> {}",
        style("Version").bold(),
        plan.previous,
        style(plan.version()).green().bold()
    );
    print!("{}", release_summary(&plan.entry));
    for warning in &plan.warnings {
        println!("{} {warning}", style("warning:").yellow().bold());
    }

    if args.dry_run {
        for change in &plan.changes {
            println!(
                "{} {} ({}, {})",
                style("would write").cyan(),
                change.path.display(),
                change.label,
                format_bytes(change.contents.len() as u64)
            );
        }
        return Ok(());
    }

    let applied = plan.apply()?;
    for (label, path) in &applied.written {
        println!("{} {label}: {}", style("✓").green(), path.display());
    }
    println!(
        "{} {} ({})",
        style("Released").green().bold(),
        applied.version,
        plan.generation
    );
    Ok(())
}
