use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use muxherd::backend::BackendKind;
use muxherd::config::MuxConfig;
use muxherd::generator::LayoutGenerator;
use muxherd::layout::SessionLayouts;
use muxherd::manager::{full_session_name, Manager};
use muxherd::logging;

const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;

#[derive(Parser)]
#[command(
    name = "muxherd",
    version,
    about = "Terminal multiplexer session manager for zellij and Windows Terminal"
)]
struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Multiplexer backend (zellij, windows-terminal)
    #[arg(long, global = true, env = "MUXHERD_BACKEND", default_value = "zellij")]
    backend: BackendKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the layout each session would be launched from
    Preview {
        /// JSON file mapping session name to {tab: [cwd, command]}
        layouts: PathBuf,
        /// Prefix joined to every session name with '_'
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Generate layouts, start every session and save the manager
    Up {
        /// JSON file mapping session name to {tab: [cwd, command]}
        layouts: PathBuf,
        #[arg(long, default_value = "")]
        prefix: String,
        /// Run the sessions on this ssh host instead of locally
        #[arg(long)]
        host: Option<String>,
        /// Save under this id instead of a fresh one
        #[arg(long)]
        id: Option<String>,
    },
    /// Show session and command status for a saved manager
    Status {
        /// Saved manager id
        id: String,
        /// Emit the status records as JSON
        #[arg(long)]
        json: bool,
        /// One line per session: presence and tabs only
        #[arg(long, conflicts_with = "json")]
        brief: bool,
    },
    /// Kill every session of a saved manager
    Kill {
        /// Saved manager id
        id: String,
        /// Also delete the saved state
        #[arg(long)]
        forget: bool,
    },
    /// Print the command that attaches to a session
    Attach {
        /// Saved manager id
        id: String,
        /// Session name, with or without the prefix; all sessions when omitted
        session: Option<String>,
    },
    /// List saved manager ids
    Saved,
    /// Delete a saved manager
    Forget {
        /// Saved manager id
        id: String,
    },
    /// Report status periodically until Ctrl-C or until nothing runs
    Monitor {
        /// Saved manager id
        id: String,
        /// Seconds between cycles
        #[arg(long, default_value_t = DEFAULT_MONITOR_INTERVAL_SECS)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::level_for_verbosity(cli.verbose));

    let config = MuxConfig::from_env(cli.backend);

    match cli.command {
        Commands::Preview { layouts, prefix } => cmd_preview(cli.backend, &config, &layouts, &prefix).await,
        Commands::Up {
            layouts,
            prefix,
            host,
            id,
        } => cmd_up(cli.backend, config, &layouts, &prefix, host.as_deref(), id.as_deref()).await,
        Commands::Status { id, json, brief } => cmd_status(config, &id, json, brief).await,
        Commands::Kill { id, forget } => cmd_kill(config, &id, forget).await,
        Commands::Attach { id, session } => cmd_attach(config, &id, session.as_deref()).await,
        Commands::Saved => cmd_saved(&config).await,
        Commands::Forget { id } => cmd_forget(&config, &id).await,
        Commands::Monitor { id, interval } => cmd_monitor(config, &id, interval).await,
    }
}

async fn read_layouts(path: &Path) -> Result<SessionLayouts> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read layouts file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid layouts file {}", path.display()))
}

async fn load_manager(config: MuxConfig, id: &str) -> Result<Manager> {
    Manager::load(id, config)
        .await
        .with_context(|| format!("Failed to load saved manager '{id}'"))
}

async fn cmd_preview(backend: BackendKind, config: &MuxConfig, path: &Path, prefix: &str) -> Result<()> {
    let layouts = read_layouts(path).await?;
    if layouts.is_empty() {
        anyhow::bail!("No sessions in {}", path.display());
    }
    let generator = LayoutGenerator::new(backend, &config.artifact_root, dirs::home_dir());
    for layout in layouts.iter() {
        let full = layout.renamed(full_session_name(prefix, layout.session_name()));
        let body = generator
            .preview(&full)
            .with_context(|| format!("Invalid layout for session '{}'", layout.session_name()))?;
        println!("# {} ({backend})", full.session_name());
        print!("{body}");
        if !body.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

async fn cmd_up(
    backend: BackendKind,
    config: MuxConfig,
    path: &Path,
    prefix: &str,
    host: Option<&str>,
    id: Option<&str>,
) -> Result<()> {
    let layouts = read_layouts(path).await?;
    let mut manager = match host {
        Some(host) => Manager::remote(host, layouts, prefix, backend, config).await,
        None => Manager::local(layouts, prefix, backend, config).await,
    }
    .context("Failed to prepare sessions")?;

    let outcomes = manager.start_all().await;
    for outcome in &outcomes {
        let verb = if outcome.success { "Started" } else { "Failed" };
        println!("{verb} session: {} ({})", outcome.session_name, outcome.message);
    }

    let id = manager.save(id).await.context("Failed to save manager state")?;
    println!("Saved manager: {id}");

    let failed = outcomes.iter().filter(|o| !o.success).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} sessions failed to start", outcomes.len());
    }
    Ok(())
}

async fn cmd_status(config: MuxConfig, id: &str, json: bool, brief: bool) -> Result<()> {
    let manager = load_manager(config, id).await?;
    if json {
        let records = manager.status_all().await;
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if brief {
        for row in manager.list_active().await {
            let state = if row.is_active { "active" } else { "inactive" };
            println!("{} [{state}] {} tabs: {}", row.session_name, row.tab_count, row.tabs.join(", "));
        }
    } else {
        print!("{}", manager.render_report().await);
    }
    Ok(())
}

async fn cmd_kill(config: MuxConfig, id: &str, forget: bool) -> Result<()> {
    let persistence = config.clone();
    let mut manager = load_manager(config, id).await?;
    for outcome in manager.kill_all().await {
        let verb = if outcome.success { "Killed" } else { "Could not kill" };
        println!("{verb} session: {} ({})", outcome.session_name, outcome.message);
    }
    if forget {
        Manager::delete(&persistence, id).await?;
        println!("Forgot manager: {id}");
    }
    Ok(())
}

async fn cmd_attach(config: MuxConfig, id: &str, session: Option<&str>) -> Result<()> {
    let manager = load_manager(config, id).await?;
    println!("{}", manager.attach_command(session)?);
    Ok(())
}

async fn cmd_saved(config: &MuxConfig) -> Result<()> {
    let ids = Manager::list_saved(config)
        .await
        .context("Failed to list saved managers")?;
    if ids.is_empty() {
        println!("No saved managers.");
    } else {
        for id in &ids {
            println!("{id}");
        }
    }
    Ok(())
}

async fn cmd_forget(config: &MuxConfig, id: &str) -> Result<()> {
    if !Manager::delete(config, id).await? {
        anyhow::bail!("No saved manager with id '{id}'");
    }
    println!("Forgot manager: {id}");
    Ok(())
}

async fn cmd_monitor(config: MuxConfig, id: &str, interval: u64) -> Result<()> {
    let manager = load_manager(config, id).await?;
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    let mut stdout = std::io::stdout();
    let run = manager
        .run_monitoring_loop(Duration::from_secs(interval), stop_rx, &mut stdout)
        .await?;
    if run.all_stopped {
        println!("All commands stopped after {} cycles.", run.cycles);
    } else {
        println!("Monitoring stopped after {} cycles.", run.cycles);
    }
    Ok(())
}
