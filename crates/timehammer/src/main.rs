//! TimeHammer: a standalone NTP server that lies about time on purpose.
//!
//! Binds the request engine, upstream tracker, attack engine, and
//! observability surfaces together and serves until interrupted. The
//! interactive terminal UI is a separate consumer of the controller
//! surface; this binary always serves headless.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use timehammer_server::attacks::AttackEngine;
use timehammer_server::config::{self, Config};
use timehammer_server::logger::EventLog;
use timehammer_server::session::SessionRecorder;
use timehammer_server::upstream::UpstreamTracker;
use timehammer_server::NtpServer;

const WARNING: &str = "\
WARNING: security testing tool. TimeHammer manipulates NTP responses to
test how devices handle time-based attacks.
  - Do NOT use on production systems or networks you do not control.
  - Get proper authorization before testing.
Use in isolated test environments only.";

#[derive(Debug, Parser)]
#[command(
    name = "timehammer",
    version,
    about = "NTP security testing server for IoT, IIoT, and embedded devices"
)]
struct Args {
    /// Run without the interactive terminal UI.
    #[arg(long)]
    headless: bool,

    /// Path to the configuration file (default: ./.timehammer/config.yaml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    std::process::exit(match run(args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("timehammer: {e}");
            1
        }
    });
}

#[tokio::main]
async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    println!("{WARNING}\n");

    let data_dir = config::ensure_data_dir()?;
    println!("Data directory: {}", data_dir.display());

    let cfg = Config::load(args.config.as_deref())?;
    let save_path = match &args.config {
        Some(p) => p.clone(),
        None => config::config_path()?,
    };

    let log = Arc::new(EventLog::new(&cfg.logging, Some(&data_dir))?);
    let cfg = Arc::new(RwLock::new(cfg));
    let recorder = Arc::new(SessionRecorder::new(Some(
        data_dir.join(config::SESSION_DIR_NAME),
    )));
    let attack_engine = Arc::new(AttackEngine::new(cfg.clone(), log.clone()));
    let upstream = Arc::new(UpstreamTracker::new(
        cfg.clone(),
        log.clone(),
        recorder.clone(),
    ));
    let server = NtpServer::new(
        cfg.clone(),
        log.clone(),
        recorder,
        attack_engine,
        upstream,
    );

    log.info(
        "STARTUP",
        format!("TimeHammer v{} starting", env!("CARGO_PKG_VERSION")),
    );

    server.start().await?;
    let addr = server.listen_address().expect("server just started");
    println!("Server listening on {addr}");

    if !args.headless {
        println!("The terminal UI ships separately; serving headless. Press Ctrl+C to stop.");
    } else {
        println!("Running in headless mode. Press Ctrl+C to stop.");
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    info!("interrupt received, stopping server");

    server.stop().await?;
    cfg.read().expect("config lock poisoned").save(&save_path)?;

    Ok(())
}
