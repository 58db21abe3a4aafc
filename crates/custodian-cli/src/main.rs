//! `custodian` – managed-endpoint agent
//!
//! This binary is the entry point for the Custodian agent.  It:
//!
//! 1. Loads `~/.custodian/config.toml`, writing the defaults on first run.
//! 2. Installs the tracing pipeline (`RUST_LOG`, `CUSTODIAN_LOG_FORMAT`,
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`).
//! 3. Starts the agent against a simulated device, connected to the
//!    configured controller or, when none is configured, to an in-process
//!    loopback controller.
//! 4. Drops the operator into the **console** (`/status`, `/apps`, …).
//! 5. Intercepts **Ctrl-C** to stop every agent task and exit cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use custodian_hal::{Platform, SimDevice};
use custodian_memory::StateDb;
use custodian_middleware::{FallbackTransport, HttpFallback, LoopbackController, Transport, WsTransport, loopback};
use custodian_runtime::{Agent, init_tracing};

const FALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

fn main() {
    let _telemetry = init_tracing("custodian");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("custodian-rt")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start the async runtime: {}", e);
            std::process::exit(1);
        }
    };

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the agent …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let path = config::config_path();
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    info!(config = ?cfg, "configuration loaded");

    // ── Agent ─────────────────────────────────────────────────────────────
    let state_path = cfg.state_db_path(&path);
    let store = match StateDb::open(&state_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("{} {}: {}", "Failed to open state database".red(), state_path.display(), e);
            std::process::exit(1);
        }
    };

    let device = Arc::new(
        SimDevice::new()
            .with_installed(cfg.simulated_packages.iter().map(String::as_str))
            .with_stationary_location(52.52, 13.405),
    );

    let (transport, fallback, _loopback) = build_transports(&cfg);
    let started = runtime.block_on(Agent::start(
        cfg.to_agent_config(),
        Platform::from_device(device),
        store,
        transport,
        fallback,
    ));
    let agent = match started {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("{}: {}", "Agent failed to start".red(), e);
            std::process::exit(1);
        }
    };

    println!(
        "  {} Agent {} as {} (state: {})",
        "✓".green().bold(),
        "RUNNING".green().bold(),
        cfg.device_id.bold(),
        state_path.display().to_string().dimmed()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // The console runs on this thread; agent tasks run on the runtime's
    // workers.
    repl::run(&agent, shutdown);

    runtime.block_on(agent.shutdown());
    println!("{}", "  ✓ Agent stopped.".green());
}

/// Pick the primary and fallback channels.  An empty controller URL runs
/// against an in-process controller whose handle must outlive the agent.
fn build_transports(
    cfg: &config::Config,
) -> (Box<dyn Transport>, Option<Arc<dyn FallbackTransport>>, Option<LoopbackController>) {
    if cfg.is_offline() {
        println!("  {}", "No controller configured – running offline (loopback).".yellow());
        let (transport, controller) = loopback();
        return (Box::new(transport), None, Some(controller));
    }

    println!("  Controller: {}", cfg.controller_url.bold());
    let mut ws = WsTransport::new(cfg.controller_url.clone(), cfg.device_id.clone());
    if !cfg.enrollment_token.is_empty() {
        ws = ws.with_token(cfg.enrollment_token.clone());
    }

    let fallback = (!cfg.fallback_url.trim().is_empty()).then(|| {
        println!("  Fallback  : {}", cfg.fallback_url.bold());
        let mut http = HttpFallback::new(cfg.fallback_url.clone(), cfg.device_id.clone(), FALLBACK_TIMEOUT);
        if !cfg.enrollment_token.is_empty() {
            http = http.with_token(cfg.enrollment_token.clone());
        }
        Arc::new(http) as Arc<dyn FallbackTransport>
    });

    (Box::new(ws), fallback, None)
}

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

fn first_run() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Custodian First Run           ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Writing defaults.\n");

    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______           __            ___           "#.bold().cyan());
    println!("{}", r#"  / ____/_  _______/ /_____  ____/ (_)___ _____ "#.bold().cyan());
    println!("{}", r#" / /   / / / / ___/ __/ __ \/ __  / / __ `/ __ \"#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ (__  ) /_/ /_/ / /_/ / / /_/ / / / /"#.bold().cyan());
    println!("{}", r#"\____/\__,_/____/\__/\____/\__,_/_/\__,_/_/ /_/ "#.bold().cyan());
    println!();
    println!("  {} {}", "Custodian".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Managed-endpoint agent");
    println!();
}
