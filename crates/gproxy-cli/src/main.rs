//! gproxy command-line entry point.
//!
//! Entity subcommands are synthesized from the endpoint descriptors of
//! the bundled registry; instance management (serve/list/stop/restart)
//! drives the process supervisor. Errors print to stderr and exit
//! non-zero; context-resolution failures enumerate the candidates.

mod commands;
mod context;
mod render;

use gproxy_core::{EncryptionManager, ProxyConfig, Result};
use gproxy_entities::Proxy;
use gproxy_supervisor::Supervisor;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use context::CliContext;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli_command = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "gproxy".to_string());
    let supervisor = Supervisor::new(Supervisor::default_base_dir(None), cli_command);
    let ctx = CliContext::new(supervisor.clone());

    // Descriptor-only proxy: builds the command tree without touching
    // any instance database.
    let spec_proxy = Proxy::assemble(
        ProxyConfig {
            db: ":memory:".to_string(),
            ..ProxyConfig::default()
        },
        Proxy::builtin_registry(),
        EncryptionManager::disabled(),
        supervisor,
    )?;

    let matches = commands::build_cli(&spec_proxy).get_matches();

    match matches.subcommand() {
        Some(("serve", sub)) => commands::run_serve(&ctx, sub).await,
        Some(("list", _)) => commands::run_list(&ctx),
        Some(("stop", sub)) => commands::run_stop(&ctx, sub).await,
        Some(("restart", sub)) => commands::run_restart(&ctx, sub).await,
        Some(("use", sub)) => commands::run_use(&ctx, sub),
        Some(("version", _)) => {
            println!("gproxy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some((entity, sub)) => commands::run_entity_command(&ctx, &spec_proxy, entity, sub).await,
        None => Ok(()),
    }
}
