//! Focus Gateway - authenticating edge proxy
//!
//! Verifies bearer tokens and forwards requests to the Focus services with
//! the caller's identity re-asserted by the gateway.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use focus_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, ReverseProxy},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig { print }) => run_check_config(&cli, print),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> focus_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    // Overrides can break cross-field checks (listener collision)
    config.validate()?;
    Ok(config)
}

/// Validate configuration and print the resolved routing table
fn run_check_config(cli: &Cli, print: bool) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let proxy = match ReverseProxy::from_config(&config) {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration valid");
    println!("   Environment: {:?}", config.environment);
    println!("   Auth mode:   {:?}", config.auth.mode);
    println!("   Listener:    {}:{}", config.server.host, config.server.port);
    if config.internal.enabled {
        println!("   Internal:    {}:{}", config.internal.host, config.internal.port);
    }
    println!();
    println!("Routes:");
    for route in proxy.routes().iter() {
        match route.upstream() {
            Some(upstream) => println!(
                "   {:<24} -> {} ({})",
                route.path_prefix(),
                upstream.name(),
                upstream.base_url()
            ),
            None => println!(
                "   {:<24} -> {} (not configured, answers 502)",
                route.path_prefix(),
                route.upstream_name()
            ),
        }
    }

    if print {
        match serde_yaml::to_string(&config.redacted()) {
            Ok(yaml) => {
                println!();
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("❌ Failed to render configuration: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        upstreams = config.upstreams.len(),
        routes = config.routes.len(),
        "Starting Focus Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
