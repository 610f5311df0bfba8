use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use ripener::runtime::{run, RunOptions, ShutdownOptions};
use ripener_bootstrap::{AppConfig, AppConfigProvider, CliArgs};

use std::path::{Path, PathBuf};
use std::sync::Arc;

mod demo;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// ripener server - hosts dynamically started modules
#[derive(Parser)]
#[command(name = "ripener-server")]
#[command(about = "ripener server - hosts dynamically started modules")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and module headers, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // 1) defaults -> 2) YAML (if provided) -> 3) env (RIPENER__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    ripener_bootstrap::init_logging(&logging_config, Path::new(&config.home_dir));

    tracing::info!(home_dir = %config.home_dir, "ripener-server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config),
    }
}

/// The config file serves both as module discovery and as pid configuration.
fn run_options(config: AppConfig) -> RunOptions {
    let runtime = config.runtime.clone();
    let provider = Arc::new(AppConfigProvider::new(config));
    RunOptions {
        config: runtime,
        discovery: provider.clone(),
        configuration: provider,
        ..RunOptions::default()
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!(modules = config.modules.len(), "Initializing modules…");
    run(
        run_options(config),
        ShutdownOptions::Future(Box::pin(ripener_bootstrap::shutdown_signal())),
    )
    .await
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    let warnings = config.validate()?;
    for warning in &warnings {
        tracing::warn!("{warning}");
        println!("warning: {warning}");
    }
    println!(
        "Configuration is valid ({} modules, {} warnings)",
        config.modules.len(),
        warnings.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripener::{ActivatorFactory, InventoryActivatorFactory, ModuleState, Runtime};
    use std::fs;

    const CONFIG: &str = r#"
runtime:
  priority: ["demo.audit"]
modules:
  - headers:
      Module-SymbolicName: demo.greeter
      Module-Activator: ripener.demo.greeter
      Provide-Capability: 'demo.greeting;langs:List<String>="en,fr"'
  - headers:
      Module-SymbolicName: demo.audit
      Module-Activator: ripener.demo.audit
  - headers:
      Module-SymbolicName: demo.client
      Require-Capability: 'demo.greeting;filter:="(langs=fr)"'
configurations:
  demo.greeter:
    lang: fr
"#;

    #[test]
    fn demo_activators_are_registered() {
        for name in [demo::GREETER_ACTIVATOR, demo::AUDIT_ACTIVATOR] {
            assert!(InventoryActivatorFactory.create(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn configured_modules_boot_and_wire() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ripener.yaml");
        fs::write(&path, CONFIG).unwrap();
        let config = AppConfig::load_layered(&path).unwrap();
        assert!(config.validate().unwrap().is_empty());

        let runtime = Runtime::start(run_options(config)).unwrap();

        // Priority puts the audit module first.
        let audit = runtime.module_by_name("demo.audit").unwrap();
        assert_eq!(audit.id(), 1);
        assert_eq!(audit.state(), ModuleState::Active);

        let ctx = runtime.system_context();
        let reference = ctx
            .get_service_reference(demo::GREETER_SERVICE, None)
            .unwrap()
            .unwrap();
        assert_eq!(reference.properties().get_str("lang"), Some("fr"));
        let greeter = ctx.get_service_as::<demo::Greeter>(&reference).unwrap().unwrap();
        assert_eq!(greeter.lang(), "fr");
        assert_eq!(greeter.greet("world"), "Bonjour, world!");

        let greeter_module = runtime.module_by_name("demo.greeter").unwrap();
        let client = runtime.module_by_name("demo.client").unwrap();
        assert_eq!(
            runtime.module_wiring(client.id()).unwrap().providers(),
            vec![greeter_module.id()]
        );
        runtime.stop();
    }
}
