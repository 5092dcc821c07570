//! knockd - port-knocking daemon.

use std::env;
use std::process::ExitCode;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use knock_daemon::audit::{AuditLogger, GrantEntry};
use knock_daemon::config::Settings;
use knock_daemon::listen::{shutdown_channel, KnockEvent, KnockListener};
use knock_daemon::tracker::CredentialDispatcher;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = "knockd";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    let config_path = get_config_path(&args);

    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting {} v{}", NAME, VERSION);
    info!("Configuration loaded from: {}", config_path);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

/// Async main function.
async fn async_main(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let identities = settings.load_identities()?;
    let mut dispatcher = CredentialDispatcher::new(
        identities,
        settings.sequence,
        settings.tracker_config(),
    )?;
    info!(
        identities = ?dispatcher.identities().collect::<Vec<_>>(),
        length = settings.sequence.length,
        rotation_seconds = settings.sequence.rotation_seconds,
        "Credentials loaded"
    );

    let mut audit_logger = if settings.audit.enabled {
        match AuditLogger::new(&settings.audit.log_path) {
            Ok(logger) => {
                info!(path = %settings.audit.log_path.display(), "Audit logging enabled");
                Some(logger)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %settings.audit.log_path.display(),
                    "Failed to create audit logger, audit logging disabled"
                );
                None
            }
        }
    } else {
        info!("Audit logging disabled");
        None
    };

    let listener = KnockListener::bind(&settings.listener_config()).await?;

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown...");
        trigger.trigger();
    });

    let handler = move |event: KnockEvent| {
        let window = dispatcher.window_index(event.timestamp);
        let Some(identity) = dispatcher.check(&event) else {
            return;
        };

        info!(
            identity,
            source = %event.source,
            port = event.port,
            window,
            "Knock sequence completed"
        );

        if let Some(logger) = audit_logger.as_mut() {
            let entry = GrantEntry::new(event.timestamp, identity, event.source, event.port, window);
            if let Err(e) = logger.log(&entry) {
                error!(error = %e, "Failed to write audit entry");
            }
        }
    };

    listener.run(handler, shutdown).await?;

    info!("Daemon stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print help message.
fn print_help() {
    println!(
        r#"{} {}
Port-knocking daemon: grants access to clients that knock a secret,
time-rotating sequence of UDP ports.

USAGE:
    {} [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file
                           [default: /etc/knockd/knockd.toml]
    -h, --help             Print help information
    -V, --version          Print version information
"#,
        NAME, VERSION, NAME
    );
}

/// Get configuration file path from command line arguments.
fn get_config_path(args: &[String]) -> String {
    for (i, arg) in args.iter().enumerate() {
        if (arg == "--config" || arg == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    "/etc/knockd/knockd.toml".to_string()
}

/// Initialize logging based on settings.
fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    match settings.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}
