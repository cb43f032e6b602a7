use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tof_perception::camera::create_factory;
use tof_perception::config::LoggingConfig;
use tof_perception::daemon::{detach_from_terminal, DaemonSupervisor};
use tof_perception::inference::create_detector;
use tof_perception::{PerceptionConfig, PerceptionError, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "config/perception.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (defaults to config/perception.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    daemonize: bool,

    /// Record gray images and point clouds of every processed frame
    #[arg(long)]
    save_data: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = load_config(args.config.as_deref());
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    if let Err(e) = init_logging(args.log_level.as_deref(), &logging) {
        eprintln!("tof-daemon: {}", e);
        return ExitCode::FAILURE;
    }

    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    config.daemon.detach |= args.daemonize;
    config.daemon.save_data |= args.save_data;

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: PerceptionConfig) -> Result<()> {
    // Forking is only safe while the process is single-threaded.
    if config.daemon.detach {
        detach_from_terminal(&config.daemon.working_dir)?;
    }
    info!("Starting ToF perception daemon {}", config.node_id);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| PerceptionError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    let factory = create_factory(&config.sensor)?;
    let detector = create_detector(&config.detection)?;
    let context = zmq::Context::new();

    let supervisor = DaemonSupervisor::start(&config, &context, factory, detector, running)?;
    supervisor.wait()?;

    info!("ToF perception daemon exited cleanly");
    Ok(())
}

fn init_logging(cli_level: Option<&str>, config: &LoggingConfig) -> Result<()> {
    let level = cli_level.unwrap_or(&config.level);
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder().with_max_level(log_level);
    let result = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let subscriber = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => tracing::subscriber::set_global_default(builder.finish()),
    };

    result.map_err(|e| PerceptionError::ConfigError(e.to_string()))
}

fn load_config(path: Option<&Path>) -> Result<PerceptionConfig> {
    // An explicit path must exist; the default one is optional.
    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name(DEFAULT_CONFIG).required(false),
    };

    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("TOFD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
