use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use geoshot::annotate::Annotator;
use geoshot::capture::CommandCamera;
use geoshot::config::Config;
use geoshot::db::CaptureStore;
use geoshot::geocode::{HttpGeocoder, NoGeocoder, ReverseGeocoder};
use geoshot::location::{provider_from_config, LocationProvider};
use geoshot::pipeline::{CaptureOutcome, Orchestrator};
use geoshot::upload::{HttpUploader, UploadWorker};
use geoshot::{logging, CaptureRecord};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Capture,
    List,
    Outbox,
    Flush { watch: bool },
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    command: Command,
    config_path: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Run(Cli),
    Help,
    Version,
}

fn parse_cli(args: &[String]) -> Result<Parsed, String> {
    let mut config_path = None;
    let mut command = None;
    let mut watch = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    return Err("--config requires a path argument".to_string());
                }
            }
            "--watch" => {
                watch = true;
            }
            "capture" => command = Some(Command::Capture),
            "list" => command = Some(Command::List),
            "outbox" => command = Some(Command::Outbox),
            "flush" => command = Some(Command::Flush { watch: false }),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let command = match command {
        Some(Command::Flush { .. }) => Command::Flush { watch },
        Some(_) if watch => {
            return Err("--watch only applies to the flush command".to_string());
        }
        Some(c) => c,
        None => return Err("a command is required".to_string()),
    };

    Ok(Parsed::Run(Cli {
        command,
        config_path,
    }))
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    match parse_cli(&args) {
        Ok(Parsed::Run(cli)) => cli,
        Ok(Parsed::Help) => {
            print_help();
            std::process::exit(0);
        }
        Ok(Parsed::Version) => {
            println!("geoshot {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Err(msg) => {
            eprintln!("Error: {msg}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"geoshot - geotagged photo capture pipeline

USAGE:
    geoshot [OPTIONS] <COMMAND>

COMMANDS:
    capture             Take one photo: locate, watermark, save, queue upload
    list                Show saved captures, newest first
    outbox              Show the upload outbox
    flush               Attempt due uploads once (--watch to keep polling)

OPTIONS:
    --config, -c PATH   Path to config file
    --watch             With flush: poll the outbox until interrupted
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    GEOSHOT_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/geoshot/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    // Load configuration
    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Initialize database
    let store = Arc::new(CaptureStore::open(&config.db_path)?);
    store.initialize()?;

    match cli.command {
        Command::Capture => run_capture(&config, store).await,
        Command::List => run_list(&store),
        Command::Outbox => run_outbox(&store),
        Command::Flush { watch } => run_flush(&config, store, watch).await,
    }
}

fn upload_worker(config: &Config, store: Arc<CaptureStore>) -> Option<UploadWorker> {
    HttpUploader::from_config(&config.upload)
        .map(|uploader| UploadWorker::new(store, Arc::new(uploader), &config.upload))
}

async fn run_capture(config: &Config, store: Arc<CaptureStore>) -> Result<()> {
    let engine = Arc::new(CommandCamera::from_config(
        &config.camera,
        &config.output.pictures_dir,
    )?);
    let locator: Arc<dyn LocationProvider> = Arc::from(provider_from_config(&config.location));
    let geocoder: Arc<dyn ReverseGeocoder> = if config.geocoder.enabled {
        Arc::new(HttpGeocoder::new(&config.geocoder.endpoint))
    } else {
        Arc::new(NoGeocoder)
    };
    let annotator = Arc::new(Annotator::load(&config.annotate)?);
    let worker = upload_worker(config, store.clone());

    let (tx, rx) = mpsc::channel();
    // Notices mirror the pipeline's progress on the terminal as they arrive.
    let printer = std::thread::spawn(move || {
        for notice in rx {
            println!("{notice}");
        }
    });

    let orchestrator = Orchestrator::new(
        store,
        engine,
        locator,
        geocoder,
        annotator,
        worker,
        &config.output.pictures_dir,
        &config.output.staging_dir,
        tx,
    );

    let outcome = orchestrator.run_capture().await;
    drop(orchestrator);
    let _ = printer.join();

    match outcome {
        CaptureOutcome::Done { gallery_path, .. } => {
            println!("{}", gallery_path.display());
            Ok(())
        }
        CaptureOutcome::Aborted(e) => Err(anyhow!(e)),
        CaptureOutcome::Rejected => Err(anyhow!("another capture is already in progress")),
    }
}

fn run_list(store: &CaptureStore) -> Result<()> {
    let records = store.list_all()?;
    if records.is_empty() {
        println!("No captures yet.");
        return Ok(());
    }
    for record in records {
        print_record(&record);
    }
    Ok(())
}

fn print_record(record: &CaptureRecord) {
    println!(
        "#{:<5} {}  Lat {:.5}, Long {:.5}  {}",
        record.id,
        geoshot::annotate::timestamp_line(record.captured_at),
        record.latitude,
        record.longitude,
        record.image_uri,
    );
}

fn run_outbox(store: &CaptureStore) -> Result<()> {
    let entries = store.outbox_entries()?;
    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{:<5} capture {:<5} {:<9} attempts {:<2} {}{}",
            entry.id,
            entry.capture_id,
            entry.status.as_str(),
            entry.attempts,
            entry.object_key,
            entry
                .last_error
                .map(|e| format!("  last error: {e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

async fn run_flush(config: &Config, store: Arc<CaptureStore>, watch: bool) -> Result<()> {
    let Some(worker) = upload_worker(config, store) else {
        return Err(anyhow!(
            "uploads are not configured; set upload.endpoint in the config file"
        ));
    };

    if watch {
        worker.run().await;
        Ok(())
    } else {
        let attempted = tokio::task::spawn_blocking(move || worker.process_due()).await?;
        println!("Attempted {attempted} upload(s).");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("geoshot")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_watch_only_applies_to_flush() {
        let err = parse_cli(&args(&["capture", "--watch"])).unwrap_err();
        assert!(err.contains("flush"));
        let err = parse_cli(&args(&["--watch", "list"])).unwrap_err();
        assert!(err.contains("flush"));
    }

    #[test]
    fn test_flush_accepts_watch_in_any_position() {
        let expected = Parsed::Run(Cli {
            command: Command::Flush { watch: true },
            config_path: None,
        });
        assert_eq!(parse_cli(&args(&["flush", "--watch"])).unwrap(), expected);
        assert_eq!(parse_cli(&args(&["--watch", "flush"])).unwrap(), expected);
    }

    #[test]
    fn test_config_requires_a_path() {
        let err = parse_cli(&args(&["capture", "--config"])).unwrap_err();
        assert!(err.contains("--config"));

        let parsed = parse_cli(&args(&["-c", "/tmp/geoshot.toml", "capture"])).unwrap();
        assert_eq!(
            parsed,
            Parsed::Run(Cli {
                command: Command::Capture,
                config_path: Some(PathBuf::from("/tmp/geoshot.toml")),
            })
        );
    }

    #[test]
    fn test_command_is_required() {
        assert!(parse_cli(&args(&[])).is_err());
        assert_eq!(parse_cli(&args(&["--help"])).unwrap(), Parsed::Help);
    }
}
