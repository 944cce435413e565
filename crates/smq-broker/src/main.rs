//! The `broker` executable.
//!
//! Exit codes: 0 on clean shutdown, 1 on a configuration error, 2 on a
//! runtime-fatal startup error (unusable store, unbindable listener).
//! SIGINT/SIGTERM shut down gracefully; SIGHUP re-opens the log file.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use smq_broker::{Broker, BrokerError, Config, Multiplexer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

#[derive(Parser, Debug)]
#[command(name = "broker", about = "SMQ message broker", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,
}

/// Log sink that can re-open its file on SIGHUP (for rotation).
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<ReopenableFile>>,
}

struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopenableFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    fn reopen(&self) {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(new) => *self.file.lock().expect("log file poisoned") = new,
            Err(e) => eprintln!("broker: cannot reopen log file {}: {e}", self.path.display()),
        }
    }
}

enum LogWriter {
    Stderr(io::Stderr),
    File(Arc<ReopenableFile>),
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stderr(out) => out.write(buf),
            Self::File(f) => f.file.lock().expect("log file poisoned").write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stderr(out) => out.flush(),
            Self::File(f) => f.file.lock().expect("log file poisoned").flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match &self.file {
            Some(file) => LogWriter::File(file.clone()),
            None => LogWriter::Stderr(io::stderr()),
        }
    }
}

fn init_logging(cfg: &Config) -> Result<LogSink, BrokerError> {
    let file = match &cfg.log.file {
        Some(path) => Some(Arc::new(
            ReopenableFile::open(path)
                .map_err(|e| BrokerError::Config(format!("log.file: {e}")))?,
        )),
        None => None,
    };
    let sink = LogSink { file };

    let filter = match &cfg.log.filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .with_ansi(cfg.log.file.is_none())
        .init();
    Ok(sink)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("broker: {e}");
            return ExitCode::from(1);
        }
    };

    let sink = match init_logging(&cfg) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("broker: {e}");
            return ExitCode::from(1);
        }
    };

    let mux = match Multiplexer::new() {
        Ok(mux) => mux,
        Err(e) => {
            error!("multiplexer: {e}");
            return ExitCode::from(2);
        }
    };

    let broker = match Broker::start(cfg, mux) {
        Ok(broker) => broker,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(2);
        }
    };

    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("signal handler: {e}");
            broker.stop();
            return ExitCode::from(2);
        }
    };

    for signal in signals.forever() {
        match signal {
            SIGHUP => {
                info!("SIGHUP: reopening log file");
                if let Some(file) = &sink.file {
                    file.reopen();
                }
            }
            _ => {
                info!(signal, "shutdown signal");
                break;
            }
        }
    }

    broker.stop();
    ExitCode::SUCCESS
}
