mod config;
mod fanout;
mod lifecycle;
mod persistence;
mod presence;
mod prompt;
mod provider;
mod registry;
mod relay;
mod scheduler;
mod transport;

use crate::{
    config::{load_config, Config},
    lifecycle::{ChatRuntime, StartupError},
    transport::{router, AppState, TransportSettings},
};
use agora_core::DEFAULT_MAX_FRAME_BYTES;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = load_config();
    let _log_guard = init_logging(&config);
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "hub_fatal", error = %err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let addr: SocketAddr = config.addr.parse().map_err(|err: std::net::AddrParseError| {
        StartupError::Addr {
            addr: config.addr.clone(),
            reason: err.to_string(),
        }
    })?;
    std::fs::create_dir_all(&config.upload_dir).map_err(|source| StartupError::Io {
        path: config.upload_dir.display().to_string(),
        source,
    })?;

    let runtime = Arc::new(ChatRuntime::start(&config)?);
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        runtime.clone(),
        TransportSettings {
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            history_on_join: config.history_on_join,
            announce_joins: config.announce_joins,
            upload_dir: config.upload_dir.clone(),
        },
        shutdown.clone(),
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Io {
            path: addr.to_string(),
            source,
        })?;
    let agents = runtime.start_agents().await;
    info!(
        event = "hub_start",
        addr = %addr,
        agents,
        db_path = %config.db_path.display()
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        signal.cancel();
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    let report = runtime.shutdown().await;
    info!(
        event = "hub_stop",
        agents_stopped = report.stopped,
        agents_abandoned = report.abandoned.len()
    );
    served.map_err(|source| StartupError::Io {
        path: addr.to_string(),
        source,
    })
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("AGORA_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match config.log_dir.as_deref() {
        Some(dir) => open_log_file(dir).unwrap_or_else(|err| {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }),
        None => LogGuard { file: None },
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees every log line to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("agora-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
