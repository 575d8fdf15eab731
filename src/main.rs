use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use syncline::config::{Config, StorageConfig};
use syncline::network::{run_http_admin, AdminAuth, GrpcRemoteExecutor};
use syncline::storage::open_store;
use syncline::sync::{LogObserver, SyncEngine};

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        // path.N-1 -> path.N, ..., path -> path.1
        for i in (1..self.max_files).rev() {
            let src = format!("{}.{}", self.path, i);
            let dst = format!("{}.{}", self.path, i + 1);
            let _ = std::fs::rename(&src, &dst);
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn init_logging() {
    if let Ok(path) = std::env::var("SYNCLINE_LOG_FILE") {
        // Plain logs go to a size-rotated file through env_logger.
        let max_size_mb = std::env::var("SYNCLINE_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10);
        let max_files = std::env::var("SYNCLINE_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3);

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        match RotatingFile::new(path.clone(), max_size_mb * 1024 * 1024, max_files) {
            Ok(rot) => {
                builder.target(env_logger::Target::Pipe(Box::new(rot)));
            }
            Err(e) => eprintln!("cannot open log file {path}: {e}; logging to stderr"),
        }
        let _ = builder.try_init();
        return;
    }

    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "syncline")]
#[command(about = "Offline-capable sync engine with retries, circuit breaking and dead letters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine with the gRPC remote executor and admin HTTP
    Run {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Directory of the sled store (overrides config)
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Remote store gRPC address, e.g. http://127.0.0.1:7000
        #[arg(short, long)]
        remote: Option<String>,

        /// Admin HTTP listen address, e.g. 127.0.0.1:9100
        #[arg(long)]
        admin_addr: Option<String>,
    },

    /// Talk to a running node's admin HTTP endpoint
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,
    },
}

#[derive(Subcommand)]
enum AdminCmd {
    /// Full health snapshot
    Health {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Prometheus metrics
    Metrics {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Queue counts by status
    Stats {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// List dead letters
    DeadLetters {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Re-drive one dead letter
    Retry {
        id: String,
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Drop every dead letter
    ClearDeadLetters {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Force the circuit breaker closed
    ResetBreaker {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Reset breaker, retry budget and metrics
    Reset {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
    /// Delete operations that already succeeded
    Purge {
        #[arg(long, default_value = "127.0.0.1:9100")]
        http: String,
    },
}

fn http_request(host_port: &str, method: &str, path: &str) -> Result<String> {
    use std::io::Read;
    use std::net::TcpStream;

    let mut stream =
        TcpStream::connect(host_port).with_context(|| format!("connecting to {host_port}"))?;
    let auth = std::env::var("SYNCLINE_AUTH_TOKEN_ADMIN")
        .map(|t| format!("Authorization: Bearer {t}\r\n"))
        .unwrap_or_default();
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host_port}\r\n{auth}Content-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(req.as_bytes())?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let resp = String::from_utf8_lossy(&buf);
    match resp.find("\r\n\r\n") {
        Some(pos) => Ok(resp[pos + 4..].to_string()),
        None => Ok(resp.to_string()),
    }
}

fn run_admin(cmd: AdminCmd) -> Result<()> {
    let body = match cmd {
        AdminCmd::Health { http } => http_request(&http, "GET", "/health")?,
        AdminCmd::Metrics { http } => http_request(&http, "GET", "/metrics")?,
        AdminCmd::Stats { http } => http_request(&http, "GET", "/stats")?,
        AdminCmd::DeadLetters { http } => http_request(&http, "GET", "/dead-letters")?,
        AdminCmd::Retry { id, http } => {
            http_request(&http, "POST", &format!("/dead-letters/{id}/retry"))?
        }
        AdminCmd::ClearDeadLetters { http } => http_request(&http, "DELETE", "/dead-letters")?,
        AdminCmd::ResetBreaker { http } => http_request(&http, "POST", "/circuit-breaker/reset")?,
        AdminCmd::Reset { http } => http_request(&http, "POST", "/error-recovery/reset")?,
        AdminCmd::Purge { http } => http_request(&http, "POST", "/operations/purge")?,
    };
    println!("{body}");
    Ok(())
}

async fn run_node(
    config_path: Option<String>,
    data_dir: Option<String>,
    remote: Option<String>,
    admin_addr: Option<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load(&path).with_context(|| format!("loading config {path}"))?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    if let Some(dir) = data_dir {
        config.storage = StorageConfig::Sled { data_dir: dir };
    }
    if let Some(addr) = remote {
        config.remote.address = addr;
    }
    if let Some(addr) = admin_addr {
        config.admin.http_addr = addr;
    }
    config.validate()?;

    if let StorageConfig::Sled { data_dir } = &config.storage {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {data_dir}"))?;
    }

    let store = open_store(&config.storage)?;
    let executor = Arc::new(GrpcRemoteExecutor::new(&config.remote));
    let engine = Arc::new(
        SyncEngine::builder(config.sync.clone())
            .store(store)
            .executor(executor)
            .observer(Arc::new(LogObserver))
            .build()?,
    );

    info!(
        "Starting syncline (remote {}, admin {})",
        config.remote.address, config.admin.http_addr
    );
    engine.start();

    let http_addr: SocketAddr = match config.admin.http_addr.parse() {
        Ok(addr) => addr,
        Err(e) => bail!("invalid admin address {}: {e}", config.admin.http_addr),
    };
    {
        let engine = Arc::clone(&engine);
        let auth = AdminAuth::from_env();
        let max_body_bytes = config.admin.max_body_bytes;
        tokio::spawn(async move {
            if let Err(e) = run_http_admin(http_addr, engine, auth, max_body_bytes).await {
                error!("HTTP admin server error: {e}");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    info!("Sync engine stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            data_dir,
            remote,
            admin_addr,
        } => run_node(config, data_dir, remote, admin_addr).await,
        Command::Admin { cmd } => run_admin(cmd),
    }
}
