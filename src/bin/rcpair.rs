//! Set up an RC queue pair with a peer and run one transfer mode over it.
//!
//! ```bash
//! # on the server
//! rcpair -d mlx5_0 -o write
//! # on the client
//! rcpair -d mlx5_0 -o write 10.0.2.1
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, ValueEnum};
use log::info;
use tracing_subscriber::EnvFilter;

use rcpair::rdma::cq::Backoff;
use rcpair::{bench, Config, Mode, Provider, Report, SoftFabric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// RDMA NICs through libibverbs.
    Verbs,
    /// In-process software fabric.
    Soft,
}

impl Default for ProviderKind {
    fn default() -> Self {
        if cfg!(feature = "verbs") {
            ProviderKind::Verbs
        } else {
            ProviderKind::Soft
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rcpair", version)]
#[command(about = "Point-to-point RDMA SEND/READ/WRITE over one RC queue pair")]
struct Args {
    /// Server to connect to; wait for a client if absent
    server: Option<String>,

    /// IB device (default: first device found)
    #[arg(short = 'd', long = "ib-dev")]
    ib_dev: Option<String>,

    /// TCP port of the metadata exchange (default: 2345)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// IB port (default: 1)
    #[arg(short = 'i', long = "ib-port")]
    ib_port: Option<u8>,

    /// GID index; address the peer by LID if absent
    #[arg(short = 'g', long = "gid-idx")]
    gid_idx: Option<u8>,

    /// Operation: send, receive, read or write (default: receive)
    #[arg(short = 'o', long = "op")]
    op: Option<Mode>,

    /// Number of iterations (default: 1)
    #[arg(short = 't', long = "times")]
    times: Option<u32>,

    /// Buffer size in bytes, must match the peer's (default: 64)
    #[arg(short = 's', long = "size")]
    size: Option<usize>,

    /// Completion poll timeout in milliseconds (default: 2000)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Between empty polls: spin, yield or sleep:<us> (default: spin)
    #[arg(long)]
    backoff: Option<Backoff>,

    /// TOML file with an [rcpair] table; flags override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Transport provider
    #[arg(long, value_enum, default_value_t = ProviderKind::default())]
    provider: ProviderKind,

    /// Run the server and the client in this process on the software fabric
    #[arg(long)]
    loopback: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn to_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load_toml(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };

        if self.server.is_some() {
            cfg.server_name = self.server.clone();
        }
        if self.ib_dev.is_some() {
            cfg.dev_name = self.ib_dev.clone();
        }
        if let Some(port) = self.port {
            cfg.tcp_port = port;
        }
        if let Some(ib_port) = self.ib_port {
            cfg.ib_port = ib_port;
        }
        if self.gid_idx.is_some() {
            cfg.gid_idx = self.gid_idx;
        }
        if let Some(op) = self.op {
            cfg.mode = op;
        }
        if let Some(times) = self.times {
            cfg.iterations = times;
        }
        if let Some(size) = self.size {
            cfg.msg_size = size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            cfg.poll_timeout_ms = timeout_ms;
        }
        if let Some(backoff) = self.backoff {
            cfg.backoff = backoff;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn provider(kind: ProviderKind) -> Result<Arc<dyn Provider>> {
    match kind {
        ProviderKind::Soft => Ok(Arc::new(SoftFabric::new())),
        #[cfg(feature = "verbs")]
        ProviderKind::Verbs => Ok(Arc::new(rcpair::VerbsProvider::new())),
        #[cfg(not(feature = "verbs"))]
        ProviderKind::Verbs => Err(anyhow!("rcpair was built without the `verbs` feature")),
    }
}

fn output(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        info!(
            "{} ({:?}): {} iteration(s), {} ns polling, message: {:?}",
            report.mode,
            report.role,
            report.iterations,
            report.elapsed.as_nanos(),
            report.message()
        );
    }
    Ok(())
}

/// Run both sides on one software fabric; this side plays the client.
fn loopback(cfg: Config, json: bool) -> Result<()> {
    let fabric = Arc::new(SoftFabric::new());

    let server_cfg = Config {
        server_name: None,
        mode: cfg.mode.counterpart(),
        ..cfg.clone()
    };
    let client_cfg = Config {
        server_name: Some("127.0.0.1".to_owned()),
        ..cfg
    };

    let server_fabric: Arc<dyn Provider> = fabric.clone();
    let server = thread::spawn(move || bench::run(&server_cfg, server_fabric));
    let client = bench::run(&client_cfg, fabric).context("client failed");
    let server = server
        .join()
        .map_err(|_| anyhow!("server thread panicked"))?
        .context("server failed");

    let (server, client) = (server?, client?);
    output(&server, json)?;
    output(&client, json)
}

fn run(args: Args) -> Result<()> {
    let cfg = args.to_config()?;
    if !args.json {
        println!("{}", cfg);
    }

    if args.loopback {
        return loopback(cfg, args.json);
    }

    let provider = provider(args.provider)?;
    info!("using the {} provider", provider.name());
    let report = bench::run(&cfg, provider)?;
    output(&report, args.json)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}
