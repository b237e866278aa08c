use clap::Parser;
use log::error;
use std::process::ExitCode;
use std::time::Duration;

use dnsfan::error::RelayError;
use dnsfan::proxy::{self, ProxyConfig};
use dnsfan::resolver::{listen_addr, resolve_upstreams};
use dnsfan::transport::{DEFAULT_BUFFER_SIZE, DNS_PORT};

#[derive(Parser)]
#[command(name = "dnsfan")]
#[command(about = "Fans DNS queries out to several upstream resolvers", long_about = None)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Local port to listen on
    #[arg(short, long, default_value_t = DNS_PORT)]
    port: u16,

    /// Upstream DNS server (host or host:port, can be specified multiple times)
    #[arg(short, long, default_values = ["8.8.8.8", "8.8.4.4"])]
    upstream: Vec<String>,

    /// Port used for upstreams given without one
    #[arg(long, default_value_t = DNS_PORT)]
    upstream_port: u16,

    /// Seconds a session may stay idle before it is evicted
    #[arg(short, long, default_value_t = 10)]
    ttl: u64,

    /// Size of the inbound datagram buffer in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Number of send workers
    #[arg(short, long, default_value_t = 10)]
    workers: usize,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Enable verbose logging (sessions, relays, dropped datagrams)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

fn run(args: Args) -> Result<(), RelayError> {
    proxy::check_workers(args.workers)?;

    // Send workers get their own threads; the reactor keeps this one.
    let pool_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.workers)
        .thread_name("dnsfan-send")
        .enable_all()
        .build()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let config = ProxyConfig {
            bind_addr: listen_addr(&args.bind, args.port)?,
            upstreams: resolve_upstreams(&args.upstream, args.upstream_port).await?,
            ttl: Duration::from_secs(args.ttl),
            buffer_size: args.buffer_size,
            workers: args.workers,
            stats_interval: (args.stats_interval > 0)
                .then(|| Duration::from_secs(args.stats_interval)),
        };

        proxy::run(config, pool_rt.handle().clone()).await
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
