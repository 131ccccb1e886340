//! webarc: pipelined web archival crawler

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use webarc::config::{Config, LogFormat};
use webarc::queue::{PersistentGroupedQueue, SyncMode};
use webarc::warc::CountingSink;
use webarc::Controller;

#[derive(Parser)]
#[command(name = "webarc")]
#[command(about = "Pipelined web archival crawler")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "webarc.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a crawl from seed URLs
    Crawl {
        /// Seed URLs
        urls: Vec<String>,

        /// File with one seed URL per line
        #[arg(long)]
        seed_file: Option<PathBuf>,

        /// Job name (defaults to the config's job)
        #[arg(short, long)]
        job: Option<String>,

        /// Worker count override
        #[arg(short, long)]
        workers: Option<usize>,

        /// Maximum outlink hops from a seed
        #[arg(long)]
        max_hops: Option<u16>,

        /// Maximum redirect chain depth
        #[arg(long)]
        max_redirect: Option<u8>,

        /// Follow outlinks regardless of hop count
        #[arg(long)]
        domains_crawl: bool,

        /// Disable the local seencheck store
        #[arg(long)]
        no_seencheck: bool,

        /// Crawl HQ address; enables HQ mode
        #[arg(long)]
        hq_address: Option<String>,

        /// Admin API listen address
        #[arg(long)]
        api_listen: Option<String>,

        /// Disable the admin API
        #[arg(long)]
        no_api: bool,
    },

    /// Resume a previously started job from its queue
    Resume {
        /// Job name under the jobs directory
        job: String,
    },

    /// Print statistics for a queue directory
    InspectQueue {
        /// Path to the queue directory
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load or default the config before logging, its level feeds the subscriber
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    setup_logging(cli.verbose, &config)?;

    match cli.command {
        Commands::Crawl {
            urls,
            seed_file,
            job,
            workers,
            max_hops,
            max_redirect,
            domains_crawl,
            no_seencheck,
            hq_address,
            api_listen,
            no_api,
        } => {
            if let Some(job) = job {
                config.crawl.job = job;
            }
            if let Some(workers) = workers {
                config.crawl.workers = workers;
            }
            if let Some(max_hops) = max_hops {
                config.crawl.max_hops = max_hops;
            }
            if let Some(max_redirect) = max_redirect {
                config.crawl.max_redirect = max_redirect;
            }
            if domains_crawl {
                config.crawl.domains_crawl = true;
            }
            if no_seencheck {
                config.crawl.local_seencheck = false;
            }
            if let Some(address) = hq_address {
                config.hq.enabled = true;
                config.hq.address = address;
            }
            if let Some(listen) = api_listen {
                config.api.listen_addr = listen;
            }
            if no_api {
                config.api.enabled = false;
            }

            let mut seeds = urls;
            if let Some(path) = seed_file {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("cannot read seed file '{}': {}", path.display(), e)
                })?;
                seeds.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(str::to_string),
                );
            }
            if seeds.is_empty() && !config.hq.enabled {
                anyhow::bail!("no seeds given; pass URLs, --seed-file, or --hq-address");
            }

            run_crawl(config, seeds).await
        }
        Commands::Resume { job } => {
            config.crawl.job = job;
            run_crawl(config, Vec::new()).await
        }
        Commands::InspectQueue { path } => inspect_queue(path),
    }
}

async fn run_crawl(config: Config, seeds: Vec<String>) -> Result<()> {
    // WARC serialization is delegated to the external writer; the
    // in-process sink tracks records for stats and draining
    let sink = CountingSink::shared();

    let controller = Controller::start(config, sink.clone()).await?;
    controller.insert_seeds(&seeds).await?;
    controller.run_until_done().await?;

    let stats = controller.stats();
    controller.shutdown().await?;

    info!(
        crawled = stats.crawled_total(),
        seeds = stats.crawled_seeds.get(),
        assets = stats.crawled_assets.get(),
        records = sink.submitted(),
        "crawl finished"
    );
    Ok(())
}

fn inspect_queue(path: PathBuf) -> Result<()> {
    let queue = PersistentGroupedQueue::open(&path, SyncMode::Never, 1)?;
    let stats = queue.stats();

    println!("Queue: {}", path.display());
    println!("=================");
    println!("Total elements:  {}", stats.total_elements);
    println!("Unique hosts:    {}", stats.unique_hosts);
    println!("Enqueued total:  {}", stats.enqueue_count);
    println!("Dequeued total:  {}", stats.dequeue_count);
    if let Some(t) = stats.first_enqueue_time {
        println!("First enqueue:   {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(t) = stats.last_enqueue_time {
        println!("Last enqueue:    {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if !stats.elements_per_host.is_empty() {
        println!("\nPer-host counts:");
        let mut hosts: Vec<_> = stats.elements_per_host.iter().collect();
        hosts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (host, count) in hosts {
            println!("  {host}: {count}");
        }
    }

    Ok(())
}

fn setup_logging(verbose: u8, config: &Config) -> Result<()> {
    let level = match verbose {
        0 => config.logging.level.tracing_level(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    if !config.logging.stdout {
        return Ok(());
    }

    match config.logging.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}
