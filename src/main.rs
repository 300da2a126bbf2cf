use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use memsched::{sim, traffic, Config};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Format {
    Json,
    Yaml,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "run synthetic traffic through the memory scheduler", long_about = None)]
struct Options {
    /// Scheduler configuration (yaml or json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Traffic pattern (linear, random, dram, strided)
    #[arg(short, long, default_value = "linear")]
    pattern: traffic::Pattern,

    /// Number of traffic generators
    #[arg(long, default_value = "4")]
    requesters: usize,

    /// Requests per traffic generator
    #[arg(long, default_value = "1000")]
    requests: usize,

    /// Percentage of reads
    #[arg(long, default_value = "70")]
    read_percent: u8,

    /// Highest generated address (defaults to the end of the served range)
    #[arg(long)]
    max_addr: Option<u64>,

    /// Blocks between requests of one generator (strided pattern)
    #[arg(long, default_value = "32")]
    stride: u64,

    /// Device latency in cycles
    #[arg(long, default_value = "20")]
    latency: u64,

    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(long)]
    max_cycles: Option<u64>,

    /// Statistics output format (json, yaml)
    #[arg(short, long, default_value = "json")]
    format: Format,

    /// Write a chrome trace of the channel cycles to this file
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(level);
    log_builder.parse_default_env();
    log_builder.init();
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();
    init_logging(options.verbose);

    let _trace_guard = match &options.trace {
        Some(path) => {
            use tracing_subscriber::prelude::*;
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .build();
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(chrome_layer),
            )
            .wrap_err("failed to install trace subscriber")?;
            Some(guard)
        }
        None => None,
    };

    let config = match &options.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    log::info!("config: {}", config);

    let sim_options = sim::Options {
        traffic: traffic::Config {
            pattern: options.pattern,
            min_addr: config.base_address,
            max_addr: options
                .max_addr
                .unwrap_or(config.base_address + config.memory_size),
            block_size: config.line_size as u32,
            read_percent: options.read_percent.min(100),
            num_requests: options.requests,
            num_banks: config.banks_per_channel as u64,
            stride: options.stride,
            ..traffic::Config::default()
        },
        num_requesters: options.requesters,
        latency: options.latency,
        seed: options.seed,
        max_cycles: options.max_cycles,
    };

    let start = std::time::Instant::now();
    let stats = sim::run(&config, &sim_options)?;
    log::info!("simulated {} cycles in {:?}", stats.cycles, start.elapsed());
    let total = stats.reduce().scheduler;
    if let (Some(queued), Some(service)) = (total.avg_queue_cycles(), total.avg_service_cycles()) {
        log::info!("average latency: {queued:.1} cycles queued, {service:.1} cycles in service");
    }

    let output = match options.format {
        Format::Json => serde_json::to_string_pretty(&stats)?,
        Format::Yaml => serde_yaml::to_string(&stats)?,
    };
    println!("{output}");
    Ok(())
}
