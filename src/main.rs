use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use model_swapper::signals::SelfPipe;
use model_swapper::slot::runner_main::{run_runner, EchoRunnerOptions};
use model_swapper::{
    chunk_rows, CheckpointStore, LoggingConfig, LongestWaitingFirst, ModelId, ModelInputRow,
    ModelResult, ModelScheduler, ModelSwapperClient, ProcessReaper, QueueFabric, SwapperConfig,
};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Parser)]
#[command(name = "model_swapper")]
#[command(about = "Multiplex stateful models onto a fixed pool of runner processes", long_about = None)]
struct Cli {
    /// JSON configuration file; MODEL_SWAPPER_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until SIGINT or SIGTERM
    Serve,
    /// Built-in echo runner (spawned by the scheduler, speaks JSON on stdio)
    Runner {
        /// Exit abruptly when this rowID arrives
        #[arg(long)]
        fail_on_row_id: Option<i64>,
    },
    /// Define a model, creating its input queue
    Define {
        model: String,
        /// Model arguments as JSON
        #[arg(long, default_value = "null")]
        args: String,
    },
    /// Delete a model and its checkpoint
    Delete { model: String },
    /// Submit rows (a JSON array, from a file or stdin) in batches
    Submit {
        model: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print results as JSON lines
    Results {
        /// Stop after this many results
        #[arg(short, long)]
        limit: Option<usize>,
        /// Stop after this long without a result
        #[arg(long, default_value_t = 5_000)]
        wait_ms: u64,
    },
}

fn setup_logging(config: &LoggingConfig, to_file: bool) -> Result<()> {
    let level = LevelFilter::from_str(&config.level)
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if to_file {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("cannot create {}", config.log_dir.display()))?;
        let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
        let log_path = config.log_dir.join(format!("{timestamp}.log"));

        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(log_path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    log4rs::init_config(builder.build(root.build(level))?)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // The runner is a child of `serve`: stdout carries the protocol, so it
    // must never load the config file or log anywhere but stderr.
    if let Commands::Runner { fail_on_row_id } = cli.command {
        let logging = LoggingConfig::default();
        if let Err(e) = setup_logging(&logging, false) {
            eprintln!("Failed to set up logging: {e:#}");
        }
        std::process::exit(run_runner(EchoRunnerOptions { fail_on_row_id }));
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = SwapperConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Serve => {
            if let Err(e) = setup_logging(&config.logging, true) {
                eprintln!("Failed to set up logging: {e:#}");
            }
            serve(config)
        }
        Commands::Runner { .. } => unreachable!("handled in main"),
        Commands::Define { model, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;
            let model = parse_model(&model)?;
            let command_id = client(&config)?.define_model(&model, args)?;
            println!("{command_id}");
            Ok(())
        }
        Commands::Delete { model } => {
            let model = parse_model(&model)?;
            let command_id = client(&config)?.delete_model(&model)?;
            println!("{command_id}");
            Ok(())
        }
        Commands::Submit { model, file } => {
            let model = parse_model(&model)?;
            submit(&config, &model, file.as_deref())
        }
        Commands::Results { limit, wait_ms } => {
            print_results(&config, limit, Duration::from_millis(wait_ms))
        }
    }
}

fn serve(config: SwapperConfig) -> Result<()> {
    info!("Starting model swapper (pid={})", std::process::id());

    // Signal routing first: the reaper must own SIGCHLD before any runner exists.
    let reaper = ProcessReaper::install().context("installing the process reaper")?;
    let shutdown = SelfPipe::new().context("creating the shutdown pipe")?;
    shutdown.route_signal(libc::SIGINT)?;
    shutdown.route_signal(libc::SIGTERM)?;

    let checkpoints = Arc::new(
        CheckpointStore::open(&config.checkpoint).context("opening the checkpoint store")?,
    );
    let fabric = QueueFabric::open(&config.queue).context("opening the queue fabric")?;
    let policy = LongestWaitingFirst::from_config(&config.scheduler);

    let scheduler = ModelScheduler::spawn(
        config.scheduler.clone(),
        config.runner.clone(),
        fabric,
        checkpoints,
        reaper,
        Box::new(policy),
    )
    .context("starting the scheduler")?;

    let signals = shutdown.wait()?;
    info!("Received signal(s) {signals:?}, shutting down");
    scheduler.stop();
    info!("Model swapper stopped");
    Ok(())
}

fn parse_model(model: &str) -> Result<ModelId> {
    ModelId::new(model).with_context(|| format!("invalid model id {model:?}"))
}

fn client(config: &SwapperConfig) -> Result<ModelSwapperClient> {
    let fabric = QueueFabric::open(&config.queue).context("opening the queue fabric")?;
    Ok(ModelSwapperClient::new(fabric, config.client.clone())?)
}

fn submit(config: &SwapperConfig, model: &ModelId, file: Option<&Path>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("cannot read stdin")?,
    };
    let rows: Vec<ModelInputRow> = serde_json::from_str(&text).context("rows are not a JSON array")?;
    if rows.is_empty() {
        bail!("no rows to submit");
    }

    let client = client(config)?;
    let batches = chunk_rows(rows, client.batch_size());
    let total = batches.len();
    for batch in batches {
        let command_id = client.submit_requests(model, batch)?;
        println!("{command_id}");
    }
    info!("Submitted {total} batch(es) for {model} at {}", Utc::now());
    Ok(())
}

fn print_results(config: &SwapperConfig, limit: Option<usize>, wait: Duration) -> Result<()> {
    let fabric = QueueFabric::open(&config.queue).context("opening the queue fabric")?;
    let client = ModelSwapperClient::new(fabric, config.client.clone())?;
    let consumer = client.consume_results()?;

    let started = Instant::now();
    let mut printed = 0usize;
    while limit.map_or(true, |limit| printed < limit) {
        let Some(result) = consumer.next(wait)? else {
            break;
        };
        print_result(&result)?;
        printed += 1;
    }
    if printed == 0 {
        warn!("No results within {:?}", started.elapsed());
    }
    Ok(())
}

fn print_result(result: &ModelResult) -> Result<()> {
    println!("{}", serde_json::to_string(result)?);
    Ok(())
}
