// ABOUTME: Entry point for the aedb binary.
// ABOUTME: Inspects, reads and tails .pridb/.tradb/.trfdb files, printing one JSON object per line.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use aedb_core::ChannelId;
use aedb_core::extract::PeakAmplitude;
use aedb_store::{
    CancelToken, EventStore, ExtractOptions, FeatureStore, Follow, OpenMode, ReadFilter, Store, StoreConfig,
    StoreKind, StoreLocation, WaveformStore, extract_features,
};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "aedb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print GlobalInfo, row count, tables and channels of a store
    Info {
        file: PathBuf,
    },

    /// Print the rows of a store as JSON lines
    Read {
        file: PathBuf,

        #[command(flatten)]
        filter: FilterArgs,

        /// Return Int16 waveform samples as ADC counts
        #[arg(long)]
        raw: bool,
    },

    /// Follow a store and print rows as they are written
    Tail {
        file: PathBuf,

        #[command(flatten)]
        filter: FilterArgs,

        /// Replay the rows already in the store first
        #[arg(long)]
        existing: bool,

        /// Stop once the writer has closed the store and all rows are printed
        #[arg(long)]
        until_idle: bool,
    },

    /// Compute peak amplitude features for every waveform into a features store
    Extract {
        waveforms: PathBuf,
        features: PathBuf,

        /// Worker threads (0 = one per CPU)
        #[arg(short, long, default_value_t = 0)]
        workers: usize,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Window start in seconds
    #[arg(long)]
    start: Option<f64>,

    /// Window stop in seconds (inclusive)
    #[arg(long)]
    stop: Option<f64>,

    /// Only these channels (repeatable)
    #[arg(short, long)]
    channel: Vec<ChannelId>,

    /// Extra SQL predicate, e.g. "Amp > 5000"
    #[arg(long)]
    sql: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> ReadFilter {
        let mut filter = ReadFilter::new().channels(self.channel).time(self.start, self.stop);
        if let Some(sql) = self.sql {
            filter = filter.sql(sql);
        }
        filter
    }
}

fn kind_of(path: &Path) -> Result<StoreKind> {
    StoreKind::from_path(path)
        .with_context(|| format!("{}: expected a .pridb, .tradb or .trfdb file", path.display()))
}

fn print_lines<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        serde_json::to_writer(&mut out, &row)?;
        writeln!(out)?;
    }
    Ok(())
}

fn info(path: &Path, config: &StoreConfig) -> Result<()> {
    let kind = kind_of(path)?;
    let handle = StoreLocation::new(path, kind, OpenMode::ReadOnly).open(config)?;
    let summary = serde_json::json!({
        "path": path,
        "kind": kind,
        "rows": handle.info().valid_sets(),
        "global_info": handle.info(),
        "tables": handle.tables()?,
        "columns": handle.columns()?,
        "channels": handle.channels()?,
        "field_info": handle.field_info()?,
    });
    print_lines([summary])
}

fn read(path: &Path, filter: ReadFilter, raw: bool, config: &StoreConfig) -> Result<()> {
    match kind_of(path)? {
        StoreKind::Events => print_lines(EventStore::open_with(path, OpenMode::ReadOnly, config)?.read(&filter)?),
        StoreKind::Waveforms => {
            print_lines(WaveformStore::open_with(path, OpenMode::ReadOnly, config)?.read(&filter, raw)?)
        }
        StoreKind::Features => print_lines(FeatureStore::open_with(path, OpenMode::ReadOnly, config)?.read(&filter)?),
    }
}

fn tail(path: &Path, filter: ReadFilter, existing: bool, until_idle: bool, config: &StoreConfig) -> Result<()> {
    let mut options = config.tail_options();
    if existing {
        options = options.from_start();
    }
    if until_idle {
        options = options.follow(Follow::UntilIdle);
    }
    let cancel = CancelToken::new();

    match kind_of(path)? {
        StoreKind::Events => {
            let store = EventStore::open_with(path, OpenMode::ReadOnly, config)?;
            for row in store.tail(options, &filter, cancel) {
                print_lines([row?])?;
            }
            Ok(())
        }
        StoreKind::Waveforms => {
            let store = WaveformStore::open_with(path, OpenMode::ReadOnly, config)?;
            for row in store.tail(options, &filter, cancel, false) {
                print_lines([row?])?;
            }
            Ok(())
        }
        StoreKind::Features => {
            let store = FeatureStore::open_with(path, OpenMode::ReadOnly, config)?;
            for row in store.tail(options, &filter, cancel)? {
                print_lines([row?])?;
            }
            Ok(())
        }
    }
}

fn extract(waveforms: &Path, features: &Path, workers: usize, config: &StoreConfig) -> Result<()> {
    if kind_of(waveforms)? != StoreKind::Waveforms || kind_of(features)? != StoreKind::Features {
        bail!("usage: aedb extract <file.tradb> <file.trfdb>");
    }
    let location = StoreLocation::new(waveforms, StoreKind::Waveforms, OpenMode::ReadOnly);
    let mut store = FeatureStore::open_with(features, OpenMode::CreateIfMissing, config)?;
    let options = ExtractOptions {
        workers,
        ..ExtractOptions::default()
    };
    let summary = extract_features(&location, &mut store, &PeakAmplitude, &options, config)?;
    print_lines([summary])
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "aedb=debug,aedb_store=debug" } else { "aedb=info,aedb_store=info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = StoreConfig::from_env().context("loading AEDB_* settings")?;
    tracing::debug!(?config, "aedb starting");

    match cli.command {
        Commands::Info { file } => info(&file, &config),
        Commands::Read { file, filter, raw } => read(&file, filter.into_filter(), raw, &config),
        Commands::Tail {
            file,
            filter,
            existing,
            until_idle,
        } => tail(&file, filter.into_filter(), existing, until_idle, &config),
        Commands::Extract {
            waveforms,
            features,
            workers,
        } => extract(&waveforms, &features, workers, &config),
    }
}
