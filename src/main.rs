//! CLI entry point for the FCD analyzer.
//!
//! Provides subcommands for splitting raw vehicle positions into trips,
//! aggregating matched edge visits per road segment, aggregating the same
//! visits over a lat/lon grid, and filtering any CSV by the area its
//! geometries lie in.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fcd_analyzer::aggregator::{AggregatorState, DirectedEdge, TimeBucket};
use fcd_analyzer::config::{BucketBoundaries, PipelineConfig};
use fcd_analyzer::filter::{AreaFilter, filter_records};
use fcd_analyzer::geo::{BoundingBox, CoordinateOrder};
use fcd_analyzer::input::{read_edge_visits, read_positions, read_records};
use fcd_analyzer::output::{
    SinkOptions, write_edge_detailed, write_edge_simple, write_grid_detailed, write_grid_simple,
    write_records, write_trip_positions, write_trips,
};
use fcd_analyzer::pipeline::{Pipeline, PipelineReport};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "fcd_analyzer")]
#[command(about = "Trip segmentation and road segment visit statistics for floating car data", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    LatLon,
    LonLat,
}

impl From<OrderArg> for CoordinateOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::LatLon => CoordinateOrder::LatLon,
            OrderArg::LonLat => CoordinateOrder::LonLat,
        }
    }
}

/// Run settings. Flags override the JSON config file, which overrides the
/// built-in defaults.
#[derive(Args)]
struct Settings {
    /// JSON config file
    #[arg(short, long, global = true, env = "FCD_CONFIG")]
    config: Option<PathBuf>,

    /// Order of the numbers in WKT coordinate pairs
    #[arg(long, global = true, value_enum)]
    coordinate_order: Option<OrderArg>,

    /// Minutes without a new position that end a trip
    #[arg(long, global = true, env = "FCD_STATIONARY_GAP_MINUTES")]
    stationary_gap_minutes: Option<i64>,

    /// Trips with this many positions or fewer are discarded
    #[arg(long, global = true, env = "FCD_MINIMUM_TRIP_LENGTH")]
    minimum_trip_length: Option<usize>,

    /// End trips at midnight (`--split-at-midnight=false` lets them cross it)
    #[arg(
        long,
        global = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    split_at_midnight: Option<bool>,

    /// Visits of an edge closer than this to the previous one are merged
    #[arg(long, global = true, env = "FCD_MINIMUM_VISIT_GAP_SECS")]
    minimum_visit_gap_secs: Option<i64>,

    /// Past visits remembered per edge for out-of-order arrivals
    #[arg(long, global = true)]
    lookback_limit: Option<usize>,

    /// Start hours of the four time buckets, e.g. 0,6,12,18
    #[arg(long, global = true, value_delimiter = ',', num_args = 4)]
    bucket_starts: Option<Vec<u32>>,

    /// Only keep rows whose geometry lies inside MIN_LAT,MAX_LAT,MIN_LON,MAX_LON
    #[arg(
        long,
        global = true,
        value_delimiter = ',',
        num_args = 4,
        allow_hyphen_values = true
    )]
    area: Option<Vec<f64>>,

    /// CSV field delimiter of the input files
    #[arg(long, global = true, default_value_t = ',')]
    delimiter: char,

    /// Gzip compress output files
    #[arg(long, global = true, default_value_t = false)]
    gzip: bool,

    /// Append to existing output files instead of replacing them
    #[arg(long, global = true, default_value_t = false)]
    append: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Split raw positions into trips
    Segment {
        /// CSV with owner_id, timestamp, geometry
        #[arg(value_name = "POSITIONS")]
        input: PathBuf,

        /// CSV to write one row per trip to
        #[arg(short, long, default_value = "trips.csv")]
        output: PathBuf,

        /// Optional: CSV to write every position of every trip to
        #[arg(long)]
        positions_output: Option<PathBuf>,
    },
    /// Aggregate matched edge visits per directed edge, day and time bucket
    Aggregate {
        /// CSV with owner_id, begin_at, end_at, origin_id, destination_id
        #[arg(value_name = "EDGE_VISITS")]
        input: PathBuf,

        /// CSV to write per edge and day statistics to
        #[arg(long, default_value = "edges_detailed.csv")]
        detailed: PathBuf,

        /// CSV to write lifetime statistics per edge to
        #[arg(long, default_value = "edges_simple.csv")]
        simple: PathBuf,

        /// Optional: continue from a state written with --checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Optional: write the aggregation state here after ingesting
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Aggregate matched edge visits over a lat/lon grid
    Grid {
        /// CSV with edge visits and their the_geom
        #[arg(value_name = "EDGE_VISITS")]
        input: PathBuf,

        /// CSV to write per cell and day statistics to
        #[arg(long, default_value = "grid_detailed.csv")]
        detailed: PathBuf,

        /// CSV to write lifetime statistics per cell to
        #[arg(long, default_value = "grid_simple.csv")]
        simple: PathBuf,

        #[arg(long)]
        rows: Option<usize>,

        #[arg(long)]
        columns: Option<usize>,

        /// Minutes a vehicle must stay in a cell to be counted again
        #[arg(long)]
        min_minutes_between_hits: Option<i64>,
    },
    /// Copy the rows of a CSV whose geometry lies inside --area
    Filter {
        /// Any headed CSV with a WKT geometry column
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(short, long, default_value = "filtered.csv")]
        output: PathBuf,

        /// Name of the WKT geometry column
        #[arg(long, default_value = "the_geom")]
        geometry_column: String,
    },
}

impl Settings {
    fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(order) = self.coordinate_order {
            config.coordinate_order = order.into();
        }
        if let Some(minutes) = self.stationary_gap_minutes {
            config.segmenter.stationary_gap_minutes = minutes;
        }
        if let Some(length) = self.minimum_trip_length {
            config.segmenter.minimum_trip_length = length;
        }
        if let Some(split) = self.split_at_midnight {
            config.segmenter.allow_cross_day_trips = !split;
        }
        if let Some(secs) = self.minimum_visit_gap_secs {
            config.aggregator.minimum_gap_secs = secs;
        }
        if self.lookback_limit.is_some() {
            config.aggregator.lookback_limit = self.lookback_limit;
        }
        if let Some(starts) = &self.bucket_starts {
            let starts: [u32; 4] = starts
                .as_slice()
                .try_into()
                .context("--bucket-starts takes exactly four hours")?;
            config.aggregator.buckets = BucketBoundaries { starts };
        }
        if let Some(area) = &self.area {
            let [min_lat, max_lat, min_lon, max_lon]: [f64; 4] = area
                .as_slice()
                .try_into()
                .context("--area takes exactly four numbers")?;
            config.area = Some(BoundingBox::new(min_lat, max_lat, min_lon, max_lon));
        }
        Ok(config)
    }

    fn delimiter(&self) -> Result<u8> {
        u8::try_from(self.delimiter).context("--delimiter must be a single-byte character")
    }

    fn sink(&self) -> SinkOptions {
        SinkOptions {
            gzip: self.gzip,
            append: self.append,
        }
    }
}

fn output_path(path: &Path, gzip: bool) -> PathBuf {
    if gzip && path.extension() != Some(OsStr::new("gz")) {
        let mut name = path.as_os_str().to_owned();
        name.push(".gz");
        PathBuf::from(name)
    } else {
        path.to_path_buf()
    }
}

fn log_report(report: &PipelineReport) {
    info!(
        rows_read = report.rows_read,
        skipped = report.skipped.total(),
        unreadable = report.skipped.unreadable,
        bad_timestamp = report.skipped.bad_timestamp,
        bad_geometry = report.skipped.bad_geometry,
        invalid_coordinates = report.skipped.invalid_coordinates,
        missing_field = report.skipped.missing_field,
        outside_area = report.outside_area,
        "Input summary"
    );
    if report.match_failures.total() > 0 {
        warn!(
            no_route = report.match_failures.no_route,
            trace_too_large = report.match_failures.trace_too_large,
            transport = report.match_failures.transport,
            "Trips dropped by the map matcher"
        );
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/fcd_analyzer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("fcd_analyzer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("RUST_LOG")
                .from_env_lossy(),
        );

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .with_env_var("RUST_LOG_JSON")
                .from_env_lossy(),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = &cli.settings;
    let config = settings.load_config()?;
    let delimiter = settings.delimiter()?;
    let sink = settings.sink();

    match cli.command {
        Commands::Segment {
            input,
            output,
            positions_output,
        } => {
            let pipeline = Pipeline::new(config)?;
            let rows = read_positions(&input, delimiter)?;
            let run = pipeline.segment_rows(rows)?;
            log_report(&run.report);

            write_trips(output_path(&output, sink.gzip), sink, &run.trips)?;
            if let Some(path) = positions_output {
                write_trip_positions(output_path(&path, sink.gzip), sink, &run.trips)?;
            }
        }
        Commands::Aggregate {
            input,
            detailed,
            simple,
            resume,
            checkpoint,
        } => {
            for bucket in TimeBucket::ALL {
                info!(
                    bucket = bucket.name(),
                    hours = %config.aggregator.buckets.label(bucket),
                    "Time bucket"
                );
            }
            let pipeline = Pipeline::new(config)?;

            let state = match &resume {
                Some(path) => {
                    let bytes = std::fs::read(path)
                        .with_context(|| format!("reading checkpoint {}", path.display()))?;
                    let state: AggregatorState<DirectedEdge> = AggregatorState::restore(&bytes)?;
                    info!(path = %path.display(), edges = state.len(), "Resuming from checkpoint");
                    state
                }
                None => AggregatorState::new(),
            };

            let rows = read_edge_visits(&input, delimiter)?;
            let run = pipeline.aggregate_edge_visits(state, rows)?;
            log_report(&run.report);

            if let Some(path) = &checkpoint {
                std::fs::write(path, run.state.checkpoint()?)
                    .with_context(|| format!("writing checkpoint {}", path.display()))?;
                info!(path = %path.display(), "Checkpoint written");
            }

            let report = pipeline.finalize(&run.state);
            write_edge_detailed(output_path(&detailed, sink.gzip), sink, &report)?;
            write_edge_simple(
                output_path(&simple, sink.gzip),
                sink,
                &report,
                &run.attributes,
            )?;
        }
        Commands::Grid {
            input,
            detailed,
            simple,
            rows,
            columns,
            min_minutes_between_hits,
        } => {
            let mut config = config;
            if let Some(rows) = rows {
                config.grid.rows = rows;
            }
            if let Some(columns) = columns {
                config.grid.columns = columns;
            }
            if let Some(minutes) = min_minutes_between_hits {
                config.grid.min_minutes_between_hits = minutes;
            }
            let pipeline = Pipeline::new(config)?;

            let visit_rows = read_edge_visits(&input, delimiter)?;
            let run = pipeline.aggregate_edge_visits(AggregatorState::new(), visit_rows)?;
            log_report(&run.report);

            let grid_run = pipeline.grid_coverage(&run.visits)?;
            write_grid_detailed(
                output_path(&detailed, sink.gzip),
                sink,
                &grid_run.aggregation,
                &grid_run.grid,
            )?;
            write_grid_simple(
                output_path(&simple, sink.gzip),
                sink,
                &grid_run.aggregation,
                &grid_run.grid,
            )?;
        }
        Commands::Filter {
            input,
            output,
            geometry_column,
        } => {
            config.validate()?;
            let area = config
                .area
                .context("filter needs --area or an area in the config file")?;
            let filter = AreaFilter::new(area, config.coordinate_order)?;

            let (header, records) = read_records(&input, delimiter)?;
            let column = header
                .iter()
                .position(|name| *name == geometry_column)
                .with_context(|| {
                    format!("no column {geometry_column} in {}", input.display())
                })?;
            let (kept, _report) = filter_records(&filter, column, records);
            write_records(output_path(&output, sink.gzip), sink, header, kept)?;
        }
    }

    Ok(())
}
