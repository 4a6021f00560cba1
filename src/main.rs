// ========================================================================================
//
//                              THE COMMAND LINE: WAVEPCA
//
// ========================================================================================
//
// Parses arguments, layers CLI flags over an optional TOML config, opens the feature
// table and hands it to the engine. All numerical work lives in the library.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use wavepca::config::{Algorithm, IncrementalScaler, ReduceConfig};
use wavepca::embedding::{OutputLayout, write_factors};
use wavepca::incremental::IncrementalArtifact;
use wavepca::pipeline::{reduce_with_progress, transform_with_progress};
use wavepca::progress::ConsoleProgress;
use wavepca::source::ChunkSource;
use wavepca::standardize::ZeroVariancePolicy;
use wavepca::table::{MissingPolicy, TableOptions, TsvChunkSource};

// ========================================================================================
//                                  ARGUMENT TYPES
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "wavepca",
    about = "Out-of-core principal components for wide wavelet feature tables",
    long_about = "Streams a tab-delimited feature table in row chunks and reduces it to a \
                  subject-indexed principal component embedding, using either a three-pass \
                  randomized SVD or a single-pass incremental PCA."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit components on a table and write its embedding
    Reduce(ReduceArgs),
    /// Embed a table with a saved incremental model, without refitting
    Transform(TransformArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmCli {
    Randomized,
    Incremental,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScalerCli {
    Bootstrap,
    FullPass,
}

#[derive(Clone, Copy, ValueEnum)]
enum ZeroVarianceCli {
    Drop,
    ZeroFill,
}

#[derive(Clone, Copy, ValueEnum)]
enum MissingCli {
    Fail,
    Exclude,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutCli {
    Plain,
    Plink,
}

#[derive(Args)]
struct TableArgs {
    /// Identifier column name (defaults to the first column)
    #[arg(long)]
    id_column: Option<String>,

    /// Keep only feature columns whose header contains this substring
    #[arg(long)]
    feature_filter: Option<String>,

    /// How non-numeric and missing cells are handled
    #[arg(long, value_enum)]
    missing: Option<MissingCli>,

    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Embedding table layout
    #[arg(long, value_enum)]
    layout: Option<LayoutCli>,
}

#[derive(Args)]
struct ReduceArgs {
    /// Tab-delimited feature table (optionally .gz)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Embedding output path
    #[arg(long, short)]
    output: PathBuf,

    /// TOML file with run settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    table: TableArgs,

    /// Number of components
    #[arg(long, short = 'k')]
    components: Option<usize>,

    /// Extra sketch columns for the randomized path
    #[arg(long)]
    oversampling: Option<usize>,

    /// Extra sketch refinement rounds for the randomized path (two passes each)
    #[arg(long)]
    power_iterations: Option<usize>,

    /// Seed for the Gaussian test matrix
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    algorithm: Option<AlgorithmCli>,

    /// Standardizer source for the incremental path
    #[arg(long, value_enum)]
    incremental_scaler: Option<ScalerCli>,

    /// Treatment of features whose variance does not exceed the epsilon
    #[arg(long, value_enum)]
    zero_variance: Option<ZeroVarianceCli>,

    #[arg(long)]
    variance_epsilon: Option<f64>,

    /// Directory for the U, S and Vt factor tables (randomized path)
    #[arg(long)]
    factors_dir: Option<PathBuf>,

    /// Path for the fitted model artifact (incremental path)
    #[arg(long)]
    model_out: Option<PathBuf>,
}

#[derive(Args)]
struct TransformArgs {
    /// Tab-delimited feature table (optionally .gz)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Model artifact written by `reduce --model-out`
    #[arg(long)]
    model: PathBuf,

    /// Embedding output path
    #[arg(long, short)]
    output: PathBuf,

    #[command(flatten)]
    table: TableArgs,
}

// ========================================================================================
//                                  CONFIG LAYERING
// ========================================================================================

fn apply_table_args(config: &mut ReduceConfig, args: &TableArgs) {
    if let Some(column) = &args.id_column {
        config.id_column = Some(column.clone());
    }
    if let Some(filter) = &args.feature_filter {
        config.feature_filter = Some(filter.clone());
    }
    if let Some(missing) = args.missing {
        config.missing = match missing {
            MissingCli::Fail => MissingPolicy::Fail,
            MissingCli::Exclude => MissingPolicy::Exclude,
        };
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(layout) = args.layout {
        config.layout = match layout {
            LayoutCli::Plain => OutputLayout::Plain,
            LayoutCli::Plink => OutputLayout::Plink,
        };
    }
}

fn build_config(args: &ReduceArgs) -> Result<ReduceConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ReduceConfig::load(path)?,
        None => ReduceConfig::default(),
    };
    apply_table_args(&mut config, &args.table);

    if let Some(k) = args.components {
        config.components = k;
    }
    if let Some(p) = args.oversampling {
        config.oversampling = p;
    }
    if let Some(q) = args.power_iterations {
        config.power_iterations = q;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(epsilon) = args.variance_epsilon {
        config.variance_epsilon = epsilon;
    }
    if let Some(algorithm) = args.algorithm {
        config.algorithm = match algorithm {
            AlgorithmCli::Randomized => Algorithm::Randomized,
            AlgorithmCli::Incremental => Algorithm::Incremental,
        };
    }
    if let Some(scaler) = args.incremental_scaler {
        config.incremental_scaler = match scaler {
            ScalerCli::Bootstrap => IncrementalScaler::Bootstrap,
            ScalerCli::FullPass => IncrementalScaler::FullPass,
        };
    }
    if let Some(policy) = args.zero_variance {
        config.zero_variance = match policy {
            ZeroVarianceCli::Drop => ZeroVariancePolicy::Drop,
            ZeroVarianceCli::ZeroFill => ZeroVariancePolicy::ZeroFill,
        };
    }
    config.validate()?;
    Ok(config)
}

// ========================================================================================
//                                   SUBCOMMANDS
// ========================================================================================

fn run_reduce(args: ReduceArgs) -> Result<(), Box<dyn Error>> {
    let config = build_config(&args)?;
    if args.model_out.is_some() && config.algorithm != Algorithm::Incremental {
        log::warn!("--model-out only applies to the incremental algorithm and will be ignored");
    }
    if args.factors_dir.is_some() && config.algorithm != Algorithm::Randomized {
        log::warn!("--factors-dir only applies to the randomized algorithm and will be ignored");
    }

    let start = Instant::now();
    let mut source = TsvChunkSource::open(&args.input, config.table_options())?;
    eprintln!(
        "> Reading {} feature columns from {}",
        source.feature_names().len(),
        args.input.display()
    );

    let mut progress = ConsoleProgress::new();
    let outcome = reduce_with_progress(&mut source, &config, &mut progress)?;

    outcome.embedding.write_tsv(&args.output, config.layout)?;
    eprintln!(
        "> Wrote {} rows x {} components to {}",
        outcome.embedding.n_rows(),
        outcome.embedding.n_components(),
        args.output.display()
    );

    if let (Some(dir), Some(factors)) = (&args.factors_dir, &outcome.factors) {
        write_factors(dir, factors)?;
        eprintln!("> Wrote U, S and Vt to {}", dir.display());
    }
    if let (Some(path), Some(artifact)) = (&args.model_out, outcome.artifact()) {
        artifact.save(path)?;
        eprintln!("> Saved model to {}", path.display());
    }

    eprintln!(
        "> Finished {} passes in {:.2?}",
        outcome.passes,
        start.elapsed()
    );
    Ok(())
}

fn run_transform(args: TransformArgs) -> Result<(), Box<dyn Error>> {
    let mut config = ReduceConfig::default();
    apply_table_args(&mut config, &args.table);
    config.validate()?;

    let artifact = IncrementalArtifact::load(&args.model)?;
    let options: TableOptions = config.table_options();
    let mut source = TsvChunkSource::open(&args.input, options)?;

    let mut progress = ConsoleProgress::new();
    let embedding = transform_with_progress(&mut source, &artifact, config.chunk_size, &mut progress)?;
    embedding.write_tsv(&args.output, config.layout)?;
    eprintln!(
        "> Wrote {} rows x {} components to {}",
        embedding.n_rows(),
        embedding.n_components(),
        args.output.display()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Reduce(args) => run_reduce(args),
        Commands::Transform(args) => run_transform(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
