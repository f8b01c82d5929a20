use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use siamese_search::{
    Config, Indexer, ProjectionEmbedder, QueryEngine, QueryHit, load_embedder,
    preprocess::Preprocessor,
    server::{self, AppState},
    triplets::{Augmenter, TripletGenerator, evaluate_triplets},
};

#[derive(Parser)]
#[command(name = "siamese-search", version, about = "Nearest-image search over siamese embeddings")]
struct Cli {
    /// JSON config file; defaults to ./siamese.json when present.
    #[arg(long, env = "SIAMESE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a fresh projection model checkpoint to the configured model path.
    InitModel {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = ProjectionEmbedder::DEFAULT_GRID)]
        grid: usize,
        /// Overwrite an existing checkpoint.
        #[arg(long)]
        force: bool,
    },
    /// Embed the corpus and (re)build the index.
    Index {
        /// Corpus directory, overrides `data` from the config.
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Query one image, or every image of the query dataset.
    Query {
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Mean triplet loss and accuracy of the model on the validation dataset.
    EvalTriplets {
        #[arg(long, default_value_t = 256)]
        count: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        augment: bool,
    },
    /// Serve queries over HTTP.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::InitModel { seed, grid, force } => init_model(&config, seed, grid, force),
        Command::Index { data } => build_index(&config, data.as_deref()),
        Command::Query { image, k } => query(&config, image.as_deref(), k),
        Command::EvalTriplets {
            count,
            seed,
            augment,
        } => eval_triplets(&config, count, seed, augment),
        Command::Serve => serve(config).await,
    }
}

fn init_model(config: &Config, seed: u64, grid: usize, force: bool) -> Result<()> {
    let path = &config.model_path;
    anyhow::ensure!(
        force || !path.exists(),
        "model already exists at '{}' (use --force to overwrite)",
        path.display()
    );
    let model = ProjectionEmbedder::init(config.image_size, grid, config.embedding_dim, seed)?;
    model.save(path)?;
    info!("model written to '{}'", path.display());
    Ok(())
}

fn build_index(config: &Config, data: Option<&Path>) -> Result<()> {
    let embedder = load_embedder(config).context("there is no model to load")?;
    let data = data.unwrap_or(config.data.as_path());
    let report = Indexer::new(embedder.as_ref(), config.index_kind)
        .normalize(config.normalize_embeddings)
        .build(data, &config.index_path)
        .with_context(|| format!("indexing {}", data.display()))?;
    println!(
        "{} index with {} rows written to {} (build {})",
        report.manifest.kind,
        report.manifest.rows,
        report.files.index.display(),
        report.manifest.build_id
    );
    Ok(())
}

fn open_engine(config: &Config) -> Result<QueryEngine> {
    let embedder = load_embedder(config).context("there is no model to load")?;
    QueryEngine::open(embedder, &config.index_path, config.index_kind)
        .with_context(|| format!("opening index {}", config.index_path.display()))
}

fn query(config: &Config, image: Option<&Path>, k: Option<usize>) -> Result<()> {
    let engine = open_engine(config)?;
    let k = k.unwrap_or(config.n_results);
    match image {
        Some(path) => print_hits(path, &engine.query_path(path, k)?),
        None => {
            for (q, hits) in engine.query_dir(&config.query_data, k)? {
                print_hits(&q, &hits);
            }
        }
    }
    Ok(())
}

fn print_hits(query: &Path, hits: &[QueryHit]) {
    println!("query: {}", query.display());
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "  {:>2}. {:.3}  [{}] {}",
            rank + 1,
            hit.distance,
            hit.row,
            hit.path.display()
        );
    }
}

fn eval_triplets(config: &Config, count: usize, seed: u64, augment: bool) -> Result<()> {
    let embedder = load_embedder(config).context("there is no model to load")?;
    let pre = Preprocessor::new(embedder.input_size());
    let generator = TripletGenerator::from_dir(&config.valid_data, seed)
        .with_context(|| format!("reading {}", config.valid_data.display()))?;
    let mut augmenter = augment.then(|| Augmenter::new(seed.wrapping_add(1)));

    let embed = |path: &Path| -> siamese_search::Result<Vec<f32>> {
        let mut tensor = pre.load(path)?;
        if let Some(aug) = augmenter.as_mut() {
            aug.apply(&mut tensor);
        }
        siamese_search::embedder::finish(embedder.as_ref(), &tensor, true)
    };
    let report = evaluate_triplets(embed, generator.take(count), config.margin)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let embedder = load_embedder(&config).context("there is no model to load")?;
    let index_path = config.index_path.clone();
    let kind = config.index_kind;
    let state = AppState::new(
        move || QueryEngine::open(embedder.clone(), &index_path, kind),
        config.n_results,
    )
    .await
    .context("loading index")?
    .allow_paths_under([&config.data, &config.query_data]);
    server::serve(&config.bind, state).await
}
