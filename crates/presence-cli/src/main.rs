mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use presence_core::{
    Embedding, Engine, EnrollmentSample, IdentityKey, RegisterOutcome, WriteMode,
};
use presence_store::SqliteStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presence", about = "Presence face enrollment and matching CLI")]
struct Cli {
    /// Gallery database (overrides PRESENCE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from embedding files, one capture per file
    Enroll {
        /// Identity key (e.g. employee id)
        id: String,
        /// JSON files, each an array of floats or {"embedding": [...], "quality": 0.9}
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Replace an existing enrollment instead of refusing
        #[arg(long)]
        replace: bool,
    },
    /// Identify the person an embedding belongs to
    Recognize {
        /// JSON file holding the probe embedding
        file: PathBuf,
        /// Euclidean distance threshold for this lookup
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Check an embedding against one enrolled identity
    Verify {
        id: String,
        file: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        id: String,
    },
    /// List enrolled identities
    List,
    /// Show gallery status
    Status,
}

/// One capture on disk.
#[derive(Deserialize)]
#[serde(untagged)]
enum CaptureFile {
    Bare(Vec<f32>),
    Scored {
        embedding: Vec<f32>,
        quality: Option<f32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let engine = open_engine(&config)?;

    match cli.command {
        Commands::Enroll { id, files, replace } => {
            let key = IdentityKey::new(id)?;
            let dim = config.engine.dimension;
            let samples = files
                .iter()
                .map(|path| read_capture(path, dim))
                .collect::<Result<Vec<_>>>()?;
            let mode = if replace {
                WriteMode::Replace
            } else {
                WriteMode::CreateOnly
            };
            let outcome = engine.register_samples(key, samples, mode)?;
            print_json(&outcome)?;
            if !matches!(outcome, RegisterOutcome::Created(_)) {
                std::process::exit(2);
            }
        }
        Commands::Recognize { file, threshold } => {
            let probe = read_capture(&file, config.engine.dimension)?.embedding;
            let result = match threshold {
                Some(t) => engine.recognize_with_threshold(&probe, t)?,
                None => engine.recognize_embedding(&probe)?,
            };
            print_json(&result)?;
            if !result.is_match() {
                std::process::exit(1);
            }
        }
        Commands::Verify { id, file } => {
            let key = IdentityKey::new(id)?;
            let probe = read_capture(&file, config.engine.dimension)?.embedding;
            let outcome = engine.verify_embedding(&key, &probe)?;
            print_json(&outcome)?;
            if !matches!(outcome, presence_core::VerifyOutcome::Verified { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Remove { id } => {
            let key = IdentityKey::new(id)?;
            engine.remove(&key)?;
            println!("Removed {key}");
        }
        Commands::List => {
            let identities = engine.list();
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}\tv{}\tupdated {}",
                    identity.identity,
                    identity.version,
                    identity.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                );
            }
        }
        Commands::Status => {
            #[derive(Serialize)]
            struct Status<'a> {
                database: &'a Path,
                #[serde(flatten)]
                engine: presence_core::EngineStatus,
            }
            print_json(&Status {
                database: &config.db_path,
                engine: engine.status(),
            })?;
        }
    }

    Ok(())
}

fn open_engine(config: &Config) -> Result<Engine> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening gallery at {}", config.db_path.display()))?;
    let engine = Engine::new(config.engine.clone())?.with_store(Box::new(store));

    let summary = engine.load_from_store()?;
    if !summary.corrupted.is_empty() {
        tracing::warn!(
            corrupted = ?summary.corrupted,
            "some stored identities could not be loaded"
        );
    }
    tracing::debug!(loaded = summary.loaded, db = %config.db_path.display(), "gallery ready");
    Ok(engine)
}

fn read_capture(path: &Path, dim: usize) -> Result<EnrollmentSample> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let capture: CaptureFile = serde_json::from_str(&text)
        .with_context(|| format!("{}: expected an embedding array", path.display()))?;
    let (values, quality) = match capture {
        CaptureFile::Bare(values) => (values, None),
        CaptureFile::Scored { embedding, quality } => (embedding, quality),
    };
    let embedding = Embedding::with_dim(values, dim)
        .with_context(|| format!("{}: invalid embedding", path.display()))?;
    let mut sample = EnrollmentSample::new(embedding);
    sample.quality = quality;
    Ok(sample)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
