use anyhow::{Context, Result};
use presence_core::{EngineConfig, TiePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: an optional TOML file, then `PRESENCE_*` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    pub engine: EngineConfig,
}

/// On-disk layout of the file named by `PRESENCE_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    engine: EngineConfig,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match lookup("PRESENCE_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let db_path = lookup("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&lookup).join("gallery.db"));

        let mut engine = file.engine;
        let fusion = &mut engine.fusion;
        fusion.min_samples = env_parse(&lookup, "PRESENCE_FUSION_MIN_SAMPLES", fusion.min_samples);
        fusion.quality_floor = env_parse(&lookup, "PRESENCE_QUALITY_FLOOR", fusion.quality_floor);
        fusion.outlier_factor = env_parse(&lookup, "PRESENCE_OUTLIER_FACTOR", fusion.outlier_factor);

        engine.dimension = env_parse(&lookup, "PRESENCE_DIMENSION", engine.dimension);
        engine.threshold = env_parse(&lookup, "PRESENCE_THRESHOLD", engine.threshold);
        engine.tie_tolerance = env_parse(&lookup, "PRESENCE_TIE_TOLERANCE", engine.tie_tolerance);
        engine.min_enroll_images =
            env_parse(&lookup, "PRESENCE_MIN_ENROLL_IMAGES", engine.min_enroll_images);
        engine.max_enroll_images =
            env_parse(&lookup, "PRESENCE_MAX_ENROLL_IMAGES", engine.max_enroll_images);
        engine.l2_normalize = env_parse(&lookup, "PRESENCE_L2_NORMALIZE", engine.l2_normalize);
        if let Some(policy) = lookup("PRESENCE_TIE_POLICY") {
            engine.tie_policy = parse_tie_policy(&policy)?;
        }

        Ok(Self { db_path, engine })
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn default_data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn parse_tie_policy(value: &str) -> Result<TiePolicy> {
    match value.trim() {
        "prefer_most_recent" | "recent" => Ok(TiePolicy::PreferMostRecent),
        "reject" => Ok(TiePolicy::Reject),
        other => anyhow::bail!("PRESENCE_TIE_POLICY: unknown policy {other:?}"),
    }
}

/// Parse `key` if set and well-formed, else keep `default`.
fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
