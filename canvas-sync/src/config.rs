use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use canvas_core::{CanvasClient, CanvasError};
use serde::Deserialize;
use url::Url;

use crate::sync::SyncOptions;
use crate::sync::pipeline::DEFAULT_CHANNEL_CAPACITY;
use crate::sync::transfer::DEFAULT_DOWNLOAD_WORKERS;

pub const DEFAULT_CONFIG_FILE_NAME: &str = ".canvassync.json";

pub const ENV_CONFIG: &str = "CANVAS_SYNC_CONFIG";
pub const ENV_URL: &str = "CANVAS_URL";
pub const ENV_TOKEN: &str = "CANVAS_TOKEN";
pub const ENV_DIRECTORY: &str = "CANVAS_SYNC_DIR";
pub const ENV_DOWNLOAD_WORKERS: &str = "CANVAS_DOWNLOAD_WORKERS";

/// Shape of `~/.canvassync.json`. Every field may also come from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    url: Option<String>,
    token: Option<String>,
    directory: Option<String>,
    ignored_courses: Vec<u64>,
}

#[derive(Clone)]
pub struct SyncConfig {
    pub url: String,
    pub token: String,
    pub directory: PathBuf,
    pub ignored_courses: HashSet<u64>,
    pub download_workers: usize,
    pub channel_capacity: usize,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("directory", &self.directory)
            .field("ignored_courses", &self.ignored_courses)
            .field("download_workers", &self.download_workers)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl SyncConfig {
    /// Loads the config file and applies environment overrides.
    ///
    /// `explicit` is the `--config` argument. Without it `CANVAS_SYNC_CONFIG`
    /// is consulted, then `~/.canvassync.json`; only the default file may be
    /// absent.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::load_with(explicit, &home, |name| std::env::var(name).ok())
    }

    pub fn load_with<F>(explicit: Option<&Path>, home: &Path, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match env(ENV_CONFIG) {
                Some(value) => (expand_with_home(&value, home), true),
                None => (home.join(DEFAULT_CONFIG_FILE_NAME), false),
            },
        };
        let file = read_config_file(&path, required)?;

        let url = env(ENV_URL).or(file.url).unwrap_or_default();
        let token = env(ENV_TOKEN).or(file.token).unwrap_or_default();
        let directory = env(ENV_DIRECTORY).or(file.directory).unwrap_or_default();
        let download_workers = read_usize(&env, ENV_DOWNLOAD_WORKERS, DEFAULT_DOWNLOAD_WORKERS);

        let url = url.trim().to_string();
        if url.is_empty() {
            anyhow::bail!("no Canvas url configured; set `url` in {} or {ENV_URL}", path.display());
        }
        Url::parse(&url).with_context(|| format!("invalid Canvas url {url:?}"))?;
        if token.trim().is_empty() {
            anyhow::bail!(
                "no access token configured; set `token` in {} or {ENV_TOKEN}",
                path.display()
            );
        }
        if directory.trim().is_empty() {
            anyhow::bail!(
                "no sync directory configured; set `directory` in {} or {ENV_DIRECTORY}",
                path.display()
            );
        }

        Ok(Self {
            url,
            token: token.trim().to_string(),
            directory: expand_with_home(directory.trim(), home),
            ignored_courses: file.ignored_courses.into_iter().collect(),
            download_workers,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    pub fn client(&self) -> Result<CanvasClient, CanvasError> {
        CanvasClient::new(&self.url, self.token.clone())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            directory: self.directory.clone(),
            ignored_courses: self.ignored_courses.clone(),
            download_workers: self.download_workers,
            channel_capacity: self.channel_capacity,
        }
    }
}

fn read_config_file(path: &Path, required: bool) -> anyhow::Result<FileConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
            tracing::debug!(path = %path.display(), "no config file, using environment only");
            return Ok(FileConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("cannot open config file {}", path.display()));
        }
    };
    serde_json::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_usize<F>(env: &F, name: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    env(name)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
