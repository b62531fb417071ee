// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Configuration file model and the shared store publishing it.

use drelay::{
    table::TableHandle,
    upstream::{normalize_server, DefaultsHandle, Upstream},
};
use hashbrown::HashMap;
use log::LevelFilter;
use regex::Regex;
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};
use thiserror::Error;

/// Errors from reading or compiling the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The file is not valid YAML for the expected shape.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// An upstream regex failed to compile.
    #[error("invalid pattern for upstream {upstream}: {source}")]
    Pattern {
        /// Name of the upstream group the pattern belongs to.
        upstream: String,
        /// Compile error reported by the regex engine.
        #[source]
        source: regex::Error,
    },
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[serde(remote = "LevelFilter")]
enum LevelFilterDef {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn default_log_level() -> LevelFilter {
    LevelFilter::Info
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./cache.gob")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub server: RawServer,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub upstreams: Vec<RawUpstream>,
    #[serde(default)]
    pub external_upstreams: Vec<FeedConfig>,
    #[serde(default)]
    pub external_upstreams_interval: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServer {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub default_upstream: Vec<String>,
    #[serde(with = "LevelFilterDef", default = "default_log_level")]
    pub log_level: LevelFilter,
}

#[derive(Deserialize, Clone)]
pub struct CacheSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_cache_path(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct RawUpstream {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(rename = "regex", default)]
    pub patterns: Vec<String>,
}

#[derive(Deserialize, Clone)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Parsed and compiled configuration snapshot. Replaced wholesale on reload.
pub struct Config {
    /// `host:port` the UDP listener binds to.
    pub listen: String,
    /// Default upstream servers, normalized to `host:port`.
    pub default_upstreams: Vec<String>,
    pub log_level: LevelFilter,
    pub cache: CacheSection,
    /// Locally configured upstream groups, compiled, in author order.
    pub upstreams: Vec<Upstream>,
    pub feeds: Vec<FeedConfig>,
    feed_interval_minutes: i64,
}

impl Config {
    /// Read and compile the configuration at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Compile a configuration out of its YAML text.
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(data)?;

        let mut upstreams = Vec::with_capacity(raw.upstreams.len());
        for u in raw.upstreams {
            upstreams.push(compile_upstream(u)?);
        }

        Ok(Self {
            listen: format!("{}:{}", raw.server.host, raw.server.port),
            default_upstreams: raw
                .server
                .default_upstream
                .iter()
                .map(|s| normalize_server(s))
                .collect(),
            log_level: raw.server.log_level,
            cache: raw.cache,
            upstreams,
            feeds: raw.external_upstreams,
            feed_interval_minutes: raw.external_upstreams_interval,
        })
    }

    /// Period of the external feed refresh ticker. Five minutes unless the
    /// configured value is positive.
    pub fn feed_interval(&self) -> Duration {
        let minutes = if self.feed_interval_minutes > 0 {
            self.feed_interval_minutes as u64
        } else {
            5
        };
        Duration::from_secs(minutes * 60)
    }
}

/// Compile one raw upstream group into its normalized, regex-compiled form.
pub fn compile_upstream(raw: RawUpstream) -> Result<Upstream, ConfigError> {
    let mut patterns = Vec::with_capacity(raw.patterns.len());
    for p in &raw.patterns {
        patterns.push(Regex::new(p).map_err(|source| ConfigError::Pattern {
            upstream: raw.name.clone(),
            source,
        })?);
    }
    Ok(Upstream::new(raw.name, raw.servers, patterns))
}

/// Shared configuration store.
///
/// Owns the current snapshot and the per-feed upstream slots, and keeps the
/// routing handles it was wired with coherent: every successful read publishes
/// the new defaults, applies the log level and rebuilds the match table.
pub struct Store {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    feeds: RwLock<HashMap<String, Vec<Upstream>>>,
    table: Arc<TableHandle>,
    defaults: Arc<DefaultsHandle>,
}

impl Store {
    /// Read the configuration at `path` and build the store around it.
    pub fn open(
        path: PathBuf,
        table: Arc<TableHandle>,
        defaults: Arc<DefaultsHandle>,
    ) -> Result<Arc<Self>, ConfigError> {
        let cfg = Arc::new(Config::from_file(&path)?);
        let store = Arc::new(Self {
            path,
            current: RwLock::new(cfg),
            feeds: RwLock::new(HashMap::new()),
            table,
            defaults,
        });
        store.publish();
        Ok(store)
    }

    /// The current configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.current.read().unwrap().clone()
    }

    /// Re-read the configuration file and publish the new snapshot.
    ///
    /// On error the previous snapshot stays in effect and nothing is
    /// republished.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let cfg = Arc::new(Config::from_file(&self.path)?);
        *self.current.write().unwrap() = cfg;
        self.publish();
        Ok(())
    }

    // Push the active snapshot out to the routing handles and the logger.
    fn publish(&self) {
        let cfg = self.current();
        log::set_max_level(cfg.log_level);
        self.defaults.replace(cfg.default_upstreams.clone());
        self.rebuild_table();
    }

    /// Replace the upstream slot owned by feed `url`.
    ///
    /// Does not rebuild the table; callers batch their slot changes and call
    /// [`Store::rebuild_table`] once.
    pub fn install_feed(&self, url: &str, upstreams: Vec<Upstream>) {
        self.feeds.write().unwrap().insert(url.to_owned(), upstreams);
    }

    /// Rebuild the match table from the local upstreams followed by the feed
    /// slots in configuration order.
    pub fn rebuild_table(&self) {
        let cfg = self.current();
        let slots = self.feeds.read().unwrap();
        let mut combined: Vec<&Upstream> = cfg.upstreams.iter().collect();
        for feed in &cfg.feeds {
            if let Some(slot) = slots.get(&feed.url) {
                combined.extend(slot.iter());
            }
        }
        self.table.rebuild(combined);
    }
}
