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

//! Periodic loader for externally hosted upstream definitions.

use crate::config::{compile_upstream, ConfigError, FeedConfig, RawUpstream, Store};
use drelay::Upstream;
use futures::future::join_all;
use hashbrown::HashMap;
use log::*;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use thiserror::Error;

/// Feed fetches time out after this long, connection setup included.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from fetching or decoding one external feed. Logged and skipped;
/// a broken feed never affects the others.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("feed returned status {0}")]
    Status(reqwest::StatusCode),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Document shape served by a feed: the `upstreams:` section of the local
/// configuration under a top-level key.
#[derive(Deserialize)]
struct ExternalDocument {
    #[serde(default)]
    upstreams: Vec<RawUpstream>,
}

/// Fetches the configured feeds and keeps their upstream slots in the store.
///
/// Each feed owns one slot keyed by its URL; a changed body replaces the slot
/// wholesale, so entries removed upstream disappear locally on the next pass.
pub struct Loader {
    http: reqwest::Client,
    hashes: RwLock<HashMap<String, String>>,
    store: Arc<Store>,
}

impl Loader {
    /// Create a loader over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            hashes: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Run one pass over every configured feed.
    ///
    /// Feeds are fetched in parallel; each changed feed replaces its own slot,
    /// and the match table is rebuilt exactly once at the end if anything
    /// changed. Failures are logged and never propagate.
    pub async fn refresh(&self) {
        let feeds = self.store.current().feeds.clone();
        if feeds.is_empty() {
            return;
        }

        let passes = feeds.iter().map(|feed| self.ingest(feed));
        let changed = join_all(passes).await.into_iter().filter(|c| *c).count();

        if changed > 0 {
            debug!("{} feed(s) changed, rebuilding match table", changed);
            self.store.rebuild_table();
        }
    }

    // One feed: fetch, hash-gate, parse, install. True when the slot changed.
    async fn ingest(&self, feed: &FeedConfig) -> bool {
        debug!("fetching upstreams from {}", feed.url);
        let body = match self.fetch(feed).await {
            Ok(body) => body,
            Err(e) => {
                warn!("error fetching upstreams from {}: {}", feed.url, e);
                return false;
            }
        };

        let digest = hex::encode(Sha256::digest(&body));
        if self.hashes.read().unwrap().get(&feed.url) == Some(&digest) {
            debug!("upstreams from {} unchanged, skipping", feed.url);
            return false;
        }

        let upstreams = match parse_document(&body) {
            Ok(upstreams) => upstreams,
            Err(e) => {
                warn!("error decoding upstreams from {}: {}", feed.url, e);
                return false;
            }
        };

        info!(
            "updating upstreams from {}: found {} upstream(s)",
            feed.url,
            upstreams.len()
        );
        self.store.install_feed(&feed.url, upstreams);
        self.hashes
            .write()
            .unwrap()
            .insert(feed.url.clone(), digest);
        true
    }

    async fn fetch(&self, feed: &FeedConfig) -> Result<Vec<u8>, FeedError> {
        let mut req = self.http.get(&feed.url).header(ACCEPT, "application/yaml");

        // A bearer token wins over basic auth when both are configured.
        match (
            feed.token.as_deref().filter(|t| !t.is_empty()),
            feed.username.as_deref().filter(|u| !u.is_empty()),
            feed.password.as_deref(),
        ) {
            (Some(token), _, _) => req = req.bearer_auth(token),
            (None, Some(user), Some(pass)) => req = req.basic_auth(user, Some(pass)),
            _ => {}
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(FeedError::Status(resp.status()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

fn parse_document(body: &[u8]) -> Result<Vec<Upstream>, FeedError> {
    let doc: ExternalDocument = serde_yaml::from_slice(body)?;
    let mut upstreams = Vec::with_capacity(doc.upstreams.len());
    for raw in doc.upstreams {
        upstreams.push(compile_upstream(raw)?);
    }
    Ok(upstreams)
}

#[cfg(test)]
mod tests {
    use super::Loader;
    use crate::config::Store;
    use drelay::{table::TableHandle, upstream::DefaultsHandle};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    const FEED_ONE: &str =
        "upstreams:\n  - name: feed\n    servers:\n      - 10.9.0.1\n    regex:\n      - '^feed\\.example\\.$'\n";
    const FEED_TWO: &str =
        "upstreams:\n  - name: feed\n    servers:\n      - 10.9.0.2\n    regex:\n      - '^other\\.example\\.$'\n";

    // Minimal HTTP server: every request is answered with the body whose index
    // is the request count, capped at the last one. Request heads are recorded.
    async fn http_server(
        status: &'static str,
        bodies: &'static [&'static str],
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            let counter = AtomicUsize::new(0);
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let body = bodies[n.min(bodies.len() - 1)];
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let len = stream.read(&mut buf).await.unwrap_or(0);
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&buf[..len]).into_owned());
                    let resp = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/yaml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("http://{}", addr), requests)
    }

    fn store_with_feed(url: &str, extra: &str) -> (Arc<Store>, Arc<TableHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            format!(
                "server:\n  host: 127.0.0.1\n  port: 0\n  defaultUpstream: [1.1.1.1]\nexternalUpstreams:\n  - url: {}\n{}",
                url, extra
            ),
        )
        .unwrap();

        let table = Arc::new(TableHandle::new());
        let store = Store::open(path, table.clone(), Arc::new(DefaultsHandle::new())).unwrap();
        (store, table)
    }

    #[tokio::test]
    async fn unchanged_body_is_ingested_once() {
        let (url, _) = http_server("200 OK", &[FEED_ONE]).await;
        let (store, table) = store_with_feed(&url, "");
        let loader = Loader::new(store);

        loader.refresh().await;
        assert_eq!(
            table.lookup("feed.example.").unwrap().first().unwrap(),
            "10.9.0.1:53"
        );
        let generation = table.snapshot();

        // Same body again: no new ingest, no table rebuild.
        loader.refresh().await;
        assert!(Arc::ptr_eq(&generation, &table.snapshot()));
    }

    #[tokio::test]
    async fn changed_body_replaces_the_feed_slot() {
        let (url, _) = http_server("200 OK", &[FEED_ONE, FEED_TWO]).await;
        let (store, table) = store_with_feed(&url, "");
        let loader = Loader::new(store);

        loader.refresh().await;
        assert!(table.lookup("feed.example.").is_some());

        loader.refresh().await;
        // The slot is keyed by URL: the removed upstream is gone, not appended to.
        assert!(table.lookup("feed.example.").is_none());
        assert_eq!(
            table.lookup("other.example.").unwrap().first().unwrap(),
            "10.9.0.2:53"
        );
    }

    #[tokio::test]
    async fn non_success_status_is_skipped() {
        let (url, _) = http_server("500 Internal Server Error", &[FEED_ONE]).await;
        let (store, table) = store_with_feed(&url, "");
        let loader = Loader::new(store);

        loader.refresh().await;
        assert!(table.lookup("feed.example.").is_none());
    }

    #[tokio::test]
    async fn undecodable_body_is_skipped() {
        let (url, _) = http_server("200 OK", &["upstreams: [not, a, list, of, maps]"]).await;
        let (store, table) = store_with_feed(&url, "");
        let loader = Loader::new(store);

        loader.refresh().await;
        assert!(table.lookup("feed.example.").is_none());
    }

    #[tokio::test]
    async fn bearer_token_wins_over_basic_auth() {
        let (url, requests) = http_server("200 OK", &[FEED_ONE]).await;
        let (store, _) = store_with_feed(
            &url,
            "    token: tok123\n    username: alice\n    password: hunter2\n",
        );
        let loader = Loader::new(store);

        loader.refresh().await;

        let head = requests.lock().unwrap().first().unwrap().to_ascii_lowercase();
        assert!(head.contains("authorization: bearer tok123"));
        assert!(!head.contains("basic"));
        assert!(head.contains("accept: application/yaml"));
    }

    #[tokio::test]
    async fn basic_auth_applies_without_token() {
        let (url, requests) = http_server("200 OK", &[FEED_ONE]).await;
        let (store, _) = store_with_feed(&url, "    username: alice\n    password: hunter2\n");
        let loader = Loader::new(store);

        loader.refresh().await;

        let head = requests.lock().unwrap().first().unwrap().to_ascii_lowercase();
        assert!(head.contains("authorization: basic"));
    }
}
