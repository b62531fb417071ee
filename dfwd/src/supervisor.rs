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

//! Wires the components together and owns the process lifecycle.

use crate::{config::Store, external::Loader, worker};
use anyhow::{Context, Result};
use drelay::{persist, DefaultsHandle, MemoryCache, Router, TableHandle};
use log::*;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time};

/// Period of the cache persistence ticker.
const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Period of the cache statistics log line.
const STATS_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Largest client datagram accepted on the listener.
const MAX_LEN: usize = 4096;

/// Run the forwarder until a termination signal or a listener failure.
pub async fn run(config_path: PathBuf) -> Result<()> {
    let table = Arc::new(TableHandle::new());
    let defaults = Arc::new(DefaultsHandle::new());

    let store = Store::open(config_path.clone(), table.clone(), defaults.clone())
        .context("reading the configuration file")?;
    let loader = Arc::new(Loader::new(store.clone()));
    loader.refresh().await;

    let cfg = store.current();

    let cache = if cfg.cache.enabled {
        let cache = Arc::new(MemoryCache::new());
        match persist::load(&cfg.cache.path) {
            Ok(Some(snapshot)) if !snapshot.is_empty() => {
                cache.load(snapshot);
                info!("restored cache from disk ({} entries)", cache.len());
            }
            Ok(_) => debug!("no persisted cache to restore"),
            Err(e) => error!("error loading cache from disk: {}", e),
        }
        Some(cache)
    } else {
        info!("cache is disabled");
        None
    };

    let router = Arc::new(Router::new(table, defaults, cache.clone()));

    let socket = Arc::new(
        UdpSocket::bind(&cfg.listen)
            .await
            .with_context(|| format!("binding UDP listener on {}", cfg.listen))?,
    );
    info!("server listening on {}", cfg.listen);

    // Keep the watcher alive for the whole serve loop; dropping it stops the
    // notifications.
    let (watcher, mut reload_rx) = watch_config(&config_path)?;

    let mut feed_tick = time::interval(cfg.feed_interval());
    let mut persist_tick = time::interval(PERSIST_INTERVAL);
    let mut stats_tick = time::interval(STATS_INTERVAL);
    // The first tick of a tokio interval fires immediately; consume it so the
    // periodic work starts one period from now.
    feed_tick.tick().await;
    persist_tick.tick().await;
    stats_tick.tick().await;

    let persisting = Arc::new(AtomicBool::new(false));
    let mut buf = [0u8; MAX_LEN];

    let shutdown = terminate();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("termination signal received, shutting down");
                break Ok(());
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    let packet = buf[..len].to_vec();
                    let router = router.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker::handle(router, socket, packet, src).await {
                            warn!("handling query failed: {}", e);
                        }
                    });
                }
                Err(e) => break Err(e).context("listener failure"),
            },
            _ = feed_tick.tick() => {
                let loader = loader.clone();
                tokio::spawn(async move { loader.refresh().await });
            }
            _ = persist_tick.tick() => {
                if let Some(cache) = &cache {
                    persist_in_background(cache, &store.current().cache.path, &persisting);
                }
            }
            _ = stats_tick.tick() => {
                if let Some(cache) = &cache {
                    info!("cache size: {}", cache.len());
                }
            }
            event = reload_rx.recv() => {
                if event.is_some() {
                    reload(&store, &loader).await;
                }
            }
        }
    };

    // Watcher first, then the final persist; in-flight workers still hold
    // their own handles on the socket and cache.
    drop(watcher);
    if let Some(cache) = &cache {
        persist_now(cache, &store.current().cache.path).await;
    }

    outcome
}

// Snapshot the cache and hand the disk write to the blocking pool. A tick that
// lands while the previous write is still in flight is skipped.
fn persist_in_background(cache: &Arc<MemoryCache>, path: &Path, busy: &Arc<AtomicBool>) {
    if cache.is_empty() {
        debug!("no cache to persist");
        return;
    }
    if busy.swap(true, Ordering::SeqCst) {
        debug!("previous cache persist still running, skipping");
        return;
    }

    let snapshot = cache.get_all();
    let path = path.to_owned();
    let busy = busy.clone();
    tokio::task::spawn_blocking(move || {
        info!("persisting cache to disk ({} entries)", snapshot.len());
        if let Err(e) = persist::save(&path, &snapshot) {
            error!("error persisting cache: {}", e);
        }
        busy.store(false, Ordering::SeqCst);
    });
}

// Shutdown-path persist: runs to completion before the process exits.
async fn persist_now(cache: &MemoryCache, path: &Path) {
    if cache.is_empty() {
        debug!("no cache to persist");
        return;
    }
    let snapshot = cache.get_all();
    info!("persisting cache to disk ({} entries)", snapshot.len());
    let path = path.to_owned();
    match tokio::task::spawn_blocking(move || persist::save(&path, &snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("error persisting cache: {}", e),
        Err(e) => error!("cache persist task failed: {}", e),
    }
}

async fn reload(store: &Arc<Store>, loader: &Arc<Loader>) {
    info!("config file changed, loading new configuration");
    // Let the writer finish before re-reading.
    time::sleep(Duration::from_millis(100)).await;
    if let Err(e) = store.reload() {
        error!("failed to reload config file: {}", e);
        return;
    }
    loader.refresh().await;
}

// Bridge notify events into the tokio world. Watching the parent directory is
// more reliable than watching the file itself across editors and tools that
// write via rename-replace.
fn watch_config(path: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let file = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let file_name = file.file_name().map(|n| n.to_owned());

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if ours && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("error watching config file: {}", e),
        },
        notify::Config::default(),
    )?;

    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    let _ = tokio::signal::ctrl_c().await;
}
