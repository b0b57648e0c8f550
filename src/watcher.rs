use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Debounced file-change notifier (§4.6). `notify`'s callback fires on a std
/// thread with a std `mpsc` channel under the hood, so the watcher itself
/// runs on a dedicated OS thread with its own single-threaded tokio runtime;
/// events are forwarded into the async world over a tokio channel, where a
/// second task debounces and invokes `on_data_change`.
pub struct Watcher {
    cancel: CancellationToken,
}

impl Watcher {
    /// Watches `paths` (one or more — the "single-path and paired-path
    /// variants" of §4.6 are both just `watch` called with a `Vec` of one or
    /// more entries). On any write event to any of them, (re)start a
    /// debounce timer; when it fires, call `on_data_change` once per watched
    /// path with a fresh reader opened at fire time.
    pub fn watch<F>(paths: Vec<PathBuf>, debounce: Duration, on_data_change: F) -> Self
    where
        F: Fn(&Path) -> std::io::Result<()> + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let cancel_for_thread = cancel.clone();
        let (tx, mut rx) = mpsc::channel::<PathBuf>(100);

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    error!(error = %err, "failed to start watcher runtime");
                    return;
                }
            };

            rt.block_on(async move {
                let (raw_tx, mut raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

                let mut watcher = match RecommendedWatcher::new(
                    move |res| {
                        let _ = raw_tx.send(res);
                    },
                    notify::Config::default(),
                ) {
                    Ok(w) => w,
                    Err(err) => {
                        error!(error = %err, "failed to create file watcher");
                        return;
                    }
                };

                for path in &paths {
                    if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
                        error!(error = %err, path = %path.display(), "failed to watch path");
                    }
                }

                loop {
                    if cancel_for_thread.is_cancelled() {
                        break;
                    }

                    match raw_rx.try_recv() {
                        Ok(Ok(event)) => {
                            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                                for path in &event.paths {
                                    let _ = tx.send(path.clone()).await;
                                }
                            }
                        }
                        Ok(Err(err)) => warn!(error = %err, "watcher event error"),
                        Err(std::sync::mpsc::TryRecvError::Empty) => {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(std::sync::mpsc::TryRecvError::Disconnected) => break,
                    }
                }
            });
        });

        let cancel_for_debounce = cancel.clone();
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut pending: Option<PathBuf> = None;

            loop {
                tokio::select! {
                    _ = cancel_for_debounce.cancelled() => break,
                    maybe_path = rx.recv() => {
                        match maybe_path {
                            Some(path) => {
                                last_event = Some(Instant::now());
                                pending = Some(path);
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {
                        if let (Some(at), Some(path)) = (last_event, pending.take()) {
                            if at.elapsed() >= debounce {
                                last_event = None;
                                if let Err(err) = on_data_change(&path) {
                                    error!(error = %err, path = %path.display(), "on_data_change failed");
                                }
                            } else {
                                pending = Some(path);
                            }
                        }
                    }
                }
            }
        });

        Watcher { cancel }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
