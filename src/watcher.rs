use std::path::PathBuf;
use std::sync::Arc;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};

use crate::snapshot::builder::SnapshotBuilder;
use crate::store::Store;

/// Watches the services root for edits to `.rhai` sources and force-rebuilds
/// every configured chat's snapshot. A failed rebuild leaves the previous
/// snapshot active, so a half-saved service never takes a chat down.
pub struct SourceWatcher {
    /// Keep the debouncer alive — dropping it stops the watcher.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl SourceWatcher {
    pub fn start(
        services_root: PathBuf,
        store: Arc<Store>,
        builder: Arc<SnapshotBuilder>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&services_root)?;

        let rt = tokio::runtime::Handle::current();

        let mut debouncer = new_debouncer(
            std::time::Duration::from_millis(500),
            move |events: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = %e, "fs watcher error");
                        return;
                    }
                };

                let touched_source = events.iter().any(|event| {
                    event.kind == DebouncedEventKind::Any
                        && event.path.extension().and_then(|e| e.to_str()) == Some("rhai")
                });
                if !touched_source {
                    return;
                }

                let store = store.clone();
                let builder = builder.clone();
                rt.spawn(async move {
                    let chat_ids = match store.list_chat_ids() {
                        Ok(ids) => ids,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to list chats after source change");
                            return;
                        }
                    };

                    tracing::info!(chats = chat_ids.len(), "service source changed, rebuilding snapshots");
                    for chat_id in chat_ids {
                        if let Err(e) = builder.build_snapshot(&chat_id, true).await {
                            tracing::error!(
                                chat_id = %chat_id,
                                error = %e,
                                "rebuild after source change failed, previous snapshot stays active"
                            );
                        }
                    }
                });
            },
        )?;

        use notify::RecursiveMode;
        debouncer
            .watcher()
            .watch(&services_root, RecursiveMode::Recursive)?;

        tracing::info!(dir = %services_root.display(), "service source watcher started");

        Ok(Self { _debouncer: debouncer })
    }
}
