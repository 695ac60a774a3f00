use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use super::bundle;
use super::{
    ConfigDocument, DIAG_DUPLICATE_COMMAND, Route, RouteMeta, RoutingSnapshot,
    SNAPSHOT_FORMAT_VERSION, ServiceEntry, SnapshotDiagnostic,
};
use crate::protocol::{SDK_SCHEMA_VERSION, ServiceKind, ServiceManifest};
use crate::sandbox::runtime;
use crate::store::{ServiceBundle, Store, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("invalid manifest for {service_id}: {reason}")]
    ManifestInvalid { service_id: String, reason: String },

    #[error("failed to read service source {entry}: {source}")]
    SourceIo {
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration document: {0}")]
    Config(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
}

/// Compiles chat configurations into routing snapshots, producing and
/// storing missing service bundles along the way. Builds are single-flight
/// per configuration hash.
pub struct SnapshotBuilder {
    store: Arc<Store>,
    services_root: PathBuf,
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Canonical JSON text and content hash for a configuration document value.
pub fn canonical_config(doc: &serde_json::Value) -> Result<(String, String), serde_json::Error> {
    let json = serde_json::to_string(doc)?;
    let hash = bundle::content_hash(&json);
    Ok((json, hash))
}

impl SnapshotBuilder {
    pub fn new(store: Arc<Store>, services_root: PathBuf) -> Self {
        Self {
            store,
            services_root,
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Compile (or fetch the cached) snapshot for a chat. A chat without a
    /// configuration gets an ephemeral empty snapshot. On build failure the
    /// previously persisted snapshot, if any, stays active.
    pub async fn build_snapshot(
        &self,
        chat_id: &str,
        force: bool,
    ) -> Result<RoutingSnapshot, BuildError> {
        let Some(record) = self.store.get_chat_config(chat_id)? else {
            tracing::debug!(chat_id, "chat has no configuration, routing nothing");
            return Ok(RoutingSnapshot::empty());
        };
        let config_hash = record.config_hash.clone();

        let gate = {
            let mut builds = self.builds.lock().await;
            builds
                .entry(config_hash.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        if !force {
            if let Some(snapshot) = self.cached(&config_hash)? {
                return Ok(snapshot);
            }
        }

        let doc: ConfigDocument = serde_json::from_str(&record.config_json)?;
        let snapshot = self.compile(&doc, &config_hash)?;

        // Replacing the row is a single statement, so an in-flight reader
        // sees either the old snapshot or the new one, never neither.
        self.store
            .save_snapshot(&config_hash, &serde_json::to_string(&snapshot)?)?;

        tracing::info!(
            chat_id,
            config_hash = %config_hash,
            commands = snapshot.commands.len(),
            listeners = snapshot.listeners.len(),
            diagnostics = snapshot.diagnostics.len(),
            "snapshot built"
        );
        Ok(snapshot)
    }

    fn cached(&self, config_hash: &str) -> Result<Option<RoutingSnapshot>, BuildError> {
        let Some(json) = self.store.load_snapshot(config_hash)? else {
            return Ok(None);
        };
        let snapshot: RoutingSnapshot = match serde_json::from_str(&json) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(config_hash, error = %e, "cached snapshot unreadable, rebuilding");
                return Ok(None);
            }
        };
        if snapshot.sdk_schema_version != SDK_SCHEMA_VERSION {
            tracing::info!(
                config_hash,
                cached = snapshot.sdk_schema_version,
                current = SDK_SCHEMA_VERSION,
                "cached snapshot built against a different sdk schema, rebuilding"
            );
            return Ok(None);
        }
        if snapshot.integrity != snapshot.compute_integrity() {
            tracing::warn!(config_hash, "cached snapshot failed integrity check, rebuilding");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    fn compile(
        &self,
        doc: &ConfigDocument,
        config_hash: &str,
    ) -> Result<RoutingSnapshot, BuildError> {
        let mut commands: BTreeMap<String, Route> = BTreeMap::new();
        let mut listeners = Vec::new();
        let mut diagnostics = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut ordered_hashes = Vec::new();

        for entry in &doc.services {
            let path = self.resolve_entry(&entry.entry)?;
            let source = std::fs::read_to_string(&path).map_err(|e| BuildError::SourceIo {
                entry: entry.entry.clone(),
                source: e,
            })?;

            let (bundle_hash, bundle_text) = bundle::bundle_source(&source);
            let manifest = runtime::extract_manifest(&bundle_text).map_err(|e| {
                BuildError::ManifestInvalid {
                    service_id: entry.service_id.clone(),
                    reason: e.to_string(),
                }
            })?;
            validate_manifest(entry, &manifest)?;

            if !seen_ids.insert(manifest.id.clone()) {
                return Err(BuildError::ManifestInvalid {
                    service_id: manifest.id,
                    reason: "service id declared twice in one configuration".into(),
                });
            }

            self.store.save_service_bundle(&ServiceBundle {
                bundle_hash: bundle_hash.clone(),
                service_id: manifest.id.clone(),
                version: manifest.version.clone(),
                data_url: bundle::encode_data_url(&bundle_text),
            })?;
            ordered_hashes.push(bundle_hash.clone());

            // The configuration may remap the command token per chat; the
            // manifest supplies the default.
            let token = entry
                .command
                .clone()
                .or_else(|| manifest.command.clone())
                .map(|t| t.to_lowercase());

            let route = Route {
                service_id: manifest.id.clone(),
                kind: entry.kind,
                bundle_hash,
                config: entry.config.clone(),
                datasets: entry.datasets.clone(),
                net: entry.net.clone(),
                meta: RouteMeta {
                    id: manifest.id.clone(),
                    command: token.clone(),
                    description: manifest.description.clone(),
                },
            };

            match entry.kind {
                ServiceKind::Listener => listeners.push(route),
                ServiceKind::SingleCommand | ServiceKind::CommandFlow => {
                    let Some(token) = token else {
                        return Err(BuildError::ManifestInvalid {
                            service_id: route.service_id,
                            reason: "non-listener service has no command token".into(),
                        });
                    };
                    if commands.contains_key(&token) {
                        tracing::warn!(
                            service_id = %route.service_id,
                            token = %token,
                            "duplicate command token, first declaration wins"
                        );
                        diagnostics.push(SnapshotDiagnostic {
                            code: DIAG_DUPLICATE_COMMAND.into(),
                            service_id: route.service_id,
                            message: format!("command '{token}' already routed, first declaration wins"),
                        });
                    } else {
                        commands.insert(token, route);
                    }
                }
            }
        }

        let source_sig = bundle::content_hash(&ordered_hashes.join("\n"));
        let mut snapshot = RoutingSnapshot {
            commands,
            listeners,
            built_at: Utc::now(),
            version: SNAPSHOT_FORMAT_VERSION,
            sdk_schema_version: SDK_SCHEMA_VERSION,
            source_sig,
            config_hash: config_hash.to_string(),
            integrity: String::new(),
            diagnostics,
        };
        snapshot.integrity = snapshot.compute_integrity();
        Ok(snapshot)
    }

    fn resolve_entry(&self, entry: &str) -> Result<PathBuf, BuildError> {
        let path = Path::new(entry);
        let escapes = path.is_absolute()
            || path.components().any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(BuildError::SourceIo {
                entry: entry.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "entry path escapes the services root",
                ),
            });
        }
        Ok(self.services_root.join(path))
    }

    /// Drop snapshot rows whose configuration hash no chat currently uses.
    /// Run ahead of bundle GC so dead cache entries stop pinning bundles.
    pub fn prune_stale_snapshots(&self) -> Result<Vec<String>, StoreError> {
        let active: HashSet<String> = self.store.list_config_hashes()?.into_iter().collect();
        let mut pruned = Vec::new();
        for (config_hash, _) in self.store.list_snapshots()? {
            if !active.contains(&config_hash) {
                self.store.delete_snapshot(&config_hash)?;
                pruned.push(config_hash);
            }
        }
        if !pruned.is_empty() {
            tracing::info!(pruned = pruned.len(), "pruned snapshots with no assigned chat");
        }
        Ok(pruned)
    }

    /// Delete every bundle no live snapshot references. If any snapshot row
    /// is unreadable its references are unknown, so nothing is deleted.
    pub async fn gc_orphan_bundles(&self) -> Result<GcReport, StoreError> {
        let mut live: BTreeSet<String> = BTreeSet::new();
        for (config_hash, json) in self.store.list_snapshots()? {
            match serde_json::from_str::<RoutingSnapshot>(&json) {
                Ok(snapshot) => live.extend(snapshot.bundle_hashes()),
                Err(e) => {
                    tracing::error!(
                        config_hash = %config_hash,
                        error = %e,
                        "unreadable snapshot row, skipping bundle gc"
                    );
                    return Ok(GcReport {
                        deleted: vec![],
                        kept: self.store.list_all_bundle_hashes()?,
                    });
                }
            }
        }

        let all = self.store.list_all_bundle_hashes()?;
        let (deleted, kept): (Vec<String>, Vec<String>) =
            all.into_iter().partition(|h| !live.contains(h));
        self.store.delete_bundles(&deleted)?;

        if !deleted.is_empty() {
            tracing::info!(deleted = deleted.len(), kept = kept.len(), "gc removed orphan bundles");
        }
        Ok(GcReport { deleted, kept })
    }
}

fn validate_manifest(entry: &ServiceEntry, manifest: &ServiceManifest) -> Result<(), BuildError> {
    let fail = |reason: String| {
        Err(BuildError::ManifestInvalid {
            service_id: entry.service_id.clone(),
            reason,
        })
    };

    if manifest.id.is_empty() {
        return fail("manifest id is empty".into());
    }
    if manifest.id != entry.service_id {
        return fail(format!(
            "manifest id '{}' does not match configured serviceId '{}'",
            manifest.id, entry.service_id
        ));
    }
    if manifest.kind != entry.kind {
        return fail(format!(
            "manifest kind '{}' does not match configured kind '{}'",
            manifest.kind, entry.kind
        ));
    }
    if !manifest.version_is_valid() {
        return fail(format!("version '{}' is not major.minor.patch", manifest.version));
    }
    if manifest.kind != ServiceKind::Listener
        && entry.command.is_none()
        && manifest.command.is_none()
    {
        return fail("non-listener service declares no command".into());
    }
    if manifest.schema_version != SDK_SCHEMA_VERSION {
        return fail(format!(
            "sdk schema version {} is not supported (current: {})",
            manifest.schema_version, SDK_SCHEMA_VERSION
        ));
    }
    Ok(())
}
