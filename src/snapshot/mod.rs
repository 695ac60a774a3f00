pub mod builder;
pub mod bundle;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{SDK_SCHEMA_VERSION, ServiceKind};

/// Format version of the persisted snapshot JSON.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ── Configuration document (input) ──────────────────────────────────

/// Per-chat configuration as produced by the external config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub config_id: String,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub service_id: String,
    pub kind: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Logical path of the service source below the services root.
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
}

// ── Routing snapshot (output) ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-chat binding of a command token or listener slot to a service bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub service_id: String,
    pub kind: ServiceKind,
    pub bundle_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
    pub meta: RouteMeta,
}

/// Diagnostic retained in snapshot metadata (non-fatal build findings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiagnostic {
    pub code: String,
    pub service_id: String,
    pub message: String,
}

pub const DIAG_DUPLICATE_COMMAND: &str = "duplicate_command";

/// The compiled, persisted routing table for one configuration.
///
/// `commands` is a `BTreeMap` so serialization order, and therefore the
/// integrity hash, is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSnapshot {
    pub commands: BTreeMap<String, Route>,
    pub listeners: Vec<Route>,
    pub built_at: DateTime<Utc>,
    pub version: u32,
    pub sdk_schema_version: u32,
    pub source_sig: String,
    pub config_hash: String,
    pub integrity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<SnapshotDiagnostic>,
}

impl RoutingSnapshot {
    /// Snapshot for a chat with no configuration: routes nothing.
    pub fn empty() -> Self {
        let mut snapshot = Self {
            commands: BTreeMap::new(),
            listeners: Vec::new(),
            built_at: Utc::now(),
            version: SNAPSHOT_FORMAT_VERSION,
            sdk_schema_version: SDK_SCHEMA_VERSION,
            source_sig: String::new(),
            config_hash: String::new(),
            integrity: String::new(),
            diagnostics: Vec::new(),
        };
        snapshot.integrity = snapshot.compute_integrity();
        snapshot
    }

    /// Tamper-detection hash over the route list (not `builtAt`).
    pub fn compute_integrity(&self) -> String {
        let routes = serde_json::json!({
            "commands": self.commands,
            "listeners": self.listeners,
        });
        bundle::content_hash(&routes.to_string())
    }

    pub fn route_for_service(&self, service_id: &str) -> Option<&Route> {
        self.commands
            .values()
            .find(|r| r.service_id == service_id)
            .or_else(|| self.listeners.iter().find(|r| r.service_id == service_id))
    }

    /// Every bundle hash referenced by any route.
    pub fn bundle_hashes(&self) -> BTreeSet<String> {
        self.commands
            .values()
            .chain(self.listeners.iter())
            .map(|r| r.bundle_hash.clone())
            .collect()
    }
}
