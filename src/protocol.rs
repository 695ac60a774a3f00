use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frozen schema version of the service SDK protocol. Snapshots record the
/// version they were built against; a cached snapshot with a different
/// version is rebuilt.
pub const SDK_SCHEMA_VERSION: u32 = 1;

pub type JsonMap = serde_json::Map<String, Value>;

// ── Service identity ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    SingleCommand,
    CommandFlow,
    Listener,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::SingleCommand => write!(f, "single_command"),
            ServiceKind::CommandFlow => write!(f, "command_flow"),
            ServiceKind::Listener => write!(f, "listener"),
        }
    }
}

/// Identity a service declares in its source via `fn manifest()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub id: String,
    pub version: String,
    pub kind: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SDK_SCHEMA_VERSION
}

impl ServiceManifest {
    /// `version` must look like `major.minor.patch`, all numeric.
    pub fn version_is_valid(&self) -> bool {
        let parts: Vec<&str> = self.version.split('.').collect();
        parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    }
}

// ── Events (host → service) ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    #[serde(rename_all = "camelCase")]
    Command {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<JsonMap>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Callback {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<JsonMap>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<JsonMap>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_version: Option<u64>,
    },
}

impl ServiceEvent {
    /// Handler function the sandbox dispatches to for this event.
    pub fn handler_name(&self) -> &'static str {
        match self {
            ServiceEvent::Command { .. } => "handle_command",
            ServiceEvent::Callback { .. } => "handle_callback",
            ServiceEvent::Message { .. } => "handle_message",
        }
    }

    pub fn set_state(&mut self, value: Option<JsonMap>, version: Option<u64>) {
        match self {
            ServiceEvent::Command { state, state_version, .. }
            | ServiceEvent::Callback { state, state_version, .. }
            | ServiceEvent::Message { state, state_version, .. } => {
                *state = value;
                *state_version = version;
            }
        }
    }
}

// ── State directives (service → state store) ────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateDirective {
    Clear,
    Replace { value: JsonMap },
    Merge { value: JsonMap },
}

// ── Responses (service → host) ──────────────────────────────────────

/// Kind-specific body of a service response. Unknown kinds deserialize as
/// `None` so older hosts stay compatible with newer services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Reply {
        text: String,
    },
    Edit {
        text: String,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_text: Option<String>,
    },
    Photo {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(flatten)]
        metadata: JsonMap,
    },
    Audio {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(flatten)]
        metadata: JsonMap,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(flatten)]
        metadata: JsonMap,
    },
    Document {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(flatten)]
        metadata: JsonMap,
    },
    Location {
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Contact {
        phone: String,
        first_name: String,
        #[serde(flatten)]
        extra: JsonMap,
    },
    #[serde(rename_all = "camelCase")]
    Ui {
        ui_type: String,
        ui: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PubkyWrite {
        path: String,
        data: Value,
        preview: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_approval_message: Option<String>,
    },
    #[serde(other)]
    None,
}

impl ResponseBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResponseBody::Reply { .. } => "reply",
            ResponseBody::Edit { .. } => "edit",
            ResponseBody::Error { .. } => "error",
            ResponseBody::Delete { .. } => "delete",
            ResponseBody::Photo { .. } => "photo",
            ResponseBody::Audio { .. } => "audio",
            ResponseBody::Video { .. } => "video",
            ResponseBody::Document { .. } => "document",
            ResponseBody::Location { .. } => "location",
            ResponseBody::Contact { .. } => "contact",
            ResponseBody::Ui { .. } => "ui",
            ResponseBody::PubkyWrite { .. } => "pubky_write",
            ResponseBody::None => "none",
        }
    }
}

/// One structured response from a service invocation. The body discriminates
/// on `kind`; `state`, `deleteTrigger`, `ttl`, and `options` may ride along
/// on any kind. `options` stays opaque for the adapter (reply markup,
/// replaceGroup / cleanupGroup, parse mode, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    #[serde(flatten)]
    pub body: ResponseBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateDirective>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete_trigger: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl ServiceResponse {
    pub fn from_body(body: ResponseBody) -> Self {
        Self {
            body,
            state: None,
            delete_trigger: false,
            ttl: None,
            options: None,
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self::from_body(ResponseBody::Reply { text: text.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::from_body(ResponseBody::Error { message: message.into() })
    }

    pub fn is_none(&self) -> bool {
        matches!(self.body, ResponseBody::None)
    }
}

// ── Sandbox payload (host → child stdin) ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadCtx {
    pub chat_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadManifest {
    pub schema_version: u32,
}

/// The single JSON document a service reads: `{event, ctx, manifest}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPayload {
    pub event: ServiceEvent,
    pub ctx: PayloadCtx,
    pub manifest: PayloadManifest,
}

/// The wrapper the host writes to the child's stdin. The bundle travels
/// inline as a data URI so the child never touches the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimInput {
    pub data_url: String,
    pub payload: SandboxPayload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
}
