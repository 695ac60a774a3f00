pub mod host;
pub mod runtime;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::SandboxPayload;

pub use host::ProcessSandboxHost;

/// Errors from one sandbox invocation.
///
/// The dispatcher converts these into a synthetic `{kind:"error"}` response;
/// they never abort a dispatch.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("timeout")]
    Timeout,

    #[error("sandbox crashed: {0}")]
    Crash(String),

    #[error("bad_response: {0}")]
    BadResponse(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything one invocation needs: the self-contained bundle, the payload
/// the service will read, the network allow-list, and the deadline.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub data_url: String,
    pub payload: SandboxPayload,
    pub net: Vec<String>,
    pub timeout: Duration,
}

/// Executes one service invocation and returns the raw response JSON.
///
/// The production implementation is [`ProcessSandboxHost`] (one child
/// process per invocation); tests substitute an in-process runner.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, spec: RunSpec) -> Result<Value, SandboxError>;
}
