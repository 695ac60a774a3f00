//! Replacement / cleanup groups, adapter side.
//!
//! Responses may carry `options.replaceGroup` or `options.cleanupGroup`.
//! The dispatcher passes them through untouched; the adapter uses this
//! tracker to do the delete-prior / emit / record-current dance. One map,
//! one mutex, keyed by (chat, group).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::ServiceResponse;

/// Group name a response wants the previous group message replaced under.
#[allow(dead_code)]
pub fn replace_group(response: &ServiceResponse) -> Option<&str> {
    response
        .options
        .as_ref()
        .and_then(|o| o.get("replaceGroup"))
        .and_then(|v| v.as_str())
}

/// Group name a response wants cleaned up without posting a successor.
#[allow(dead_code)]
pub fn cleanup_group(response: &ServiceResponse) -> Option<&str> {
    response
        .options
        .as_ref()
        .and_then(|o| o.get("cleanupGroup"))
        .and_then(|v| v.as_str())
}

/// Last bot message id per (chat, group).
#[derive(Default)]
pub struct GroupTracker {
    last: Mutex<HashMap<(String, String), String>>,
}

impl GroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn last(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the group's new message and hand back the prior one, which the
    /// adapter deletes. Apply before emitting the new message so a delete
    /// failure never orphans the record.
    pub fn replace(
        &self,
        chat_id: &str,
        group: &str,
        new_message_id: &str,
    ) -> Option<String> {
        self.last()
            .insert((chat_id.to_string(), group.to_string()), new_message_id.to_string())
    }

    /// Drop the group's record and return the message to delete, if any.
    pub fn cleanup(&self, chat_id: &str, group: &str) -> Option<String> {
        self.last().remove(&(chat_id.to_string(), group.to_string()))
    }

    /// Diagnostics/tests only.
    pub fn dump(&self) -> Vec<((String, String), String)> {
        self.last().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
