//! Store data model

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use distlock_common::{LeaseId, Revision};

/// A live key as returned by reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Lease the key is attached to
    pub lease: LeaseId,
}

/// Change notification for a watched key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEvent {
    Modified { key: String, revision: Revision },
    Deleted { key: String, revision: Revision },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Modified { key, .. } | WatchEvent::Deleted { key, .. } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WatchEvent::Deleted { .. })
    }
}

/// Notification stream for a single key. Dropping it cancels the watch.
pub type WatchStream = BoxStream<'static, WatchEvent>;
