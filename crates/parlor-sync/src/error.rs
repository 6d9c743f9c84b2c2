use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures surfaced by the sync engine. None of them stop the event loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A query against the data service failed. Safe to retry.
    #[error("{context}: {source}")]
    TransientFetch {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A live subscription could not be established or was dropped. The
    /// room's feed may miss events until it is resynced or reopened.
    #[error("live subscription for {} lost: {reason}", room_label(.room_id))]
    SubscriptionLost { room_id: Option<Uuid>, reason: String },

    /// Writing a read watermark failed. The next unread refresh for that
    /// room may count messages the user has already seen.
    #[error("watermark write failed: {0}")]
    Persistence(#[source] anyhow::Error),

    /// An event payload was missing fields or had the wrong shape.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("no room is open")]
    NoRoomOpen,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("sync engine has shut down")]
    EngineClosed,
}

impl SyncError {
    pub fn fetch(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::TransientFetch {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller can reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. } | Self::SubscriptionLost { .. })
    }
}

fn room_label(room_id: &Option<Uuid>) -> String {
    match room_id {
        Some(id) => format!("room {}", id),
        None => "all rooms".to_string(),
    }
}
