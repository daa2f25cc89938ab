//! Outbox message types and lifecycle states.
//!
//! A message is a row in the outbox table. It is written in the producer's
//! transaction, read by the poller, and retired by the committer inside the
//! consumer's transaction.
//!
//! # Message Lifecycle
//!
//! 1. Messages are published in `Created` state
//! 2. Once the consumer's downstream effect commits, they move to `Deleted`
//!
//! Retirement is logical: rows are never removed, so the table doubles as an
//! audit log of everything that went through the outbox.
//!
//! Business payloads live in extension columns. An application record embeds
//! [`Message`] with `#[sqlx(flatten)]` and implements `AsRef<Message>`:
//!
//! ```ignore
//! #[derive(sqlx::FromRow)]
//! struct BillingMessage {
//!     #[sqlx(flatten)]
//!     message: Message,
//!     resource_id: String,
//!     cpu: u32,
//! }
//!
//! impl AsRef<Message> for BillingMessage {
//!     fn as_ref(&self) -> &Message {
//!         &self.message
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// State of a message in the outbox.
///
/// Transitions only go forward: `Created` -> `Deleted`.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text")]
pub enum MessageState {
    /// Published and waiting to be delivered. Eligible for redelivery.
    Created,
    /// Delivered and retired. Never delivered again.
    Deleted,
}

/// The base columns of an outbox row.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Caller-assigned idempotency key
    pub message_id: String,
    pub create_time: u32,
    pub update_time: u32,
    /// Time of logical deletion, 0 while the message is pending
    pub delete_time: u32,
    /// Number of delivery attempts
    pub try_times: u32,
    pub state: MessageState,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Created
    }
}

impl AsRef<Message> for Message {
    fn as_ref(&self) -> &Message {
        self
    }
}

/// Current unix time in seconds, saturating at `u32::MAX`.
pub(crate) fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    #[test]
    fn test_state_text() {
        assert_eq!(MessageState::Created.to_string(), "Created");
        assert_eq!(MessageState::Deleted.as_ref(), "Deleted");
        assert_eq!(
            MessageState::from_str("Deleted").unwrap(),
            MessageState::Deleted
        );
        assert!(MessageState::from_str("deleted").is_err());
    }

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-09-13
        assert!(unix_now() > 1_600_000_000);
    }

    #[tokio::test]
    async fn test_decode_message_row() {
        let db = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let message: Message = sqlx::query_as(
            "
            SELECT 'msg-1' AS message_id, 10 AS create_time, 11 AS update_time,
                   0 AS delete_time, 2 AS try_times, 'Created' AS state
            ",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(message.message_id, "msg-1");
        assert_eq!(message.update_time, 11);
        assert_eq!(message.try_times, 2);
        assert!(message.is_pending());
    }
}
