//! Represents the bucket the edge serves from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket row. The edge only ever reads one configured bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Bucket name, matched against the configured `bucket` setting.
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
