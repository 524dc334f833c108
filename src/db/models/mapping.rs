use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::TagId;

/// One tag-to-file association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMapping {
    pub tag: TagId,
    pub file: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
