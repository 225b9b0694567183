use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub rater_id: Uuid,
    pub ratee_id: Uuid,
    pub score: u8,
    pub text: String,
    pub created_at: DateTime<Utc>,
}
