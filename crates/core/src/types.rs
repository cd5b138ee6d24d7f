/// Caller-supplied slot index used to route results back to UI slots.
pub type JobIndex = usize;

/// All wall-clock timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of one submitted batch.
pub type BatchId = uuid::Uuid;
