/// Record identifiers are time-ordered UUIDs (v7).
pub type RecordId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh time-ordered record identifier.
pub fn new_record_id() -> RecordId {
    uuid::Uuid::now_v7()
}

/// Current UTC time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
