//! UUIDv7 helpers.
//!
//! Every row the pipeline writes (chunks, vectors, usage records, event
//! envelopes) gets a UUIDv7 so IDs sort by creation time.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Whether `uuid` is a version 7 identifier.
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}
