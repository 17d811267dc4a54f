//! Store key templates
//!
//! The URI is wrapped in a hash tag so the queue of a service and the
//! timeout keys of its calls always live on the same slot.

/// List holding pending calls for `uri`
pub fn queue_key(uri: &str) -> String {
    format!("calls:{{{}}}", uri)
}

/// Key whose TTL is the expiry clock of one call
pub fn timeout_key(uri: &str, msg_id: &str) -> String {
    format!("calls:timeout:{{{}}}:{}", uri, msg_id)
}
