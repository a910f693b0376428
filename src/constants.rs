//! Channel name and key templates shared by every component.
//!
//! Kept byte-exact with the specification so that a client and a worker
//! running as two independent processes, each built from this crate,
//! agree on the broker surface without any further negotiation.

/// Shared task channel all clients publish to and the Worker Manager polls.
pub const TASKS_CHANNEL: &str = "channel:tasks";

/// Per-Grunt private task channel, keyed by the Grunt's OS process id.
pub fn grunt_channel(pid: u32) -> String {
    format!("channel:tasks:{pid}")
}

/// Per-call result channel, keyed by `call_id`.
pub fn results_channel(call_id: &str) -> String {
    format!("channel:results:{call_id}")
}

/// Broker-side retry counter key, keyed by `call_id`.
pub fn retry_counter_key(call_id: &str) -> String {
    format!("retry:{call_id}")
}

/// TTL applied to a retry counter after each write.
pub const RETRY_COUNTER_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Wire format tag prefix.
pub const WIRE_TAG_JSON: &str = "json";
