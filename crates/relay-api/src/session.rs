//! Session ids correlate one node request with the relay and backend calls
//! it causes.
use uuid::Uuid;

/// Header carrying the session id on every hop.
pub const SESSION_HEADER: &str = "X-Relaylet-Session";

/// Build a fresh session id for `operation`, e.g. `Create#<uuid>`.
pub fn new_session(operation: &str) -> String {
    format!("{}#{}", operation, Uuid::new_v4())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sessions_are_prefixed_and_unique() {
        let first = new_session("Status");
        let second = new_session("Status");
        assert!(first.starts_with("Status#"));
        assert_ne!(first, second);
    }
}
