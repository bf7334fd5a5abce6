//! Identifier generation for messages and clients.

use uuid::Uuid;

/// Synthesize a unique message ID for backends that do not assign one.
pub fn message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Derive a client ID, keeping a caller-supplied prefix readable in broker
/// dashboards while staying unique per process.
pub fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique() {
        let a = message_id();
        let b = message_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn client_id_keeps_prefix() {
        let id = client_id("orders-svc");
        assert!(id.starts_with("orders-svc-"));
        assert_eq!(id.len(), "orders-svc-".len() + 8);
    }
}
