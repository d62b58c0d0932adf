use parking_lot::Mutex;
use parley_proto::MessageKind;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlightSend {
    thread_id: i64,
    content: String,
    kind: MessageKind,
}

#[derive(Default)]
struct Registry {
    in_flight: HashMap<i64, InFlightSend>,
    /// Placeholders already replaced by a pushed or pulled copy, keyed to the server id.
    claimed: HashMap<i64, i64>,
}

/// Sends whose HTTP confirmation has not arrived yet.
///
/// The server may echo a message over the push channel (or list it in a
/// pull) before the HTTP response lands. Whoever sees the server copy first
/// claims the placeholder and swaps it for the real row; the confirmation
/// path then finds the claim instead of a placeholder. Callers hold the
/// thread's message lock around `claim` and `finish`.
#[derive(Clone, Default)]
pub struct PendingSends {
    inner: Arc<Mutex<Registry>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, placeholder_id: i64, thread_id: i64, content: &str, kind: MessageKind) {
        let mut registry = self.inner.lock();
        registry.claimed.remove(&placeholder_id);
        registry.in_flight.insert(
            placeholder_id,
            InFlightSend {
                thread_id,
                content: content.to_string(),
                kind,
            },
        );
    }

    /// Finds the oldest in-flight send matching a server message and marks it
    /// claimed by `server_id`. Returns the placeholder id to replace.
    pub fn claim(
        &self,
        thread_id: i64,
        content: &str,
        kind: MessageKind,
        server_id: i64,
    ) -> Option<i64> {
        let mut registry = self.inner.lock();
        if registry.claimed.values().any(|id| *id == server_id) {
            return None;
        }
        // Placeholders decrease over time, so the oldest is the largest.
        let placeholder = registry
            .in_flight
            .iter()
            .filter(|(_, send)| {
                send.thread_id == thread_id && send.kind == kind && send.content == content
            })
            .map(|(id, _)| *id)
            .max()?;
        registry.in_flight.remove(&placeholder);
        registry.claimed.insert(placeholder, server_id);
        Some(placeholder)
    }

    /// Ends tracking of a send. Returns the server id if another path already
    /// replaced the placeholder.
    pub fn finish(&self, placeholder_id: i64) -> Option<i64> {
        let mut registry = self.inner.lock();
        registry.in_flight.remove(&placeholder_id);
        registry.claimed.remove(&placeholder_id)
    }

    pub fn is_in_flight(&self, placeholder_id: i64) -> bool {
        self.inner.lock().in_flight.contains_key(&placeholder_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_matches_thread_content_and_kind() {
        let pending = PendingSends::new();
        pending.register(-10, 1, "hello", MessageKind::Text);
        assert_eq!(pending.claim(2, "hello", MessageKind::Text, 50), None);
        assert_eq!(pending.claim(1, "hello", MessageKind::Image, 50), None);
        assert_eq!(pending.claim(1, "hello", MessageKind::Text, 50), Some(-10));
        assert!(!pending.is_in_flight(-10));
        assert_eq!(pending.finish(-10), Some(50));
        assert_eq!(pending.finish(-10), None);
    }

    #[test]
    fn oldest_duplicate_is_claimed_first() {
        let pending = PendingSends::new();
        pending.register(-10, 1, "same", MessageKind::Text);
        pending.register(-11, 1, "same", MessageKind::Text);
        assert_eq!(pending.claim(1, "same", MessageKind::Text, 70), Some(-10));
        assert_eq!(pending.claim(1, "same", MessageKind::Text, 70), None);
        assert_eq!(pending.claim(1, "same", MessageKind::Text, 71), Some(-11));
    }
}
