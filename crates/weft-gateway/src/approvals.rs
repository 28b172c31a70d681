//! Approval broker: request/response correlation with timeout, defaults,
//! and session-scoped caching of "always" decisions.
//!
//! One broker per session tree; delegated child sessions share the parent's
//! broker so a single approval UI serves the whole tree. Exactly one of
//! {response, timeout, cancellation} resolves each request, and a late
//! response is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::debug;
use weft_shared::frames::ServerFrame;

use crate::ws::outbound::Outbound;

/// Where the broker's frames go. In production this is the session's event
/// pump, so approval frames stay ordered behind the tool events that caused
/// them; tests can wire an [`Outbound`] directly.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: ServerFrame) -> bool;
}

impl FrameSink for Outbound {
    fn send_frame(&self, frame: ServerFrame) -> bool {
        self.push(frame)
    }
}

struct PendingApproval {
    tx: oneshot::Sender<String>,
}

struct BrokerInner {
    pending: HashMap<String, PendingApproval>,
    /// fingerprint -> cached "always" choice, cleared when the session ends.
    cache: HashMap<String, String>,
}

pub struct ApprovalBroker {
    sink: Arc<dyn FrameSink>,
    inner: Mutex<BrokerInner>,
}

impl ApprovalBroker {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            inner: Mutex::new(BrokerInner {
                pending: HashMap::new(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Ask the user to approve something. Resolves with the chosen option,
    /// the default on timeout, or the default on session cancellation.
    pub async fn request(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String {
        let fingerprint = approval_fingerprint(prompt, options);
        let resolved_default = resolve_default(default, options);

        if let Some(cached) = self.inner.lock().unwrap().cache.get(&fingerprint).cloned() {
            debug!(choice = %cached, "using cached approval");
            return cached;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .pending
            .insert(request_id.clone(), PendingApproval { tx });

        // The request frame must be on the wire before any response can be
        // processed; pushing before awaiting keeps that ordering.
        let sent = self.sink.send_frame(ServerFrame::ApprovalRequest {
            id: request_id.clone(),
            prompt: prompt.to_string(),
            options: options.to_vec(),
            timeout: timeout.as_secs(),
            default_choice: resolved_default.clone(),
        });
        if !sent {
            self.inner.lock().unwrap().pending.remove(&request_id);
            return resolved_default;
        }

        let choice = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(choice)) => choice,
            // Sender dropped: the session was cancelled or torn down.
            Ok(Err(_)) => resolved_default.clone(),
            Err(_) => {
                // First of {response, timeout} wins; removing the pending
                // entry here makes any later respond() a no-op.
                self.inner.lock().unwrap().pending.remove(&request_id);
                self.sink.send_frame(ServerFrame::ApprovalTimeout {
                    id: request_id.clone(),
                    applied_default: resolved_default.clone(),
                });
                debug!(id = %request_id, timeout_secs = timeout.as_secs(), "approval timed out");
                resolved_default.clone()
            }
        };

        if choice.to_lowercase().contains("always") {
            self.inner
                .lock()
                .unwrap()
                .cache
                .insert(fingerprint, choice.clone());
        }

        choice
    }

    /// Resolve a pending request with the user's choice. Returns false when
    /// the request already resolved (timed out, cancelled, or unknown id).
    pub fn respond(&self, request_id: &str, choice: &str) -> bool {
        let pending = self.inner.lock().unwrap().pending.remove(request_id);
        match pending {
            Some(p) => p.tx.send(choice.to_string()).is_ok(),
            None => {
                debug!(id = %request_id, "approval response for unknown or resolved request");
                false
            }
        }
    }

    /// Fire every pending waiter with its default by dropping the senders.
    /// Called on session cancel and teardown.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
    }

    /// Clear the "always" cache; the cache is scoped to one session life.
    pub fn clear_cache(&self) {
        self.inner.lock().unwrap().cache.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[async_trait::async_trait]
impl crate::runtime::ApprovalSink for ApprovalBroker {
    async fn request(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String {
        ApprovalBroker::request(self, prompt, options, timeout, default).await
    }
}

/// Stable fingerprint of (prompt, ordered options). Deliberately excludes
/// ids and timestamps so identical requests hit the cache.
pub fn approval_fingerprint(prompt: &str, options: &[String]) -> String {
    let canonical = json!({"prompt": prompt, "options": options}).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map a default action onto the closest option text. Exact matches win;
/// otherwise "allow"/"deny" style defaults pick the first option containing
/// an affirmative/negative word, falling back to the last option.
pub fn resolve_default(default: &str, options: &[String]) -> String {
    if options.is_empty() {
        return default.to_string();
    }
    if let Some(exact) = options.iter().find(|o| o.as_str() == default) {
        return exact.clone();
    }
    let default_lower = default.to_lowercase();
    let wanted: &[&str] = if default_lower.contains("allow") || default_lower.contains("yes") {
        &["allow", "yes"]
    } else {
        &["deny", "no"]
    };
    for option in options {
        let lower = option.to_lowercase();
        if wanted.iter().any(|w| lower.contains(w)) {
            return option.clone();
        }
    }
    options.last().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_shared::frames::ServerFrame;

    fn options() -> Vec<String> {
        vec!["Allow once".into(), "Allow always".into(), "Deny".into()]
    }

    async fn next_frame(outbound: &Outbound) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(1), outbound.pop())
            .await
            .expect("frame expected")
            .expect("queue open")
    }

    #[tokio::test]
    async fn response_resolves_waiter() {
        let outbound = Outbound::new();
        let broker = std::sync::Arc::new(ApprovalBroker::new(Arc::new(outbound.clone())));

        let broker_clone = broker.clone();
        let task = tokio::spawn(async move {
            broker_clone
                .request("Allow write?", &options(), Duration::from_secs(30), "Deny")
                .await
        });

        let id = match next_frame(&outbound).await {
            ServerFrame::ApprovalRequest { id, default_choice, .. } => {
                assert_eq!(default_choice, "Deny");
                id
            }
            other => panic!("unexpected frame {other:?}"),
        };

        assert!(broker.respond(&id, "Allow once"));
        assert_eq!(task.await.unwrap(), "Allow once");
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_applies_default_and_drops_late_response() {
        let outbound = Outbound::new();
        let broker = std::sync::Arc::new(ApprovalBroker::new(Arc::new(outbound.clone())));

        let broker_clone = broker.clone();
        let task = tokio::spawn(async move {
            broker_clone
                .request("Allow?", &options(), Duration::from_millis(50), "Deny")
                .await
        });

        let id = match next_frame(&outbound).await {
            ServerFrame::ApprovalRequest { id, .. } => id,
            other => panic!("unexpected frame {other:?}"),
        };

        assert_eq!(task.await.unwrap(), "Deny");
        match next_frame(&outbound).await {
            ServerFrame::ApprovalTimeout { applied_default, .. } => {
                assert_eq!(applied_default, "Deny");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        // Late response is discarded.
        assert!(!broker.respond(&id, "Allow once"));
    }

    #[tokio::test]
    async fn always_choice_is_cached_without_second_frame() {
        let outbound = Outbound::new();
        let broker = std::sync::Arc::new(ApprovalBroker::new(Arc::new(outbound.clone())));

        let broker_clone = broker.clone();
        let task = tokio::spawn(async move {
            broker_clone
                .request("Allow?", &options(), Duration::from_secs(30), "Deny")
                .await
        });
        let id = match next_frame(&outbound).await {
            ServerFrame::ApprovalRequest { id, .. } => id,
            other => panic!("unexpected frame {other:?}"),
        };
        broker.respond(&id, "Allow always");
        assert_eq!(task.await.unwrap(), "Allow always");

        // Identical request: cache hit, no frame emitted.
        let choice = broker
            .request("Allow?", &options(), Duration::from_secs(30), "Deny")
            .await;
        assert_eq!(choice, "Allow always");
        outbound.close();
        assert_eq!(outbound.pop().await, None);
    }

    #[tokio::test]
    async fn different_prompt_misses_cache() {
        let outbound = Outbound::new();
        let broker = std::sync::Arc::new(ApprovalBroker::new(Arc::new(outbound.clone())));

        let broker_clone = broker.clone();
        tokio::spawn(async move {
            broker_clone
                .request("Allow /tmp/a?", &options(), Duration::from_secs(30), "Deny")
                .await
        });
        let id = match next_frame(&outbound).await {
            ServerFrame::ApprovalRequest { id, .. } => id,
            other => panic!("unexpected frame {other:?}"),
        };
        broker.respond(&id, "Allow always");

        let broker_clone = broker.clone();
        let task = tokio::spawn(async move {
            broker_clone
                .request("Allow /tmp/b?", &options(), Duration::from_secs(30), "Deny")
                .await
        });
        // A fresh frame is emitted for the different prompt.
        let id2 = match next_frame(&outbound).await {
            ServerFrame::ApprovalRequest { id, .. } => id,
            other => panic!("unexpected frame {other:?}"),
        };
        assert_ne!(id, id2);
        broker.respond(&id2, "Deny");
        assert_eq!(task.await.unwrap(), "Deny");
    }

    #[tokio::test]
    async fn cancel_all_fires_defaults() {
        let outbound = Outbound::new();
        let broker = std::sync::Arc::new(ApprovalBroker::new(Arc::new(outbound.clone())));

        let broker_clone = broker.clone();
        let task = tokio::spawn(async move {
            broker_clone
                .request("Allow?", &options(), Duration::from_secs(30), "Deny")
                .await
        });
        next_frame(&outbound).await;
        broker.cancel_all();
        assert_eq!(task.await.unwrap(), "Deny");
    }

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let a = approval_fingerprint("p", &["x".into(), "y".into()]);
        let b = approval_fingerprint("p", &["x".into(), "y".into()]);
        let c = approval_fingerprint("p", &["y".into(), "x".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn default_resolution() {
        let opts = options();
        assert_eq!(resolve_default("Deny", &opts), "Deny");
        assert_eq!(resolve_default("deny", &opts), "Deny");
        assert_eq!(resolve_default("allow", &opts), "Allow once");
        assert_eq!(resolve_default("maybe", &opts), "Deny");
        assert_eq!(resolve_default("deny", &[]), "deny");
    }
}
