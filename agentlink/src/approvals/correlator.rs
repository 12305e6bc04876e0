//! Tracks pending approvals until a decision, a timeout, or a disconnect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentlink_proto::jsonrpc::RequestId;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{ApprovalResponse, Decision, PendingApproval};

struct Entry {
    approval: PendingApproval,
    reply: oneshot::Sender<ApprovalResponse>,
    timer: JoinHandle<()>,
    generation: u64,
}

impl Entry {
    fn settle(self, response: ApprovalResponse) {
        self.timer.abort();
        let _ = self.reply.send(response);
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RequestId, Entry>,
    next_generation: u64,
}

/// Correlates approval requests with user decisions.
///
/// Each entry owns an independent timer. An entry is removed exactly once:
/// by [`resolve`](Self::resolve), by its timeout (auto-decline), by a newer
/// entry with the same request id (auto-decline), or by
/// [`decline_all`](Self::decline_all).
pub struct ApprovalCorrelator {
    inner: Arc<Mutex<Inner>>,
    timeout: Duration,
}

impl ApprovalCorrelator {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            timeout,
        }
    }

    /// Registers `approval` and returns a future of the reply to send.
    ///
    /// Registration happens before this returns. A prior entry with the
    /// same request id is declined and replaced.
    pub fn enqueue(
        &self,
        approval: PendingApproval,
    ) -> impl Future<Output = ApprovalResponse> + Send + 'static {
        let (reply, decided) = oneshot::channel();
        let request_id = approval.request_id;

        let replaced = {
            let mut inner = self.inner.lock();
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let timer = tokio::spawn(expire(
                Arc::downgrade(&self.inner),
                request_id,
                generation,
                self.timeout,
            ));
            inner.entries.insert(
                request_id,
                Entry {
                    approval,
                    reply,
                    timer,
                    generation,
                },
            )
        };
        if let Some(previous) = replaced {
            tracing::info!(request_id, "approval replaced; declining previous request");
            previous.settle(ApprovalResponse::decline());
        }

        async move { decided.await.unwrap_or_else(|_| ApprovalResponse::decline()) }
    }

    /// Delivers `response` for `request_id`.
    ///
    /// Returns `false` if no such approval is pending, e.g. because it was
    /// already resolved or timed out.
    pub fn resolve(&self, request_id: RequestId, response: ApprovalResponse) -> bool {
        let entry = self.inner.lock().entries.remove(&request_id);
        match entry {
            Some(entry) => {
                tracing::debug!(request_id, decision = %response.decision, "approval resolved");
                entry.settle(response);
                true
            }
            None => false,
        }
    }

    /// Resolves with a bare decision and no settings.
    pub fn resolve_decision(&self, request_id: RequestId, decision: Decision) -> bool {
        self.resolve(request_id, ApprovalResponse::from(decision))
    }

    /// The pending approval with `request_id`, if any.
    #[must_use]
    pub fn get(&self, request_id: RequestId) -> Option<PendingApproval> {
        self.inner
            .lock()
            .entries
            .get(&request_id)
            .map(|entry| entry.approval.clone())
    }

    /// Declines and removes every pending approval. Returns how many were
    /// declined.
    pub fn decline_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.settle(ApprovalResponse::decline());
        }
        if count > 0 {
            tracing::info!(count, "auto-declined pending approvals");
        }
        count
    }

    /// Snapshot of pending approvals ordered by request id.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<PendingApproval> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.approval.clone())
            .collect();
        pending.sort_by_key(|approval| approval.request_id);
        pending
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ApprovalCorrelator {
    fn drop(&mut self) {
        self.decline_all();
    }
}

async fn expire(
    inner: std::sync::Weak<Mutex<Inner>>,
    request_id: RequestId,
    generation: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let entry = {
        let mut inner = inner.lock();
        match inner.entries.get(&request_id) {
            Some(entry) if entry.generation == generation => inner.entries.remove(&request_id),
            _ => None,
        }
    };
    if let Some(entry) = entry {
        tracing::info!(request_id, "approval timed out; auto-declining");
        // The timer is this task; only the reply needs sending.
        let _ = entry.reply.send(ApprovalResponse::decline());
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ApprovalKind, DEFAULT_APPROVAL_TIMEOUT};
    use super::*;

    fn approval(request_id: RequestId) -> PendingApproval {
        PendingApproval {
            request_id,
            kind: ApprovalKind::CommandExecution,
            item_id: format!("item-{request_id}"),
            thread_id: "thr".into(),
            turn_id: "turn".into(),
            reason: None,
            risk: None,
            command: Some("ls".into()),
            cwd: None,
            parsed_cmd_text: None,
            change_count: None,
            changed_paths: Vec::new(),
            diff_text: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_approval_auto_declines_after_timeout() {
        let correlator = ApprovalCorrelator::new(DEFAULT_APPROVAL_TIMEOUT);
        let decision = tokio::spawn(correlator.enqueue(approval(1)));

        tokio::time::sleep(Duration::from_millis(119_999)).await;
        assert_eq!(correlator.len(), 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(decision.await.unwrap().decision, Decision::Decline);
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_delivers_decision_once() {
        let correlator = ApprovalCorrelator::new(DEFAULT_APPROVAL_TIMEOUT);
        let decision = correlator.enqueue(approval(1));
        assert!(correlator.resolve_decision(1, Decision::Accept));
        assert!(!correlator.resolve_decision(1, Decision::Decline));
        assert_eq!(decision.await.decision, Decision::Accept);

        // The cancelled timer must not fire anything later.
        tokio::time::sleep(DEFAULT_APPROVAL_TIMEOUT * 2).await;
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_request_id_replaces_and_declines_previous() {
        let correlator = ApprovalCorrelator::new(DEFAULT_APPROVAL_TIMEOUT);
        let first = correlator.enqueue(approval(7));
        tokio::time::sleep(Duration::from_millis(60_000)).await;
        let second = correlator.enqueue(approval(7));

        assert_eq!(first.await.decision, Decision::Decline);
        assert_eq!(correlator.len(), 1);

        // The first timer's deadline passes without touching the new entry.
        tokio::time::sleep(Duration::from_millis(61_000)).await;
        assert_eq!(correlator.len(), 1);
        assert!(correlator.resolve_decision(7, Decision::Accept));
        assert_eq!(second.await.decision, Decision::Accept);
    }

    #[tokio::test]
    async fn decline_all_clears_everything() {
        let correlator = ApprovalCorrelator::new(DEFAULT_APPROVAL_TIMEOUT);
        let a = correlator.enqueue(approval(1));
        let b = correlator.enqueue(approval(2));
        assert_eq!(
            correlator
                .pending()
                .iter()
                .map(|p| p.request_id)
                .collect::<Vec<_>>(),
            [1, 2]
        );

        assert_eq!(correlator.decline_all(), 2);
        assert_eq!(a.await, ApprovalResponse::decline());
        assert_eq!(b.await, ApprovalResponse::decline());
        assert!(correlator.is_empty());
        assert_eq!(correlator.decline_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_timers() {
        let correlator = ApprovalCorrelator::new(Duration::from_millis(1_000));
        let early = tokio::spawn(correlator.enqueue(approval(1)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let late = correlator.enqueue(approval(2));

        assert_eq!(early.await.unwrap().decision, Decision::Decline);
        assert_eq!(correlator.len(), 1);
        let accept = ApprovalResponse {
            decision: Decision::Accept,
            accept_settings: Some(serde_json::Map::new()),
        };
        assert!(correlator.resolve(2, accept.clone()));
        assert_eq!(late.await, accept);
    }
}
