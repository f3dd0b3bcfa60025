use super::{AppState, PealApp, ServerError};
use crate::util::generate_id;
use peal_proto::signal::{CallAccept, CallEnd, CallKind, CallReject, CallRequest, IceCandidate};
use peal_proto::{ControlEnvelope, Frame, FrameType};
use peal_storage::{CallType, NewCall, StorageError};
use serde_json::json;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outstanding ring timers, one slot per call id. Timers are never
/// cancelled; the firing action itself is expected to be a guarded no-op
/// once the call has advanced, and to release its own slot.
pub(crate) struct RingTimers {
    inner: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RingTimers {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Arms a single-shot timer unless the call already holds one.
    pub(crate) async fn arm<F>(&self, call_id: &str, delay: StdDuration, fire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.inner.lock().await;
        if slots.contains_key(call_id) {
            return false;
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        slots.insert(call_id.to_string(), handle);
        true
    }

    pub(crate) async fn release(&self, call_id: &str) {
        self.inner.lock().await.remove(call_id);
    }

    pub(crate) async fn armed(&self, call_id: &str) -> bool {
        self.inner.lock().await.contains_key(call_id)
    }
}

fn call_kind_to_storage(kind: CallKind) -> CallType {
    match kind {
        CallKind::Audio => CallType::Audio,
        CallKind::Video => CallType::Video,
    }
}

impl AppState {
    pub(crate) async fn arm_ring_timer(self: &Arc<Self>, call_id: String) {
        let delay = StdDuration::from_secs(self.config.ring_timeout_seconds);
        let state = Arc::clone(self);
        let key = call_id.clone();
        self.ring_timers
            .arm(&call_id, delay, async move {
                state.fire_ring_timeout(&key).await;
                state.ring_timers.release(&key).await;
            })
            .await;
    }

    async fn fire_ring_timeout(&self, call_id: &str) {
        match self.storage.expire_call(call_id).await {
            Ok(record) => {
                self.metrics.mark_call_missed();
                info!(call = %call_id, "call timed out");
                let payload = json!({ "call_id": call_id });
                self.deliver_to_user(&record.caller, FrameType::CallTimeout, payload.clone())
                    .await;
                self.deliver_to_user(&record.receiver, FrameType::CallTimeout, payload)
                    .await;
            }
            Err(StorageError::Conflict) | Err(StorageError::Missing) => {
                // the call advanced before the deadline; nothing to do
            }
            Err(err) => {
                warn!(call = %call_id, error = %err, "ring timeout persistence failed");
            }
        }
    }
}

impl PealApp {
    pub(crate) async fn handle_call_request(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(request) = CallRequest::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, "call_request", "invalid call request")
                .await;
            return Ok(());
        };
        if request.to.trim().is_empty()
            || request.from.trim().is_empty()
            || request.from != user_id
            || request.offer.is_null()
        {
            self.reject_invalid(tx_out, server_sequence, "call_request", "invalid call request")
                .await;
            return Ok(());
        }
        match self.state.storage.is_user_busy(&request.to).await {
            Ok(true) => {
                self.notify_busy(tx_out, server_sequence, &request.to).await;
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => {
                error!(error = %err, "busy probe failed");
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_request",
                    "failed to initiate call",
                )
                .await;
                return Ok(());
            }
        }
        let call = NewCall {
            call_id: generate_id(&format!("call:{}:{}", request.from, request.to)),
            caller: request.from.clone(),
            receiver: request.to.clone(),
            call_type: call_kind_to_storage(request.kind),
        };
        match self.state.storage.create_call(&call).await {
            Ok(Some(record)) => {
                self.state.metrics.mark_call_started();
                info!(
                    call = %record.call_id,
                    caller = %record.caller,
                    receiver = %record.receiver,
                    kind = request.kind.as_str(),
                    "call requested"
                );
                self.state
                    .deliver_to_user(
                        &record.receiver,
                        FrameType::CallRequest,
                        json!({
                            "call_id": record.call_id.clone(),
                            "from": record.caller.clone(),
                            "type": request.kind.as_str(),
                            "offer": request.offer,
                        }),
                    )
                    .await;
                self.state.spawn_push(
                    record.receiver.clone(),
                    "Incoming call".to_string(),
                    format!("{} is calling you", record.caller),
                    json!({
                        "call_id": record.call_id.clone(),
                        "type": request.kind.as_str(),
                    }),
                );
                self.state.arm_ring_timer(record.call_id).await;
            }
            Ok(None) => {
                // lost the claim to a concurrent request
                self.notify_busy(tx_out, server_sequence, &request.to).await;
            }
            Err(err) => {
                error!(error = %err, "call persistence failed");
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_request",
                    "failed to initiate call",
                )
                .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_call_accept(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(accept) = CallAccept::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, "call_accept", "invalid call accept")
                .await;
            return Ok(());
        };
        if accept.call_id.trim().is_empty()
            || accept.to.trim().is_empty()
            || accept.from.trim().is_empty()
            || accept.from != user_id
        {
            self.reject_invalid(tx_out, server_sequence, "call_accept", "invalid call accept")
                .await;
            return Ok(());
        }
        match self.state.storage.accept_call(&accept.call_id).await {
            Ok(record) => {
                self.state.metrics.mark_call_accepted();
                info!(call = %record.call_id, by = %accept.from, "call accepted");
                self.state
                    .deliver_to_user(
                        &accept.to,
                        FrameType::CallAccept,
                        json!({
                            "call_id": accept.call_id,
                            "from": accept.from,
                            "answer": accept.answer,
                        }),
                    )
                    .await;
            }
            Err(StorageError::Conflict) => {
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_accept",
                    "call is not awaiting an answer",
                )
                .await;
            }
            Err(StorageError::Missing) => {
                self.send_event_error(tx_out, server_sequence, "call_accept", "unknown call")
                    .await;
            }
            Err(err) => {
                error!(call = %accept.call_id, error = %err, "call accept persistence failed");
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_accept",
                    "failed to accept call",
                )
                .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_call_reject(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(reject) = CallReject::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, "call_reject", "invalid call reject")
                .await;
            return Ok(());
        };
        if reject.call_id.trim().is_empty()
            || reject.to.trim().is_empty()
            || reject.from.trim().is_empty()
            || reject.from != user_id
        {
            self.reject_invalid(tx_out, server_sequence, "call_reject", "invalid call reject")
                .await;
            return Ok(());
        }
        match self.state.storage.reject_call(&reject.call_id).await {
            Ok(record) => {
                self.state.metrics.mark_call_rejected();
                info!(call = %record.call_id, by = %reject.from, "call rejected");
                self.state
                    .deliver_to_user(
                        &reject.to,
                        FrameType::CallReject,
                        json!({
                            "call_id": reject.call_id,
                            "from": reject.from,
                        }),
                    )
                    .await;
            }
            Err(StorageError::Conflict) => {
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_reject",
                    "call is not awaiting an answer",
                )
                .await;
            }
            Err(StorageError::Missing) => {
                self.send_event_error(tx_out, server_sequence, "call_reject", "unknown call")
                    .await;
            }
            Err(err) => {
                error!(call = %reject.call_id, error = %err, "call reject persistence failed");
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "call_reject",
                    "failed to reject call",
                )
                .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_call_end(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(end) = CallEnd::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, "call_end", "invalid call end")
                .await;
            return Ok(());
        };
        if end.call_id.trim().is_empty()
            || end.to.trim().is_empty()
            || end.from.trim().is_empty()
            || end.from != user_id
            || end.data_usage.is_some_and(|usage| usage < 0)
        {
            self.reject_invalid(tx_out, server_sequence, "call_end", "invalid call end")
                .await;
            return Ok(());
        }
        match self
            .state
            .storage
            .end_call(&end.call_id, end.ended_at, end.data_usage)
            .await
        {
            Ok(record) => {
                self.state.metrics.mark_call_ended();
                info!(
                    call = %record.call_id,
                    by = %end.from,
                    data_usage = record.data_usage,
                    "call ended"
                );
                self.state
                    .deliver_to_user(
                        &end.to,
                        FrameType::CallEnd,
                        json!({
                            "call_id": end.call_id,
                            "from": end.from,
                        }),
                    )
                    .await;
            }
            Err(StorageError::Conflict) => {
                self.send_event_error(tx_out, server_sequence, "call_end", "call is not active")
                    .await;
            }
            Err(StorageError::Missing) => {
                self.send_event_error(tx_out, server_sequence, "call_end", "unknown call")
                    .await;
            }
            Err(err) => {
                error!(call = %end.call_id, error = %err, "call end persistence failed");
                self.send_event_error(tx_out, server_sequence, "call_end", "failed to end call")
                    .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_ice_candidate(
        &self,
        _user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(candidate) = IceCandidate::try_from(envelope) else {
            self.reject_invalid(
                tx_out,
                server_sequence,
                "ice_candidate",
                "invalid ice candidate",
            )
            .await;
            return Ok(());
        };
        if candidate.to.trim().is_empty() || candidate.candidate.is_null() {
            self.reject_invalid(
                tx_out,
                server_sequence,
                "ice_candidate",
                "invalid ice candidate",
            )
            .await;
            return Ok(());
        }
        self.state
            .deliver_to_user(
                &candidate.to,
                FrameType::IceCandidate,
                json!({
                    "candidate": candidate.candidate,
                }),
            )
            .await;
        Ok(())
    }

    async fn notify_busy(
        &self,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
        target: &str,
    ) {
        self.state.metrics.mark_call_busy();
        info!(target = %target, "call request rejected, target busy");
        self.send_self_frame(
            tx_out,
            server_sequence,
            FrameType::CallBusy,
            json!({ "to": target }),
        )
        .await;
    }

    pub(crate) async fn reject_invalid(
        &self,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
        event: &str,
        detail: &str,
    ) {
        self.state.metrics.mark_validation_failure();
        self.send_event_error(tx_out, server_sequence, event, detail)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn call_kind_maps_to_storage_type() {
        assert_eq!(call_kind_to_storage(CallKind::Audio), CallType::Audio);
        assert_eq!(call_kind_to_storage(CallKind::Video), CallType::Video);
    }

    #[tokio::test]
    async fn ring_timers_hold_at_most_one_slot_per_call() {
        let timers = RingTimers::new();
        assert!(timers.arm("call-1", StdDuration::from_secs(60), async {}).await);
        assert!(!timers.arm("call-1", StdDuration::from_secs(60), async {}).await);
        assert!(timers.armed("call-1").await);
        timers.release("call-1").await;
        assert!(!timers.armed("call-1").await);
        assert!(timers.arm("call-1", StdDuration::from_secs(60), async {}).await);
    }

    #[tokio::test]
    async fn ring_timer_fires_once_and_releases_its_slot() {
        let timers = Arc::new(RingTimers::new());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let slots = Arc::clone(&timers);
        timers
            .arm("call-2", StdDuration::from_millis(10), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                slots.release("call-2").await;
            })
            .await;
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.armed("call-2").await);
    }
}
