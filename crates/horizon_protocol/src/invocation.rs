//! Correlation of outbound calls with their responses.
//!
//! Every request sent to a peer with a non-zero sequence number registers an
//! [`Invocation`]. When the peer's response frame arrives on that peer's
//! intake path, [`InvocationContext::complete`] removes the invocation and
//! either wakes the waiting caller or, for calls a gateway forwarded on behalf
//! of a client, relays the response to the client under the client's own
//! sequence number.
//!
//! Nothing is ever cancelled explicitly; a deadline is the cancellation.
//! Synchronous waiters evict their own entry when the deadline passes, and a
//! background reaper evicts everything else.

use crate::codec::{self, Serializer, SerializerRegistry};
use crate::context::CallContext;
use crate::error::{ErrorCode, ErrorResponse, RpcError};
use crate::message::{Message, ProtocolId};
use crate::session::SessionRef;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default bound on how long a call waits for its response.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<Result<Message, RpcError>>;

enum Completion {
    Waiter(Waiter),
    Forward { reply_to: SessionRef },
}

/// One outstanding call.
pub struct Invocation {
    pub sequence_number: i64,
    /// Sequence of the inbound request that caused this call.
    pub parent_sequence_number: i64,
    pub caller_identity: i64,
    pub protocol_id: ProtocolId,
    pub synchronous: bool,
    timeout: Duration,
    deadline: Instant,
    completion: Completion,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("sequence_number", &self.sequence_number)
            .field("parent_sequence_number", &self.parent_sequence_number)
            .field("caller_identity", &self.caller_identity)
            .field("protocol_id", &self.protocol_id)
            .field("synchronous", &self.synchronous)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// A call whose result is delivered to the returned receiver.
    pub fn waiting(
        ctx: &CallContext,
        sequence_number: i64,
        protocol_id: ProtocolId,
        synchronous: bool,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<Message, RpcError>>) {
        let (sender, receiver) = oneshot::channel();
        let invocation = Self::new(
            ctx,
            sequence_number,
            protocol_id,
            synchronous,
            timeout,
            Completion::Waiter(sender),
        );
        (invocation, receiver)
    }

    /// A call relayed on behalf of the caller connected on `reply_to`. The
    /// response goes back under `ctx.sequence_number`.
    pub fn forwarding(
        ctx: &CallContext,
        sequence_number: i64,
        protocol_id: ProtocolId,
        reply_to: SessionRef,
        timeout: Duration,
    ) -> Self {
        Self::new(
            ctx,
            sequence_number,
            protocol_id,
            false,
            timeout,
            Completion::Forward { reply_to },
        )
    }

    fn new(
        ctx: &CallContext,
        sequence_number: i64,
        protocol_id: ProtocolId,
        synchronous: bool,
        timeout: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            sequence_number,
            parent_sequence_number: ctx.sequence_number,
            caller_identity: ctx.identity,
            protocol_id,
            synchronous,
            timeout,
            deadline: Instant::now() + timeout,
            completion,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.completion, Completion::Forward { .. })
    }

    fn timeout_error(&self) -> RpcError {
        RpcError::Timeout {
            protocol: self.protocol_id,
            sequence: self.sequence_number,
            after: self.timeout,
        }
    }
}

/// Table of outstanding calls for one process.
#[derive(Debug)]
pub struct InvocationContext {
    next_sequence: AtomicI64,
    pending: DashMap<i64, Invocation>,
    serializers: Arc<SerializerRegistry>,
    default_timeout: Duration,
}

impl InvocationContext {
    pub fn new(serializers: Arc<SerializerRegistry>, default_timeout: Duration) -> Self {
        Self {
            next_sequence: AtomicI64::new(0),
            pending: DashMap::new(),
            serializers,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.serializers
    }

    /// Monotonic and never 0, which is reserved for uncorrelated messages.
    pub fn next_sequence_number(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_invocation(&self, invocation: Invocation) {
        let sequence = invocation.sequence_number;
        if let Some(previous) = self.pending.insert(sequence, invocation) {
            warn!(
                "Sequence {} was still outstanding for {}; abandoning the older call",
                sequence, previous.protocol_id
            );
            let protocol = previous.protocol_id;
            self.fail(previous, RpcError::Abandoned(protocol));
        }
    }

    pub fn remove_invocation(&self, sequence_number: i64) -> Option<Invocation> {
        self.pending
            .remove(&sequence_number)
            .map(|(_, invocation)| invocation)
    }

    pub fn contains(&self, sequence_number: i64) -> bool {
        self.pending.contains_key(&sequence_number)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Completes the invocation matching `message`.
    ///
    /// `link_serializer` is the serializer the response body was encoded
    /// with. Returns `false` for late or unknown responses, which are dropped.
    pub fn complete(&self, message: Message, link_serializer: &dyn Serializer) -> bool {
        let sequence = message.sequence_number();
        let Some(invocation) = self.remove_invocation(sequence) else {
            debug!(
                "Dropping late response seq={} protocol={}",
                sequence,
                message.protocol_id()
            );
            return false;
        };

        trace!("Completing {:?}", invocation);
        match invocation.completion {
            Completion::Waiter(waiter) => {
                if waiter.send(Ok(message)).is_err() {
                    debug!("Caller of seq {} stopped waiting", sequence);
                }
            }
            Completion::Forward { reply_to } => {
                self.relay(&reply_to, invocation.parent_sequence_number, message, link_serializer);
            }
        }
        true
    }

    fn relay(&self, reply_to: &SessionRef, parent_sequence: i64, message: Message, link_serializer: &dyn Serializer) {
        if parent_sequence == 0 {
            return;
        }
        let target = match self.serializers.get(reply_to.serialize_type()) {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot relay response to {}: {}", reply_to.id(), e);
                return;
            }
        };

        let response = match codec::transcode(link_serializer, target.as_ref(), message.body()) {
            Ok(body) => Message::response(reply_to.family(), parent_sequence, message.protocol_id(), body),
            Err(e) => {
                warn!(
                    "Failed to re-encode response {} for {}: {}",
                    message.protocol_id(),
                    reply_to.id(),
                    e
                );
                match error_message(reply_to, parent_sequence, ErrorCode::UNKNOWN, "unknown error", target.as_ref()) {
                    Some(response) => response,
                    None => return,
                }
            }
        };

        if reply_to.send(response).is_err() {
            debug!("Original caller {} disconnected before the relay", reply_to.id());
        }
    }

    /// Removes the invocation for `sequence_number` and fails it with
    /// `error`. Returns `false` if it already completed or expired.
    pub fn fail_invocation(&self, sequence_number: i64, error: RpcError) -> bool {
        match self.remove_invocation(sequence_number) {
            Some(invocation) => {
                self.fail(invocation, error);
                true
            }
            None => false,
        }
    }

    fn fail(&self, invocation: Invocation, error: RpcError) {
        match invocation.completion {
            Completion::Waiter(waiter) => {
                let _ = waiter.send(Err(error));
            }
            Completion::Forward { reply_to } => {
                warn!(
                    "Forwarded call {} for {} failed: {}",
                    invocation.protocol_id,
                    reply_to.id(),
                    error
                );
                if invocation.parent_sequence_number == 0 {
                    return;
                }
                let Ok(target) = self.serializers.get(reply_to.serialize_type()) else {
                    return;
                };
                if let Some(response) = error_message(
                    &reply_to,
                    invocation.parent_sequence_number,
                    error.error_code(),
                    &error.wire_message(),
                    target.as_ref(),
                ) {
                    let _ = reply_to.send(response);
                }
            }
        }
    }

    /// Removes every invocation whose deadline is at or before `now`, failing
    /// it with a timeout. Returns how many were evicted.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for sequence in expired {
            if let Some((_, invocation)) = self
                .pending
                .remove_if(&sequence, |_, invocation| invocation.deadline <= now)
            {
                debug!(
                    "⏱️ Call {} seq={} timed out after {:?}",
                    invocation.protocol_id, sequence, invocation.timeout
                );
                let error = invocation.timeout_error();
                self.fail(invocation, error);
                evicted += 1;
            }
        }
        evicted
    }

    /// Waits for the result of a registered invocation until `deadline`.
    ///
    /// On timeout the invocation is evicted and a timeout fault returned.
    pub async fn wait(
        &self,
        sequence_number: i64,
        protocol_id: ProtocolId,
        receiver: oneshot::Receiver<Result<Message, RpcError>>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Abandoned(protocol_id)),
            Err(_) => {
                self.remove_invocation(sequence_number);
                Err(RpcError::Timeout {
                    protocol: protocol_id,
                    sequence: sequence_number,
                    after: timeout,
                })
            }
        }
    }

    /// Starts the background sweeper for invocations nobody waits on
    /// synchronously. Stops when `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = context.evict_expired(Instant::now());
                        if evicted > 0 {
                            debug!("🧹 Evicted {} expired invocations", evicted);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn error_message(
    reply_to: &SessionRef,
    sequence_number: i64,
    code: ErrorCode,
    message: &str,
    serializer: &dyn Serializer,
) -> Option<Message> {
    match codec::encode(serializer, &ErrorResponse::new(code, message)) {
        Ok(body) => Some(Message::error_response(reply_to.family(), sequence_number, body)),
        Err(e) => {
            warn!("Failed to encode error response: {}", e);
            None
        }
    }
}

/// Turns a response frame into the caller's result type. Error frames become
/// [`RpcError::Remote`].
pub fn decode_response<T: DeserializeOwned>(serializer: &dyn Serializer, message: &Message) -> Result<T, RpcError> {
    if message.is_error() {
        let error: ErrorResponse = codec::decode(serializer, message.body())?;
        return Err(RpcError::Remote {
            code: error.code,
            message: error.message,
        });
    }
    Ok(codec::decode(serializer, message.body())?)
}

/// Handle to the result of an asynchronous call.
#[must_use = "a pending call does nothing unless waited on"]
pub struct PendingCall<T> {
    sequence_number: i64,
    protocol_id: ProtocolId,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<Message, RpcError>>,
    invocations: Arc<InvocationContext>,
    serializer: Arc<dyn Serializer>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PendingCall<T> {
    pub fn new(
        invocation: &Invocation,
        receiver: oneshot::Receiver<Result<Message, RpcError>>,
        invocations: Arc<InvocationContext>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            sequence_number: invocation.sequence_number,
            protocol_id: invocation.protocol_id,
            deadline: invocation.deadline,
            timeout: invocation.timeout,
            receiver,
            invocations,
            serializer,
            _marker: PhantomData,
        }
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    /// Waits for the response, at most until the call's deadline.
    pub async fn wait(self) -> Result<T, RpcError> {
        let message = self
            .invocations
            .wait(
                self.sequence_number,
                self.protocol_id,
                self.receiver,
                self.deadline,
                self.timeout,
            )
            .await?;
        decode_response(self.serializer.as_ref(), &message)
    }
}

impl<T> std::fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("sequence_number", &self.sequence_number)
            .field("protocol_id", &self.protocol_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DeflateJsonSerializer, JsonSerializer};
    use crate::message::{MessageKind, ProtocolFamily};
    use crate::session::SessionManager;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    const LOOKUP: ProtocolId = ProtocolId::new(20, 1);

    fn context(timeout: Duration) -> Arc<InvocationContext> {
        Arc::new(InvocationContext::new(Arc::new(SerializerRegistry::default()), timeout))
    }

    #[test]
    fn test_sequence_numbers_are_unique_and_nonzero() {
        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let first = invocations.next_sequence_number();
        let second = invocations.next_sequence_number();
        assert!(first > 0);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_complete_fulfils_waiter() {
        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let seq = invocations.next_sequence_number();
        let (invocation, receiver) =
            Invocation::waiting(&CallContext::new(8, 0), seq, LOOKUP, false, DEFAULT_RPC_TIMEOUT);
        let pending: PendingCall<Value> =
            PendingCall::new(&invocation, receiver, invocations.clone(), Arc::new(JsonSerializer));
        invocations.add_invocation(invocation);

        let response = Message::response(ProtocolFamily::Internal, seq, LOOKUP, r#"{"gold":10}"#);
        assert!(invocations.complete(response, &JsonSerializer));
        assert_eq!(pending.wait().await.unwrap(), json!({"gold": 10}));
        assert_eq!(invocations.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let late = Message::response(ProtocolFamily::Internal, 999, LOOKUP, "{}");
        assert!(!invocations.complete(late, &JsonSerializer));
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_fault() {
        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let seq = invocations.next_sequence_number();
        let (invocation, receiver) =
            Invocation::waiting(&CallContext::default(), seq, LOOKUP, true, DEFAULT_RPC_TIMEOUT);
        let pending: PendingCall<Value> =
            PendingCall::new(&invocation, receiver, invocations.clone(), Arc::new(JsonSerializer));
        invocations.add_invocation(invocation);

        let body = codec::encode(&JsonSerializer, &ErrorResponse::new(ErrorCode(1404), "no such item")).unwrap();
        invocations.complete(Message::error_response(ProtocolFamily::Internal, seq, body), &JsonSerializer);

        match pending.wait().await {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, ErrorCode(1404));
                assert_eq!(message, "no such item");
            }
            other => panic!("expected remote fault, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_and_is_evicted() {
        let timeout = Duration::from_millis(500);
        let invocations = context(timeout);
        let seq = invocations.next_sequence_number();
        let (invocation, receiver) = Invocation::waiting(&CallContext::default(), seq, LOOKUP, true, timeout);
        let pending: PendingCall<Value> =
            PendingCall::new(&invocation, receiver, invocations.clone(), Arc::new(JsonSerializer));
        invocations.add_invocation(invocation);

        let started = Instant::now();
        let result = pending.wait().await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RpcError::Timeout { sequence, .. }) if sequence == seq));
        assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
        assert!(elapsed <= timeout + Duration::from_millis(5), "timed out late: {elapsed:?}");
        assert!(!invocations.contains(seq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_async_calls() {
        let timeout = Duration::from_millis(200);
        let invocations = context(timeout);
        let (shutdown, _) = broadcast::channel(1);
        let reaper = invocations.spawn_reaper(timeout / 4, shutdown.subscribe());

        let seq = invocations.next_sequence_number();
        let (invocation, mut receiver) = Invocation::waiting(&CallContext::default(), seq, LOOKUP, false, timeout);
        invocations.add_invocation(invocation);

        tokio::time::sleep(timeout + timeout / 4 + Duration::from_millis(1)).await;
        assert!(!invocations.contains(seq));
        assert!(matches!(receiver.try_recv(), Ok(Err(RpcError::Timeout { .. }))));

        shutdown.send(()).unwrap();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarded_response_is_relayed_to_original_caller() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = sessions.create_session(
            "127.0.0.1:5555".parse().unwrap(),
            ProtocolFamily::External,
            DeflateJsonSerializer::TYPE,
            tx,
        );

        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let seq = invocations.next_sequence_number();
        let ctx = CallContext::new(77, 42);
        invocations.add_invocation(Invocation::forwarding(&ctx, seq, LOOKUP, client.clone(), DEFAULT_RPC_TIMEOUT));

        let peer_body = codec::encode(&JsonSerializer, &json!({"x": 2})).unwrap();
        invocations.complete(Message::response(ProtocolFamily::Internal, seq, LOOKUP, peer_body), &JsonSerializer);

        let relayed = rx.try_recv().expect("Response should be relayed");
        assert_eq!(relayed.family(), ProtocolFamily::External);
        assert_eq!(relayed.kind(), MessageKind::Response);
        assert_eq!(relayed.sequence_number(), 42);
        let body: Value = codec::decode(&DeflateJsonSerializer::default(), relayed.body()).unwrap();
        assert_eq!(body, json!({"x": 2}));
    }

    #[tokio::test]
    async fn test_forwarded_timeout_reports_error_to_caller() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = sessions.create_session("127.0.0.1:5556".parse().unwrap(), ProtocolFamily::External, 0, tx);

        let invocations = context(Duration::from_millis(10));
        let seq = invocations.next_sequence_number();
        invocations.add_invocation(Invocation::forwarding(
            &CallContext::new(77, 9),
            seq,
            LOOKUP,
            client,
            Duration::from_millis(10),
        ));

        assert_eq!(invocations.evict_expired(Instant::now() + Duration::from_millis(20)), 1);
        let error = rx.try_recv().expect("Timeout should be reported");
        assert!(error.is_error());
        assert_eq!(error.sequence_number(), 9);
        let body: ErrorResponse = codec::decode(&JsonSerializer, error.body()).unwrap();
        assert_eq!(body.code, ErrorCode::TIMEOUT);
        assert_eq!(body.message, "timeout");
    }

    #[tokio::test]
    async fn test_failed_forward_keeps_link_details_off_the_wire() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = sessions.create_session("127.0.0.1:5557".parse().unwrap(), ProtocolFamily::External, 0, tx);

        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let seq = invocations.next_sequence_number();
        invocations.add_invocation(Invocation::forwarding(
            &CallContext::new(77, 12),
            seq,
            LOOKUP,
            client,
            DEFAULT_RPC_TIMEOUT,
        ));

        let dropped = RpcError::Connection {
            address: "10.1.2.3:7000".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(invocations.fail_invocation(seq, dropped));
        assert!(!invocations.contains(seq));

        let error = rx.try_recv().expect("Failure should be reported");
        assert_eq!(error.sequence_number(), 12);
        let body: ErrorResponse = codec::decode(&JsonSerializer, error.body()).unwrap();
        assert_eq!(body.code, ErrorCode::UNKNOWN);
        assert_eq!(body.message, "unknown error");
    }

    #[tokio::test]
    async fn test_fail_invocation_wakes_waiter_once() {
        let invocations = context(DEFAULT_RPC_TIMEOUT);
        let seq = invocations.next_sequence_number();
        let (invocation, receiver) =
            Invocation::waiting(&CallContext::default(), seq, LOOKUP, true, DEFAULT_RPC_TIMEOUT);
        invocations.add_invocation(invocation);

        let lost = || RpcError::Connection {
            address: "10.1.2.3:7000".to_string(),
            reason: "link closed".to_string(),
        };
        assert!(invocations.fail_invocation(seq, lost()));
        assert!(!invocations.fail_invocation(seq, lost()));
        assert!(matches!(receiver.await, Ok(Err(RpcError::Connection { .. }))));
    }
}
