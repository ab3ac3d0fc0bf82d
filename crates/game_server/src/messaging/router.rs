//! Request dispatch.
//!
//! The connection task hands every decoded request to [`Dispatcher::dispatch`]
//! and goes back to reading. Everything after that runs on the business
//! worker owning the caller's identity: the before-handle hook, the handler
//! lookup, argument binding, the handler itself and the translation of its
//! outcome into a response or error frame. Nothing a handler does, panics
//! included, escapes the worker.

use super::executor::{panic_message, ExecutorPool};
use super::forward::{DropUnsupported, ForwardOutcome, ForwardPolicy};
use super::hooks::{BeforeHandle, DefaultIdentityExtractor, IdentityExtractor};
use futures::FutureExt;
use horizon_protocol::codec;
use horizon_protocol::{
    CallContext, CodecError, ErrorCode, ErrorResponse, HandlerDescriptor, HandlerError, Message, MessageKind,
    ParamBinding, ProtocolId, ProtocolRegistry, PushEnvelope, RawArgs, SerializerRegistry, SessionRef,
};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

type HandlerOutcome = Result<Result<Value, HandlerError>, Box<dyn Any + Send>>;

/// Routes inbound requests to their handlers.
pub struct Dispatcher {
    registry: Arc<ProtocolRegistry>,
    executor: ExecutorPool,
    serializers: Arc<SerializerRegistry>,
    extractor: Arc<dyn IdentityExtractor>,
    before_handle: Option<Arc<dyn BeforeHandle>>,
    forward: Arc<dyn ForwardPolicy>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.registry.bound_count())
            .field("workers", &self.executor.size())
            .field("before_handle", &self.before_handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the default identity extractor, no hook and
    /// the dropping forward policy.
    pub fn new(registry: Arc<ProtocolRegistry>, executor: ExecutorPool, serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            registry,
            executor,
            serializers,
            extractor: Arc::new(DefaultIdentityExtractor),
            before_handle: None,
            forward: Arc::new(DropUnsupported),
        }
    }

    pub fn with_identity_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_before_handle(mut self, hook: Option<Arc<dyn BeforeHandle>>) -> Self {
        self.before_handle = hook;
        self
    }

    pub fn with_forward_policy(mut self, forward: Arc<dyn ForwardPolicy>) -> Self {
        self.forward = forward;
        self
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Queues `message` on the worker that owns its caller.
    ///
    /// Only requests are dispatched; other kinds are logged and discarded.
    /// Heartbeats never get here.
    pub fn dispatch(self: &Arc<Self>, session: &SessionRef, message: Message) {
        if message.kind() != MessageKind::Request {
            debug!(
                "Discarding {:?} {} from {}",
                message.kind(),
                message.protocol_id(),
                session.id()
            );
            return;
        }

        let identity = self.extractor.extract(session, &message);
        let ctx = CallContext::new(identity, message.sequence_number());
        let dispatcher = Arc::clone(self);
        let session = Arc::clone(session);
        self.executor.execute(identity, async move {
            dispatcher.process(session, message, ctx).await;
        });
    }

    async fn process(self: Arc<Self>, session: SessionRef, message: Message, ctx: CallContext) {
        let protocol_id = message.protocol_id();

        if let Some(hook) = &self.before_handle {
            if !hook.before_handle(&session, &message, &ctx).await {
                trace!("Hook rejected {} from {}", protocol_id, session.id());
                return;
            }
        }

        let Some(invocation) = self.registry.lookup_request_invocation(protocol_id).cloned() else {
            self.route_unbound(&session, message, ctx).await;
            return;
        };
        let descriptor = invocation.descriptor;

        if descriptor.requires_identity() && !ctx.has_identity() {
            self.reply_error(&session, ctx, ErrorCode::NO_IDENTITY, "no identity");
            return;
        }

        let args = match self.bind_arguments(&descriptor, &session, &message, ctx) {
            Ok(args) => args,
            Err(e) => {
                debug!("Malformed {} from {}: {}", protocol_id, session.id(), e);
                self.reply_error(&session, ctx, ErrorCode::BAD_REQUEST, format!("malformed request body: {e}"));
                return;
            }
        };

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| invocation.handler.call(args))) {
            Ok(future) => future,
            Err(panic) => {
                self.respond(&session, ctx, protocol_id, true, Err(panic));
                return;
            }
        };

        if descriptor.is_sync() {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            self.respond(&session, ctx, protocol_id, true, outcome);
        } else {
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(future).catch_unwind().await;
                self.respond(&session, ctx, protocol_id, false, outcome);
            });
        }
    }

    async fn route_unbound(&self, session: &SessionRef, message: Message, ctx: CallContext) {
        let protocol_id = message.protocol_id();
        match self.forward.forward(session, message, ctx).await {
            ForwardOutcome::Forwarded { server_id } => {
                trace!("{} handed to server {}", protocol_id, server_id);
            }
            ForwardOutcome::Dropped => {
                debug!("No handler for {} from {}, dropping", protocol_id, session.id());
            }
            ForwardOutcome::Unsupported => {
                self.reply_error(
                    session,
                    ctx,
                    ErrorCode::UNSUPPORTED_PROTOCOL,
                    format!("protocol {protocol_id} is not supported"),
                );
            }
            ForwardOutcome::Failed(e) => {
                warn!("Forwarding {} from {} failed: {}", protocol_id, session.id(), e);
                self.reply_error(session, ctx, e.error_code(), e.wire_message());
            }
        }
    }

    fn bind_arguments(
        &self,
        descriptor: &HandlerDescriptor,
        session: &SessionRef,
        message: &Message,
        ctx: CallContext,
    ) -> Result<RawArgs, CodecError> {
        let mut args = RawArgs {
            ctx,
            ..RawArgs::default()
        };

        for binding in descriptor.bindings() {
            match binding {
                ParamBinding::Session => args.session = Some(Arc::clone(session)),
                // Carried by the context.
                ParamBinding::Identity => {}
                ParamBinding::Body => {
                    if !descriptor.binds(ParamBinding::PushTargets) {
                        args.body = self.decode_body(session, message)?;
                    }
                }
                ParamBinding::PushTargets => {
                    let envelope: PushEnvelope = serde_json::from_value(self.decode_body(session, message)?)?;
                    args.push_targets = envelope.targets;
                    args.body = envelope.body;
                }
            }
        }
        Ok(args)
    }

    fn decode_body(&self, session: &SessionRef, message: &Message) -> Result<Value, CodecError> {
        let serializer = self.serializers.get(session.serialize_type())?;
        codec::decode(serializer.as_ref(), message.body())
    }

    fn respond(
        &self,
        session: &SessionRef,
        ctx: CallContext,
        protocol_id: ProtocolId,
        synchronous: bool,
        outcome: HandlerOutcome,
    ) {
        match outcome {
            Ok(Ok(value)) => {
                if value.is_null() && !synchronous {
                    return;
                }
                self.reply(session, ctx, protocol_id, &value);
            }
            Ok(Err(HandlerError::Domain { code, message })) => {
                debug!("Handler {} refused: {} {}", protocol_id, code, message);
                self.reply_error(session, ctx, code, message);
            }
            Ok(Err(HandlerError::Unexpected(e))) => {
                error!("❌ Handler {} failed for identity {}: {}", protocol_id, ctx.identity, e);
                self.reply_error(session, ctx, ErrorCode::UNKNOWN, "unknown error");
            }
            Err(panic) => {
                error!(
                    "💥 Handler {} panicked for identity {}: {}",
                    protocol_id,
                    ctx.identity,
                    panic_message(&*panic)
                );
                self.reply_error(session, ctx, ErrorCode::UNKNOWN, "unknown error");
            }
        }
    }

    fn reply(&self, session: &SessionRef, ctx: CallContext, protocol_id: ProtocolId, value: &Value) {
        if !ctx.expects_response() {
            return;
        }
        let body = match self
            .serializers
            .get(session.serialize_type())
            .and_then(|serializer| codec::encode(serializer.as_ref(), value))
        {
            Ok(body) => body,
            Err(e) => {
                error!("❌ Failed to encode response {} for {}: {}", protocol_id, session.id(), e);
                self.reply_error(session, ctx, ErrorCode::UNKNOWN, "unknown error");
                return;
            }
        };
        let response = Message::response(session.family(), ctx.sequence_number, protocol_id, body);
        if session.send(response).is_err() {
            debug!("{} closed before response {} was sent", session.id(), protocol_id);
        }
    }

    fn reply_error(&self, session: &SessionRef, ctx: CallContext, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        if !ctx.expects_response() {
            debug!("Error {} for fire-and-forget call from {}: {}", code, session.id(), message);
            return;
        }
        let body = match self
            .serializers
            .get(session.serialize_type())
            .and_then(|serializer| codec::encode(serializer.as_ref(), &ErrorResponse::new(code, message)))
        {
            Ok(body) => body,
            Err(e) => {
                error!("❌ Failed to encode error response for {}: {}", session.id(), e);
                return;
            }
        };
        if session
            .send(Message::error_response(session.family(), ctx.sequence_number, body))
            .is_err()
        {
            debug!("{} closed before its error response was sent", session.id());
        }
    }
}
