//! The protocol registry: which protocol ids exist, where they are served,
//! and which of them this process can serve itself.
//!
//! Two tables are kept apart. The *declared* table describes every protocol
//! the cluster knows about, including ones served by other server types; a
//! gateway uses it to decide where to forward. The *request* table holds the
//! handlers this process actually runs. Both are filled during startup
//! wiring and frozen behind an `Arc` afterwards.

use crate::cluster::ServerType;
use crate::error::RegistryError;
use crate::handler::{handler_fn, HandlerArgs, HandlerError, RequestHandler};
use crate::message::ProtocolId;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// A parameter the dispatcher fills in when invoking a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamBinding {
    /// The session the request arrived on.
    Session,
    /// The caller identity. Always available through the call context; this
    /// binding documents that the handler uses it.
    Identity,
    /// The decoded request body.
    Body,
    /// The identities listed in a push envelope body.
    PushTargets,
}

/// Whether the dispatcher waits for the handler before writing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerMode {
    /// The response is written when the handler returns, even when empty.
    Sync,
    /// The handler completes off the worker; a response is written only when
    /// it produces a body.
    Async,
}

/// Everything known about one protocol id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    protocol_id: ProtocolId,
    name: String,
    target: ServerType,
    bindings: Vec<ParamBinding>,
    mode: HandlerMode,
    requires_identity: bool,
    response_type: Option<&'static str>,
}

impl HandlerDescriptor {
    pub fn builder(protocol_id: ProtocolId, name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            descriptor: HandlerDescriptor {
                protocol_id,
                name: name.into(),
                target: ServerType::default(),
                bindings: Vec::new(),
                mode: HandlerMode::Sync,
                requires_identity: false,
                response_type: None,
            },
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server type that serves this protocol.
    pub fn target(&self) -> &ServerType {
        &self.target
    }

    pub fn bindings(&self) -> &[ParamBinding] {
        &self.bindings
    }

    pub fn binds(&self, binding: ParamBinding) -> bool {
        self.bindings.contains(&binding)
    }

    pub fn mode(&self) -> HandlerMode {
        self.mode
    }

    pub fn is_sync(&self) -> bool {
        self.mode == HandlerMode::Sync
    }

    pub fn requires_identity(&self) -> bool {
        self.requires_identity
    }

    pub fn response_type(&self) -> Option<&'static str> {
        self.response_type
    }
}

impl fmt::Display for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} on {})", self.name, self.protocol_id, self.target)
    }
}

/// Builder for [`HandlerDescriptor`]. Bindings are recorded in call order.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    descriptor: HandlerDescriptor,
}

impl DescriptorBuilder {
    pub fn target(mut self, target: impl Into<ServerType>) -> Self {
        self.descriptor.target = target.into();
        self
    }

    pub fn bind(mut self, binding: ParamBinding) -> Self {
        if !self.descriptor.bindings.contains(&binding) {
            self.descriptor.bindings.push(binding);
        }
        self
    }

    pub fn session(self) -> Self {
        self.bind(ParamBinding::Session)
    }

    pub fn identity(self) -> Self {
        self.bind(ParamBinding::Identity)
    }

    pub fn body(self) -> Self {
        self.bind(ParamBinding::Body)
    }

    pub fn push_targets(self) -> Self {
        self.bind(ParamBinding::PushTargets)
    }

    pub fn asynchronous(mut self) -> Self {
        self.descriptor.mode = HandlerMode::Async;
        self
    }

    /// Rejects calls with no caller identity with `ErrorCode::NO_IDENTITY`.
    pub fn require_identity(mut self) -> Self {
        self.descriptor.requires_identity = true;
        self
    }

    /// Records the Rust type the handler responds with.
    pub fn responds_with<R: ?Sized>(mut self) -> Self {
        self.descriptor.response_type = Some(std::any::type_name::<R>());
        self
    }

    pub fn build(self) -> HandlerDescriptor {
        self.descriptor
    }
}

/// A handler bound in this process.
#[derive(Clone)]
pub struct RequestInvocation {
    pub descriptor: Arc<HandlerDescriptor>,
    pub handler: Arc<dyn RequestHandler>,
}

impl fmt::Debug for RequestInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInvocation")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    declared: HashMap<ProtocolId, Arc<HandlerDescriptor>>,
    requests: HashMap<ProtocolId, RequestInvocation>,
    response_shapes: HashMap<ProtocolId, &'static str>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a protocol without binding a handler.
    ///
    /// # Errors
    ///
    /// `DuplicateProtocol` if the id is already declared, `ReservedProtocol`
    /// for ids in module 0. The existing declaration is kept.
    pub fn register_handler(&mut self, descriptor: HandlerDescriptor) -> Result<(), RegistryError> {
        let protocol_id = descriptor.protocol_id();
        check_reserved(protocol_id)?;
        if self.declared.contains_key(&protocol_id) {
            return Err(RegistryError::DuplicateProtocol(protocol_id));
        }
        debug!("📝 Declared {}", descriptor);
        self.declared.insert(protocol_id, Arc::new(descriptor));
        Ok(())
    }

    /// Binds a live handler for a protocol served by this process.
    ///
    /// The protocol is declared as well when it was not declared before.
    ///
    /// # Errors
    ///
    /// `DuplicateProtocol` if a handler is already bound for the id. The
    /// existing binding is kept.
    pub fn register_request_invocation(
        &mut self,
        handler: Arc<dyn RequestHandler>,
        descriptor: HandlerDescriptor,
    ) -> Result<(), RegistryError> {
        let protocol_id = descriptor.protocol_id();
        check_reserved(protocol_id)?;
        if self.requests.contains_key(&protocol_id) {
            return Err(RegistryError::DuplicateProtocol(protocol_id));
        }

        let descriptor = Arc::new(descriptor);
        self.declared
            .entry(protocol_id)
            .or_insert_with(|| descriptor.clone());
        debug!("🔗 Bound handler for {}", descriptor);
        self.requests.insert(
            protocol_id,
            RequestInvocation {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    /// Binds a typed closure. Synchronous handlers record `R` as their
    /// response type for [`ProtocolRegistry::verify`].
    pub fn route<T, R, F, Fut>(&mut self, builder: DescriptorBuilder, handler: F) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(HandlerArgs<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let mut descriptor = builder.build();
        if descriptor.is_sync() && descriptor.response_type.is_none() {
            descriptor.response_type = Some(std::any::type_name::<R>());
        }
        self.register_request_invocation(handler_fn(handler), descriptor)
    }

    /// Declares the response shape callers expect from `protocol_id`.
    pub fn declare_response_shape<R: ?Sized>(&mut self, protocol_id: ProtocolId) {
        self.response_shapes
            .insert(protocol_id, std::any::type_name::<R>());
    }

    pub fn lookup(&self, protocol_id: ProtocolId) -> Option<&HandlerDescriptor> {
        self.declared.get(&protocol_id).map(|descriptor| descriptor.as_ref())
    }

    pub fn lookup_request_invocation(&self, protocol_id: ProtocolId) -> Option<&RequestInvocation> {
        self.requests.get(&protocol_id)
    }

    pub fn declared_count(&self) -> usize {
        self.declared.len()
    }

    pub fn bound_count(&self) -> usize {
        self.requests.len()
    }

    /// Startup consistency check for bound synchronous handlers: each must
    /// name a response type, and it must match the declared response shape
    /// when one exists.
    pub fn verify(&self) -> Result<(), RegistryError> {
        let mut bound: Vec<_> = self.requests.values().collect();
        bound.sort_by_key(|invocation| invocation.descriptor.protocol_id());

        for invocation in bound {
            let descriptor = &invocation.descriptor;
            if !descriptor.is_sync() {
                continue;
            }
            let actual = descriptor
                .response_type()
                .ok_or_else(|| RegistryError::MissingResponseType {
                    protocol: descriptor.protocol_id(),
                    name: descriptor.name().to_string(),
                })?;
            if let Some(expected) = self.response_shapes.get(&descriptor.protocol_id()) {
                if *expected != actual {
                    return Err(RegistryError::ResponseTypeMismatch {
                        protocol: descriptor.protocol_id(),
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_reserved(protocol_id: ProtocolId) -> Result<(), RegistryError> {
    if protocol_id.is_reserved() {
        return Err(RegistryError::ReservedProtocol(protocol_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RawArgs;
    use serde_json::json;

    const ECHO: ProtocolId = ProtocolId::new(10, 3);

    fn echo_builder() -> DescriptorBuilder {
        HandlerDescriptor::builder(ECHO, "echo").target("game").body()
    }

    #[test]
    fn test_duplicate_declaration_keeps_first() {
        let mut registry = ProtocolRegistry::new();
        registry
            .register_handler(echo_builder().build())
            .expect("First declaration should succeed");

        let second = HandlerDescriptor::builder(ECHO, "other").target("chat").build();
        assert!(matches!(
            registry.register_handler(second),
            Err(RegistryError::DuplicateProtocol(id)) if id == ECHO
        ));
        assert_eq!(registry.lookup(ECHO).map(|d| d.name()), Some("echo"));
    }

    #[tokio::test]
    async fn test_duplicate_binding_never_overwrites() {
        let mut registry = ProtocolRegistry::new();
        registry
            .route(echo_builder(), |_args: HandlerArgs<serde_json::Value>| async move {
                Ok::<_, HandlerError>(json!("first"))
            })
            .expect("First binding should succeed");

        let result = registry.route(echo_builder(), |_args: HandlerArgs<serde_json::Value>| async move {
            Ok::<_, HandlerError>(json!("second"))
        });
        assert!(matches!(result, Err(RegistryError::DuplicateProtocol(_))));

        let bound = registry.lookup_request_invocation(ECHO).expect("Handler should be bound");
        let response = bound.handler.call(RawArgs::default()).await.unwrap();
        assert_eq!(response, json!("first"));
        assert_eq!(registry.bound_count(), 1);
    }

    #[test]
    fn test_binding_declares_protocol() {
        let mut registry = ProtocolRegistry::new();
        registry
            .route(echo_builder(), |_args: HandlerArgs<()>| async move { Ok::<_, HandlerError>(()) })
            .unwrap();
        let descriptor = registry.lookup(ECHO).expect("Binding should declare the protocol");
        assert_eq!(descriptor.target().as_str(), "game");
        assert_eq!(descriptor.bindings(), &[ParamBinding::Body]);
    }

    #[test]
    fn test_declared_only_protocol_has_no_invocation() {
        let mut registry = ProtocolRegistry::new();
        registry
            .register_handler(HandlerDescriptor::builder(ProtocolId::new(20, 1), "remote").target("battle").build())
            .unwrap();
        assert!(registry.lookup(ProtocolId::new(20, 1)).is_some());
        assert!(registry.lookup_request_invocation(ProtocolId::new(20, 1)).is_none());
    }

    #[test]
    fn test_reserved_module_is_rejected() {
        let mut registry = ProtocolRegistry::new();
        let result = registry.register_handler(HandlerDescriptor::builder(ProtocolId::new(0, 5), "bad").build());
        assert!(matches!(result, Err(RegistryError::ReservedProtocol(_))));
    }

    #[test]
    fn test_verify_response_shapes() {
        #[derive(Serialize)]
        struct Sum {
            x: i64,
        }

        let mut registry = ProtocolRegistry::new();
        registry
            .route(echo_builder(), |_args: HandlerArgs<()>| async move {
                Ok::<_, HandlerError>(Sum { x: 1 })
            })
            .unwrap();

        registry.declare_response_shape::<Sum>(ECHO);
        assert!(registry.verify().is_ok());

        registry.declare_response_shape::<String>(ECHO);
        assert!(matches!(
            registry.verify(),
            Err(RegistryError::ResponseTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_requires_response_type_for_sync_handlers() {
        let mut registry = ProtocolRegistry::new();
        let handler = handler_fn(|_args: HandlerArgs<()>| async move { Ok::<_, HandlerError>(()) });
        registry
            .register_request_invocation(handler, echo_builder().build())
            .unwrap();
        assert!(matches!(
            registry.verify(),
            Err(RegistryError::MissingResponseType { .. })
        ));
    }
}
