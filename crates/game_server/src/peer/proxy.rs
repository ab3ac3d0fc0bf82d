//! Call-style stubs over a peer link.
//!
//! A remote contract is a static table of the methods one server type
//! exposes to the rest of the cluster. Hand-written stub structs wrap a
//! [`CallProxy`] and forward each method to the declared protocol id, so a
//! method declared for fire-and-forget can't accidentally be awaited and a
//! synchronous one can't be fired blind.

use super::PeerClient;
use horizon_protocol::{CallContext, PendingCall, ProtocolId, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// How a remote method is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// The caller waits, bounded by the call timeout.
    Sync,
    /// The caller gets a [`PendingCall`] and continues.
    Async,
    /// No response is expected; sent with sequence number 0.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMethod {
    pub name: &'static str,
    pub protocol_id: ProtocolId,
    pub mode: CallMode,
}

impl RemoteMethod {
    pub const fn new(name: &'static str, protocol_id: ProtocolId, mode: CallMode) -> Self {
        Self {
            name,
            protocol_id,
            mode,
        }
    }
}

/// Methods one server type serves for its peers.
#[derive(Debug)]
pub struct RemoteContract {
    pub name: &'static str,
    /// Server type hosting the contract.
    pub target: &'static str,
    pub methods: &'static [RemoteMethod],
}

impl RemoteContract {
    pub fn method(&self, protocol_id: ProtocolId) -> Option<&'static RemoteMethod> {
        self.methods.iter().find(|method| method.protocol_id == protocol_id)
    }
}

/// A contract bound to one peer connection.
#[derive(Clone)]
pub struct CallProxy {
    client: Arc<PeerClient>,
    contract: &'static RemoteContract,
}

impl std::fmt::Debug for CallProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallProxy")
            .field("contract", &self.contract.name)
            .field("address", &self.client.address())
            .finish()
    }
}

impl CallProxy {
    pub(crate) fn new(client: Arc<PeerClient>, contract: &'static RemoteContract) -> Self {
        Self { client, contract }
    }

    pub fn contract(&self) -> &'static RemoteContract {
        self.contract
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        &self.client
    }

    /// Invokes a synchronous method and waits for its result.
    ///
    /// # Errors
    ///
    /// `UnknownMethod` or `CallStyleMismatch` if the contract does not
    /// declare `protocol_id` as synchronous, plus every failure of
    /// [`PeerClient::call`].
    pub async fn call<A, R>(&self, ctx: &CallContext, protocol_id: ProtocolId, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.expect_mode(protocol_id, CallMode::Sync)?;
        self.client.call(ctx, protocol_id, args).await
    }

    /// Invokes an asynchronous method; the result is collected later from
    /// the returned handle.
    pub async fn call_async<A, R>(
        &self,
        ctx: &CallContext,
        protocol_id: ProtocolId,
        args: &A,
    ) -> Result<PendingCall<R>, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.expect_mode(protocol_id, CallMode::Async)?;
        self.client.call_async(ctx, protocol_id, args).await
    }

    /// Fires a method declared as a notification.
    pub async fn notify<A>(&self, ctx: &CallContext, protocol_id: ProtocolId, args: &A) -> Result<(), RpcError>
    where
        A: Serialize + ?Sized,
    {
        self.expect_mode(protocol_id, CallMode::Notify)?;
        self.client.notify(ctx, protocol_id, args).await
    }

    fn expect_mode(&self, protocol_id: ProtocolId, mode: CallMode) -> Result<(), RpcError> {
        let method = self.contract.method(protocol_id).ok_or(RpcError::UnknownMethod {
            contract: self.contract.name,
            protocol: protocol_id,
        })?;
        if method.mode != mode {
            return Err(RpcError::CallStyleMismatch {
                contract: self.contract.name,
                method: method.name,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConfig;
    use horizon_protocol::{InvocationContext, JsonSerializer, SerializerRegistry};
    use std::time::Duration;

    const GET: ProtocolId = ProtocolId::new(40, 1);
    const FETCH: ProtocolId = ProtocolId::new(40, 2);
    const POKE: ProtocolId = ProtocolId::new(40, 3);

    static INVENTORY: RemoteContract = RemoteContract {
        name: "inventory",
        target: "game",
        methods: &[
            RemoteMethod::new("get", GET, CallMode::Sync),
            RemoteMethod::new("fetch", FETCH, CallMode::Async),
            RemoteMethod::new("poke", POKE, CallMode::Notify),
        ],
    };

    fn proxy() -> CallProxy {
        let invocations = Arc::new(InvocationContext::new(
            Arc::new(SerializerRegistry::default()),
            Duration::from_millis(100),
        ));
        // Nothing listens here; the checks below fail before connecting.
        let client = Arc::new(PeerClient::new(
            "127.0.0.1:1".parse().unwrap(),
            PeerConfig::default(),
            invocations,
            Arc::new(JsonSerializer),
        ));
        client.call_proxy(&INVENTORY)
    }

    #[test]
    fn test_contract_lookup() {
        assert_eq!(INVENTORY.method(FETCH).map(|m| m.name), Some("fetch"));
        assert!(INVENTORY.method(ProtocolId::new(40, 9)).is_none());
    }

    #[tokio::test]
    async fn test_call_style_is_enforced() {
        let proxy = proxy();
        let ctx = CallContext::for_identity(7);

        let result: Result<serde_json::Value, _> = proxy.call(&ctx, FETCH, &()).await;
        assert!(matches!(
            result,
            Err(RpcError::CallStyleMismatch { method: "fetch", .. })
        ));

        let result = proxy.notify(&ctx, GET, &()).await;
        assert!(matches!(result, Err(RpcError::CallStyleMismatch { method: "get", .. })));
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let proxy = proxy();
        let result: Result<serde_json::Value, _> =
            proxy.call(&CallContext::default(), ProtocolId::new(41, 1), &()).await;
        assert!(matches!(result, Err(RpcError::UnknownMethod { contract: "inventory", .. })));
    }
}
