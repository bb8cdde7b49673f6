// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol registry mapping numeric `type_id`s to message handlers.
//!
//! Unlike an `enum_dispatch`-based closed set of opcodes known at compile
//! time, this registry is open at runtime: application code registers
//! arbitrary [`MessageType`]s before the service starts, and the map is
//! frozen (wrapped in `Arc`) once [`crate::service::Service::start`] is
//! called — the registry is read-only from then on.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{Error, ErrorKind},
    message::MessageType,
};

/// Invoked on the receiving side once a complete message payload has been
/// decoded.
#[async_trait]
pub trait MessageHandler<T: MessageType>: Send + Sync {
    /// `is_response` is `true` when the incoming message answers one of ours;
    /// such messages are also routed to the waiting completion by
    /// `receiver_request_id` regardless of what this returns. A `Some`
    /// return value is sent back to the peer as a reply.
    async fn on_receive(&self, message: T, is_response: bool) -> Option<T>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: MessageType,
    F: Fn(T, bool) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Option<T>> + Send,
{
    async fn on_receive(&self, message: T, is_response: bool) -> Option<T> {
        (self)(message, is_response).await
    }
}

/// Type-erased half of the registry: deserializes a dynamically typed
/// message by its registered `type_id` and drives the handler, re-serializing
/// any reply. Keeps the slab in [`Protocol`] homogeneous without a `dyn Any`
/// downcast anywhere.
#[async_trait]
trait ErasedHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    async fn deserialize_and_dispatch(
        &self,
        bytes: &[u8],
        is_response: bool,
    ) -> Result<Option<Vec<u8>>, Error>;
}

struct TypedHandler<T: MessageType, H: MessageHandler<T>> {
    handler: H,
    _marker: std::marker::PhantomData<T>,
}

#[async_trait]
impl<T, H> ErasedHandler for TypedHandler<T, H>
where
    T: MessageType,
    H: MessageHandler<T>,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    async fn deserialize_and_dispatch(
        &self,
        bytes: &[u8],
        is_response: bool,
    ) -> Result<Option<Vec<u8>>, Error> {
        let value: T = bincode::deserialize(bytes)
            .map_err(|e| Error::with_source(ErrorKind::ServiceUnknownMessageType, e))?;
        let reply = self.handler.on_receive(value, is_response).await;
        match reply {
            None => Ok(None),
            Some(r) => {
                let bytes = bincode::serialize(&r)
                    .map_err(|e| Error::with_source(ErrorKind::ServiceUnknownMessageType, e))?;
                Ok(Some(bytes))
            },
        }
    }
}

/// Registration-time builder. Collected into an immutable [`Protocol`] by
/// [`ProtocolBuilder::build`].
#[derive(Default)]
pub struct ProtocolBuilder {
    handlers: HashMap<u32, Box<dyn ErasedHandler>>,
}

impl ProtocolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers message type `T` under `type_id`, along with the handler
    /// invoked when a complete instance of `T` arrives on any connection.
    ///
    /// Panics if `type_id` is already registered — this mirrors the
    /// original's `registerType` which asserts on duplicate ids at startup,
    /// a programmer error rather than a runtime condition.
    pub fn register<T, H>(&mut self, type_id: u32, handler: H) -> &mut Self
    where
        T: MessageType,
        H: MessageHandler<T> + 'static,
    {
        let entry = TypedHandler {
            handler,
            _marker: std::marker::PhantomData::<T>,
        };
        if self.handlers.insert(type_id, Box::new(entry)).is_some() {
            panic!("mpipc: duplicate message type_id {type_id}");
        }
        self
    }

    pub fn build(self) -> Protocol {
        Protocol {
            handlers: self.handlers,
        }
    }
}

/// Frozen, read-only protocol registry shared across every pool and
/// connection via `Arc`.
pub struct Protocol {
    handlers: HashMap<u32, Box<dyn ErasedHandler>>,
}

impl Protocol {
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::new()
    }

    pub fn type_name(&self, type_id: u32) -> Option<&'static str> {
        self.handlers.get(&type_id).map(|e| e.type_name())
    }

    pub(crate) async fn dispatch(
        &self,
        type_id: u32,
        payload: &[u8],
        is_response: bool,
    ) -> Result<Option<Vec<u8>>, Error> {
        let entry = self
            .handlers
            .get(&type_id)
            .ok_or_else(|| Error::new(ErrorKind::ServiceUnknownMessageType))?;
        entry.deserialize_and_dispatch(payload, is_response).await
    }

    /// Serializes an application value of a registered type into wire bytes.
    /// Used by senders that hand a typed value (rather than pre-serialized
    /// bytes) to [`crate::service::Service`].
    pub fn encode<T: MessageType>(value: &T) -> Result<Vec<u8>, Error> {
        bincode::serialize(value)
            .map_err(|e| Error::with_source(ErrorKind::ServiceUnknownMessageType, e))
    }

    pub fn decode<T: MessageType>(bytes: &[u8]) -> Result<T, Error> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::with_source(ErrorKind::ServiceUnknownMessageType, e))
    }
}

pub type SharedProtocol = Arc<Protocol>;

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Echo(String);

    #[tokio::test]
    async fn dispatches_to_registered_handler_and_echoes_reply() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let mut builder = Protocol::builder();
        builder.register::<Echo, _>(7, move |msg: Echo, is_response: bool| {
            let seen = seen2.clone();
            async move {
                assert!(!is_response);
                seen.lock().await.push(msg.0.clone());
                Some(msg)
            }
        });
        let protocol = builder.build();

        let payload = Protocol::encode(&Echo("hello".into())).expect("encode");
        let reply = protocol
            .dispatch(7, &payload, false)
            .await
            .expect("dispatch")
            .expect("reply bytes");
        let decoded: Echo = Protocol::decode(&reply).expect("decode reply");
        assert_eq!(decoded, Echo("hello".into()));
        assert_eq!(*seen.lock().await, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_id_is_an_error() {
        let protocol = Protocol::builder().build();
        let err = protocol.dispatch(99, &[], false).await.unwrap_err();
        assert!(err.is(&ErrorKind::ServiceUnknownMessageType));
    }
}
