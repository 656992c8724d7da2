//! Registry of live protocol handlers keyed by connection id.
//!
//! Holds weak references only; a connection keeps its own handler alive
//! while it has work in flight and the registry entry dies with it. All
//! commands-handler callbacks run outside the registry lock.

use crate::bytes::ByteSlice;
use crate::config::NetConfig;
use crate::net::handler::{CommandsHandler, InvokeCallback, InvokeError, LevinHandler};
use crate::net::levin::MessageWriter;
use crate::net::types::ConnectionContext;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub struct Registry {
    connections: Mutex<HashMap<Uuid, Weak<LevinHandler>>>,
    incoming_count: AtomicUsize,
    outgoing_count: AtomicUsize,
    commands: Arc<dyn CommandsHandler>,
    config: NetConfig,
}

impl Registry {
    pub fn new(commands: Arc<dyn CommandsHandler>, config: NetConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            incoming_count: AtomicUsize::new(0),
            outgoing_count: AtomicUsize::new(0),
            commands,
            config,
        })
    }

    pub fn commands(&self) -> &dyn CommandsHandler {
        &*self.commands
    }

    pub fn net_config(&self) -> &NetConfig {
        &self.config
    }

    /// Track a freshly created handler. Returns false when the id is
    /// already present (the connection must then be dropped).
    pub fn register(&self, handler: &Arc<LevinHandler>) -> bool {
        let ctx = handler.context_snapshot();
        {
            let mut connections = self.connections.lock().unwrap();
            if connections.contains_key(&ctx.id) {
                return false;
            }
            connections.insert(ctx.id, Arc::downgrade(handler));
            if ctx.is_incoming {
                self.incoming_count.fetch_add(1, Ordering::SeqCst);
            } else {
                self.outgoing_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.commands.on_connection_new(&ctx);
        true
    }

    /// Remove a handler on terminal state; fires `on_connection_close`
    /// when the entry was still present.
    pub fn unregister(&self, handler: &LevinHandler) {
        let ctx = handler.context_snapshot();
        {
            let mut connections = self.connections.lock().unwrap();
            if connections.remove(&ctx.id).is_none() {
                return;
            }
            if ctx.is_incoming {
                self.incoming_count.fetch_sub(1, Ordering::SeqCst);
            } else {
                self.outgoing_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.commands.on_connection_close(&ctx);
    }

    fn find(&self, id: &Uuid) -> Option<Arc<LevinHandler>> {
        let connections = self.connections.lock().unwrap();
        connections.get(id).and_then(Weak::upgrade)
    }

    /// Queue an already-framed message on a connection
    pub fn send(&self, message: ByteSlice, id: &Uuid) -> bool {
        match self.find(id) {
            Some(handler) => handler.send(message),
            None => false,
        }
    }

    /// Invoke on a connection by id; the callback fires exactly once
    pub fn invoke_async(
        &self,
        id: &Uuid,
        command: u32,
        message: MessageWriter,
        timeout: Option<Duration>,
        callback: InvokeCallback,
    ) -> Result<(), InvokeError> {
        let Some(handler) = self.find(id) else {
            callback(Err(InvokeError::NotFound), &ConnectionContext::unknown(*id));
            return Err(InvokeError::NotFound);
        };
        handler.async_invoke(command, message, timeout, callback);
        Ok(())
    }

    /// Convenience wrapper: await the response instead of a callback
    pub async fn invoke(
        &self,
        id: &Uuid,
        command: u32,
        message: MessageWriter,
        timeout: Option<Duration>,
    ) -> Result<(i32, Vec<u8>), InvokeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: InvokeCallback = Box::new(move |result, _ctx| {
            let _ = tx.send(result.map(|(code, payload)| (code, payload.to_vec())));
        });
        let _ = self.invoke_async(id, command, message, timeout, callback);
        rx.await.map_err(|_| InvokeError::Destroyed)?
    }

    /// Close a connection by id
    pub fn close(&self, id: &Uuid) -> bool {
        match self.find(id) {
            Some(handler) => {
                handler.close();
                true
            }
            None => false,
        }
    }

    /// Replace the stored context of a live connection
    pub fn update_context(&self, ctx: ConnectionContext) -> bool {
        match self.find(&ctx.id) {
            Some(handler) => {
                handler.update_context(ctx);
                true
            }
            None => false,
        }
    }

    /// Schedule the deferred commands callback on a connection
    pub fn request_callback(&self, id: &Uuid) -> bool {
        match self.find(id) {
            Some(handler) => {
                handler.request_callback();
                true
            }
            None => false,
        }
    }

    /// Visit a snapshot of all live connections. The visitor returning
    /// false stops the walk. Runs outside the registry lock.
    pub fn foreach_connection(&self, mut visitor: impl FnMut(&ConnectionContext) -> bool) -> bool {
        let handlers: Vec<Arc<LevinHandler>> = {
            let connections = self.connections.lock().unwrap();
            connections.values().filter_map(Weak::upgrade).collect()
        };
        for handler in handlers {
            if !visitor(&handler.context_snapshot()) {
                return false;
            }
        }
        true
    }

    /// Visit one connection by id
    pub fn for_connection(
        &self,
        id: &Uuid,
        visitor: impl FnOnce(&ConnectionContext) -> bool,
    ) -> bool {
        match self.find(id) {
            Some(handler) => visitor(&handler.context_snapshot()),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming_count.load(Ordering::SeqCst)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing_count.load(Ordering::SeqCst)
    }

    /// Close up to `count` random connections of the given direction
    pub fn delete_connections(&self, count: usize, incoming: bool) {
        let mut victims: Vec<Arc<LevinHandler>> = {
            let connections = self.connections.lock().unwrap();
            connections
                .values()
                .filter_map(Weak::upgrade)
                .filter(|h| h.context_snapshot().is_incoming == incoming)
                .collect()
        };
        victims.shuffle(&mut rand::thread_rng());
        for handler in victims.into_iter().take(count) {
            debug!("closing random {} connection", if incoming { "incoming" } else { "outgoing" });
            handler.close();
        }
    }

    pub fn delete_out_connections(&self, count: usize) {
        self.delete_connections(count, false);
    }

    pub fn delete_in_connections(&self, count: usize) {
        self.delete_connections(count, true);
    }
}
