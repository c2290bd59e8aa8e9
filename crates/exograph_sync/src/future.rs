//! Future adapters for the callback API.
//!
//! Each adapter forwards the callback result through a
//! `tokio::sync::oneshot` channel. If the callback is dropped without
//! being called, the future resolves to [`SyncError::Cancelled`].

use crate::error::{SyncError, SyncResult};
use crate::server_sync::ServerSync;
use exograph_model::{Entity, Value};
use exograph_protocol::{ChangeRecord, Query, ServerResult};
use tokio::sync::oneshot;

fn channel<T: Send + 'static>() -> (impl FnOnce(SyncResult<T>) + Send + 'static, oneshot::Receiver<SyncResult<T>>) {
    let (tx, rx) = oneshot::channel();
    let send = move |result| {
        // The receiver may have been dropped.
        let _ = tx.send(result);
    };
    (send, rx)
}

async fn received<T>(rx: oneshot::Receiver<SyncResult<T>>) -> SyncResult<T> {
    rx.await.unwrap_or(Err(SyncError::Cancelled))
}

impl ServerSync {
    /// Saves pending changes, see [`save`](Self::save).
    pub async fn save_async(&self, root: &Entity) -> SyncResult<ServerResult> {
        let (done, rx) = channel();
        self.save(root, done);
        received(rx).await
    }

    /// Runs a roundtrip, see [`roundtrip`](Self::roundtrip).
    pub async fn roundtrip_async(&self) -> SyncResult<ServerResult> {
        let (done, rx) = channel();
        self.roundtrip(done);
        received(rx).await
    }

    /// Raises a server event, see [`raise_server_event`](Self::raise_server_event).
    pub async fn raise_server_event_async(
        &self,
        name: &str,
        target: &Entity,
        args: Vec<(String, Value)>,
        include_all: bool,
        paths: Vec<String>,
    ) -> SyncResult<ServerResult> {
        let (done, rx) = channel();
        self.raise_server_event(name, target, args, include_all, paths, done);
        received(rx).await
    }

    /// Applies server changes, see [`apply_changes`](Self::apply_changes).
    pub async fn apply_changes_async(
        &self,
        changes: Vec<ChangeRecord>,
        source: Option<&str>,
    ) -> SyncResult<()> {
        let (done, rx) = channel();
        self.apply_changes(changes, source, done);
        received(rx).await
    }

    /// Loads the initial context, see [`load_context`](Self::load_context).
    pub async fn load_context_async(&self, queries: Vec<Query>) -> SyncResult<ServerResult> {
        let (done, rx) = channel();
        self.load_context(queries, done);
        received(rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::{MockTransport, Operation};
    use exograph_model::{EntityType, Model, PropertyMeta, ValueType};
    use exograph_protocol::IdChange;
    use std::sync::Arc;

    fn sync(transport: Arc<MockTransport>) -> ServerSync {
        let model = Arc::new(Model::new());
        model
            .define_type(
                EntityType::builder("Driver")
                    .property(PropertyMeta::value("Name", ValueType::String))
                    .build(),
            )
            .unwrap();
        ServerSync::new(model, transport, SyncConfig::default())
    }

    #[tokio::test]
    async fn save_resolves_after_remap() {
        let transport = Arc::new(MockTransport::new());
        let sync = sync(transport.clone());
        let driver = sync.model().create("Driver").unwrap();
        transport.respond(
            Operation::Save,
            Ok(ServerResult::new().with_changes(vec![ChangeRecord::save(vec![IdChange::new(
                "Driver",
                driver.id(),
                "42",
            )])])),
        );
        sync.save_async(&driver).await.unwrap();
        assert_eq!(driver.id(), "42");
        assert!(!driver.is_new());
    }

    #[tokio::test]
    async fn deferred_delivery_resolves_later() {
        let transport = Arc::new(MockTransport::deferred());
        let sync = sync(transport.clone());
        let pending = tokio::spawn({
            let sync = sync.clone();
            async move { sync.roundtrip_async().await }
        });
        while transport.held_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(sync.is_busy());
        transport.deliver_all();
        assert!(pending.await.unwrap().is_ok());
        assert!(!sync.is_busy());
    }

    #[tokio::test]
    async fn empty_batches_complete_immediately() {
        let sync = sync(Arc::new(MockTransport::new()));
        sync.apply_changes_async(Vec::new(), None).await.unwrap();
    }
}
