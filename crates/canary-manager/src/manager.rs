//! The CAN manager
//!
//! Owns every link by name, coordinates their lifecycle and fans received
//! frames out to listeners and broadcast subscribers. Lifecycle operations
//! (add, remove, start, stop) are serialised; sends and dispatch are not.

use std::collections::BTreeMap;
use std::sync::Arc;

use canary_core::{CanLink, Frame, LinkConfig, LinkError};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};
use crate::handle::{LinkHandle, LinkState, PerLinkResult};
use crate::listener::{Listener, ListenerId, ListenerRegistry, ReceivedFrame};

/// Default capacity of the broadcast channel behind `subscribe`
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub struct CanManager {
    links: RwLock<BTreeMap<String, Arc<LinkHandle>>>,
    lifecycle: tokio::sync::Mutex<()>,
    listeners: Arc<ListenerRegistry>,
    events: broadcast::Sender<ReceivedFrame>,
}

impl Default for CanManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CanManager {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Subscribers that fall more than `capacity` frames behind observe a lag
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            links: RwLock::new(BTreeMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            listeners: Arc::new(ListenerRegistry::default()),
            events,
        }
    }

    /// Build a link through the factory and take ownership of it
    pub async fn add_link(&self, name: &str, config: LinkConfig) -> ManagerResult<Arc<LinkHandle>> {
        let link = canary_link::build_shared(config)?;
        self.add_link_instance(name, link).await
    }

    /// Take ownership of an already built, unconfigured link
    pub async fn add_link_instance(
        &self,
        name: &str,
        link: Arc<dyn CanLink>,
    ) -> ManagerResult<Arc<LinkHandle>> {
        let _guard = self.lifecycle.lock().await;

        let mut links = self.links.write();
        if links.contains_key(name) {
            return Err(ManagerError::DuplicateLink(name.to_string()));
        }

        let origin: Arc<str> = Arc::from(name);
        let listeners = self.listeners.clone();
        let events = self.events.clone();
        link.set_callback(Arc::new(move |frame: Frame| {
            let received = ReceivedFrame {
                link: origin.clone(),
                frame,
            };
            listeners.dispatch(&received);
            // No subscribers is not an error
            let _ = events.send(received);
        }));

        let handle = Arc::new(LinkHandle::new(name, link));
        links.insert(name.to_string(), handle.clone());
        info!(link = name, kind = %handle.link().backend_kind(), "Link added");
        Ok(handle)
    }

    /// Stop (if needed) and forget a link
    pub async fn remove_link(&self, name: &str) -> ManagerResult<PerLinkResult> {
        let _guard = self.lifecycle.lock().await;
        let handle = self
            .links
            .write()
            .remove(name)
            .ok_or_else(|| ManagerError::UnknownLink(name.to_string()))?;

        let result = handle.stop().await;
        info!(link = name, "Link removed");
        Ok(result)
    }

    pub fn link_names(&self) -> Vec<String> {
        self.links.read().keys().cloned().collect()
    }

    pub fn link(&self, name: &str) -> Option<Arc<LinkHandle>> {
        self.links.read().get(name).cloned()
    }

    pub fn link_state(&self, name: &str) -> Option<LinkState> {
        self.link(name).map(|handle| handle.state())
    }

    pub fn link_error(&self, name: &str) -> Option<LinkError> {
        self.link(name).and_then(|handle| handle.last_error())
    }

    fn snapshot(&self) -> Vec<Arc<LinkHandle>> {
        self.links.read().values().cloned().collect()
    }

    /// Configure and start every link; one failure never blocks the others
    pub async fn start_all(&self) -> Vec<PerLinkResult> {
        let _guard = self.lifecycle.lock().await;
        let handles = self.snapshot();
        let results = join_all(handles.iter().map(|handle| handle.start())).await;

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            links = results.len(),
            failed,
            "start_all finished"
        );
        results
    }

    /// Stop every link concurrently, collecting every failure
    pub async fn stop_all(&self) -> Vec<PerLinkResult> {
        let _guard = self.lifecycle.lock().await;
        let handles = self.snapshot();
        let results = join_all(handles.iter().map(|handle| handle.stop())).await;

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        let forced = results.iter().filter(|r| r.forced).count();
        info!(links = results.len(), failed, forced, "stop_all finished");
        results
    }

    pub async fn start_link(&self, name: &str) -> ManagerResult<PerLinkResult> {
        let _guard = self.lifecycle.lock().await;
        let handle = self
            .link(name)
            .ok_or_else(|| ManagerError::UnknownLink(name.to_string()))?;
        Ok(handle.start().await)
    }

    pub async fn stop_link(&self, name: &str) -> ManagerResult<PerLinkResult> {
        let _guard = self.lifecycle.lock().await;
        let handle = self
            .link(name)
            .ok_or_else(|| ManagerError::UnknownLink(name.to_string()))?;
        Ok(handle.stop().await)
    }

    /// Send through a running link
    pub async fn try_send(&self, name: &str, frame: Frame) -> ManagerResult<()> {
        let handle = self
            .link(name)
            .ok_or_else(|| ManagerError::UnknownLink(name.to_string()))?;
        if handle.state() != LinkState::Running {
            return Err(ManagerError::LinkNotRunning(name.to_string()));
        }
        handle.link().send(frame).await?;
        debug!(link = name, %frame, "Frame sent");
        Ok(())
    }

    /// [`try_send`](Self::try_send) reduced to success or failure; failures are logged
    pub async fn send(&self, name: &str, frame: Frame) -> bool {
        match self.try_send(name, frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(link = name, %frame, error = %e, "Send failed");
                false
            }
        }
    }

    /// Receive every frame from every link
    ///
    /// The listener runs on the link's delivery worker and must not block.
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReceivedFrame) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.listeners.register(listener);
        debug!(listener = ?id, "Listener registered");
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Channel alternative to listeners
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedFrame> {
        self.events.subscribe()
    }
}
