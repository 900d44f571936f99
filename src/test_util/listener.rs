use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;

use crate::protocol::events::{ProtocolEvent, ProtocolEventListener};
use crate::protocol::listener::ProtocolDataListener;
use crate::protocol::protocol_data::ProtocolData;

/// records every business frame it is handed
pub struct CollectingDataListener {
    received: Mutex<Vec<ProtocolData>>,
}

impl CollectingDataListener {
    pub fn new() -> CollectingDataListener {
        CollectingDataListener {
            received: Default::default(),
        }
    }

    pub fn received(&self) -> Vec<ProtocolData> {
        self.received.lock().unwrap().clone()
    }
}

impl Default for CollectingDataListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDataListener for CollectingDataListener {
    async fn on_data(&self, data: &ProtocolData) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(data.clone());
        Ok(())
    }
}

/// fails every frame, for exercising the receive-error path
pub struct FailingDataListener;

#[async_trait]
impl ProtocolDataListener for FailingDataListener {
    async fn on_data(&self, data: &ProtocolData) -> anyhow::Result<()> {
        bail!("simulated listener failure for channel {}", data.channel());
    }
}

/// records every event published on the bus
pub struct CollectingEventListener {
    events: Mutex<Vec<ProtocolEvent>>,
}

impl CollectingEventListener {
    pub fn new() -> CollectingEventListener {
        CollectingEventListener {
            events: Default::default(),
        }
    }

    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for CollectingEventListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolEventListener for CollectingEventListener {
    async fn on_event(&self, event: ProtocolEvent) {
        self.events.lock().unwrap().push(event);
    }
}
