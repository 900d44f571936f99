use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::protocol::channel::Channel;

/// In-memory [`Channel`] that records every write and close, for asserting on the
///  manager's externally visible behavior. `heartbeat` stamps the (possibly paused)
///  tokio clock, so liveness tests can drive it with virtual time.
pub struct RecordingChannel {
    id: String,
    remote_host: String,
    port: u16,
    last_active: Mutex<Instant>,
    writes: Mutex<Vec<Vec<u8>>>,
    close_count: AtomicU32,
    fail_writes: AtomicBool,
}

impl RecordingChannel {
    pub fn new(id: &str) -> RecordingChannel {
        RecordingChannel {
            id: id.to_string(),
            remote_host: "127.0.0.1".to_string(),
            port: 9876,
            last_active: Mutex::new(Instant::now()),
            writes: Default::default(),
            close_count: AtomicU32::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    /// make all subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_host(&self) -> String {
        self.remote_host.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    fn heartbeat(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated write failure on channel {}", self.id);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
