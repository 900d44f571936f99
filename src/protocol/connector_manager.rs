use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EffectiveConfig, ManagerConfig};
use crate::protocol::channel::Channel;
use crate::protocol::datagram::{self, Datagram};
use crate::protocol::events::{CloseCause, EventBus, InProcessEventBus, ProtocolEvent, ProtocolEventListener};
use crate::protocol::listener::ProtocolDataListener;
use crate::protocol::protocol_data::ProtocolData;

/// a datagram is dropped from the retry queue after this many re-sends without an ACK
const MAX_RETRY_ATTEMPTS: u32 = 30;
/// pause between retry passes
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

struct RetryData {
    data: ProtocolData,
    attempts: u32,
}

struct DispatchJob {
    data: Bytes,
    channel_id: String,
}

/// The state shared between the manager facade and its background tasks. The
///  `destroyed` flag is the only cross-task signal: it starts out true, `start` clears
///  it and `shutdown` sets it again.
struct Shared {
    config: EffectiveConfig,
    bus: Arc<dyn EventBus>,
    channels: RwLock<FxHashMap<String, Arc<dyn Channel>>>,
    retry_queue: RwLock<FxHashMap<Bytes, RetryData>>,
    data_listeners: RwLock<Vec<Arc<dyn ProtocolDataListener>>>,
    dispatch_tx: RwLock<Option<mpsc::UnboundedSender<DispatchJob>>>,
    destroyed: AtomicBool,
}

struct Lifecycle {
    retry_pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// The connector tier's per-process core: owns the live channel set, answers peer
///  heartbeats, consumes peer ACKs, re-sends unacknowledged datagrams, evicts silent
///  channels, and fans business frames out to registered listeners.
///
/// All operations are safe to call concurrently from transport callbacks, business
///  code, and lifecycle management; none of them surfaces an error - failures are
///  logged and observable on the event bus.
pub struct ConnectorManager {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl ConnectorManager {
    /// `bus` is the observability sink; pass `None` to use the in-process default.
    pub fn new(config: &ManagerConfig, bus: Option<Arc<dyn EventBus>>) -> ConnectorManager {
        let bus: Arc<dyn EventBus> = match bus {
            Some(bus) => bus,
            None => {
                info!("no event bus provided, using the in-process default");
                Arc::new(InProcessEventBus::new())
            }
        };

        ConnectorManager {
            shared: Arc::new(Shared {
                config: config.effective(),
                bus,
                channels: Default::default(),
                retry_queue: Default::default(),
                data_listeners: Default::default(),
                dispatch_tx: RwLock::new(None),
                destroyed: AtomicBool::new(true),
            }),
            lifecycle: Mutex::new(Lifecycle {
                retry_pump: None,
                sweeper: None,
                workers: Vec::new(),
            }),
        }
    }

    /// Spawns the dispatcher workers, the liveness sweeper and the retry pump.
    ///  Warns and does nothing if the manager is already running.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        info!("starting connector manager, heartbeat threshold is {}s", self.shared.config.heartbeat_secs);
        if !self.shared.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is already running, ignoring start");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.dispatch_tx.write().await = Some(tx);
        let rx = Arc::new(Mutex::new(rx));
        lifecycle.workers = (0..self.shared.config.receive_workers)
            .map(|_| {
                let shared = self.shared.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => shared.handle_frame(job.data, &job.channel_id).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        let sweeper_cancel = CancellationToken::new();
        {
            let shared = self.shared.clone();
            let cancel = sweeper_cancel.clone();
            lifecycle.sweeper = Some(tokio::spawn(async move { shared.run_sweeper(cancel).await }));
        }

        self.shared.destroyed.store(false, Ordering::SeqCst);

        {
            let shared = self.shared.clone();
            lifecycle.retry_pump = Some(tokio::spawn(async move { shared.run_retry_pump(sweeper_cancel).await }));
        }

        info!("connector manager started");
    }

    /// Initiates teardown: the dispatcher queue is closed so the workers drain their
    ///  in-flight jobs and exit, the retry pump keeps running until the retry queue is
    ///  empty (bounded by the attempt cap) and then stops the sweeper, which clears
    ///  the registry and the listener list. Returns without waiting for any of that.
    ///
    ///  Warns and does nothing if the manager is already shut down.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        info!("shutting down connector manager");
        if self.shared.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is already shut down, ignoring");
            return;
        }

        *self.shared.dispatch_tx.write().await = None;
        self.shared.destroyed.store(true, Ordering::SeqCst);

        info!("connector manager shutting down, waiting for the retry queue to drain");
    }

    /// Waits for the background tasks of the current (start, shutdown) cycle to exit.
    ///  Intended for orderly process teardown after [`ConnectorManager::shutdown`];
    ///  returns immediately if nothing was started.
    pub async fn await_terminated(&self) {
        let (retry_pump, sweeper, workers) = {
            let mut lifecycle = self.lifecycle.lock().await;
            (lifecycle.retry_pump.take(), lifecycle.sweeper.take(), std::mem::take(&mut lifecycle.workers))
        };

        for worker in workers {
            if let Err(e) = worker.await {
                error!("dispatcher worker task failed: {}", e);
            }
        }
        if let Some(retry_pump) = retry_pump {
            if let Err(e) = retry_pump.await {
                error!("retry pump task failed: {}", e);
            }
        }
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                error!("liveness sweeper task failed: {}", e);
            }
        }
    }

    /// Installs a channel under its id. A registration for an id that is already taken
    ///  by a *different* connection replaces it: the old channel is closed with cause
    ///  [`CloseCause::System`]. Re-registering the same connection is a no-op.
    pub async fn register_channel(&self, channel: Arc<dyn Channel>) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is not running, dropping registration of channel {}", channel.id());
            return;
        }

        let id = channel.id();
        debug!("registering channel {}", id);

        let replaced = {
            let mut channels = self.shared.channels.write().await;
            match channels.get(&id) {
                Some(existing) if Arc::ptr_eq(existing, &channel) => {
                    warn!("channel {} is already registered, ignoring", id);
                    return;
                }
                Some(_) => {
                    warn!("channel id {} is taken by a different connection, replacing it", id);
                    channels.insert(id.clone(), channel)
                }
                None => {
                    channels.insert(id.clone(), channel);
                    None
                }
            }
        };

        match replaced {
            Some(old) => {
                if let Err(e) = old.close().await {
                    error!("error closing replaced channel {}: {}", id, e);
                }
                self.shared.bus.publish(ProtocolEvent::ChannelClosed { channel: id, cause: CloseCause::System }).await;
            }
            None => {
                self.shared.bus.publish(ProtocolEvent::ChannelRegistered { channel: id }).await;
            }
        }
    }

    /// Entry point for the transport, called once per inbound frame. Publishes the raw
    ///  receive event and hands the frame to the dispatcher; classification and
    ///  listener fan-out happen on a dispatcher worker.
    pub async fn receive(&self, data: Bytes, channel_id: &str) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is not running, dropping frame from channel {}", channel_id);
            return;
        }

        debug!("received frame from channel {}", channel_id);
        self.shared.bus.publish(ProtocolEvent::Received { channel: channel_id.to_string(), data: data.clone() }).await;

        let tx = self.shared.dispatch_tx.read().await;
        match tx.as_ref() {
            Some(tx) => {
                let job = DispatchJob { data, channel_id: channel_id.to_string() };
                if tx.send(job).is_err() {
                    warn!("dispatcher is gone, dropping frame from channel {}", channel_id);
                }
            }
            None => warn!("dispatcher is not running, dropping frame from channel {}", channel_id),
        }
    }

    /// Writes a datagram to its addressed channel. The write itself is best effort
    ///  and happens regardless of reliability; if the datagram requests an ACK it is
    ///  additionally queued for re-sending until the peer acknowledges it or the
    ///  attempt cap is reached.
    pub async fn write(&self, data: ProtocolData) {
        self.shared.write(data).await
    }

    /// Removes the channel from the registry, closes it and publishes the close event.
    ///  The registry removal decides the winner when calls race, so a channel is
    ///  closed at most once.
    pub async fn close(&self, channel_id: &str, cause: CloseCause) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is not running, ignoring close of channel {}", channel_id);
            return;
        }
        if channel_id.is_empty() {
            warn!("cannot close a channel with an empty id");
            return;
        }

        self.shared.close_channel(channel_id, cause).await
    }

    /// business listeners are called for every non-control frame, in registration order
    pub async fn register_data_listener(&self, listener: Arc<dyn ProtocolDataListener>) {
        self.shared.data_listeners.write().await.push(listener);
    }

    // The full event bus surface is re-exposed so that transports and protocol
    //  extensions can report through the manager without holding the bus itself.

    pub async fn notify_registered(&self, channel_id: &str) {
        self.shared.bus.publish(ProtocolEvent::ChannelRegistered { channel: channel_id.to_string() }).await;
    }

    pub async fn notify_received(&self, channel_id: &str, data: &[u8]) {
        self.shared.bus.publish(ProtocolEvent::Received { channel: channel_id.to_string(), data: Bytes::copy_from_slice(data) }).await;
    }

    pub async fn receive_success(&self, channel_id: &str, data: &[u8]) {
        self.shared.bus.publish(ProtocolEvent::ReceiveSuccess { channel: channel_id.to_string(), data: Bytes::copy_from_slice(data) }).await;
    }

    pub async fn receive_error(&self, channel_id: &str, data: &[u8], error: &str) {
        self.shared.bus.publish(ProtocolEvent::ReceiveError { channel: channel_id.to_string(), data: Bytes::copy_from_slice(data), error: error.to_string() }).await;
    }

    pub async fn send(&self, channel_id: &str, data: &[u8]) {
        self.shared.bus.publish(ProtocolEvent::Sent { channel: channel_id.to_string(), data: Bytes::copy_from_slice(data) }).await;
    }

    pub async fn discard(&self, channel_id: &str, data: &[u8]) {
        self.shared.bus.publish(ProtocolEvent::Discarded { channel: channel_id.to_string(), data: Bytes::copy_from_slice(data) }).await;
    }

    pub async fn publish_custom(&self, name: &str, data: &[u8]) {
        self.shared.bus.publish(ProtocolEvent::Custom { name: name.to_string(), data: Bytes::copy_from_slice(data) }).await;
    }
}

#[async_trait::async_trait]
impl EventBus for ConnectorManager {
    async fn publish(&self, event: ProtocolEvent) {
        self.shared.bus.publish(event).await
    }

    async fn add_listener(&self, listener: Arc<dyn ProtocolEventListener>) -> Uuid {
        self.shared.bus.add_listener(listener).await
    }

    async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        self.shared.bus.try_remove_listener(listener_id).await
    }
}

impl Shared {
    /// Per-frame work, run on a dispatcher worker: stamp liveness, classify by the
    ///  type byte, and reply / consume / fan out accordingly.
    async fn handle_frame(&self, data: Bytes, channel_id: &str) {
        let channel = self.channels.read().await.get(channel_id).cloned();
        let Some(channel) = channel else {
            error!("received data from channel {} but no such channel is registered, dropping the frame", channel_id);
            return;
        };

        // any inbound frame counts as liveness
        channel.heartbeat();

        let Some(&typ) = data.get(datagram::TYPE_INDEX) else {
            warn!("frame from channel {} is too short to carry a type, dropping", channel_id);
            return;
        };

        let protocol_data = ProtocolData::new(data, channel.port(), &channel.remote_host(), channel_id);

        match typ {
            datagram::TYPE_HEARTBEAT => {
                debug!("frame from channel {} is a heartbeat, echoing one back", channel_id);
                self.write(datagram::build_heartbeat(channel.port(), &channel.remote_host(), channel_id)).await;
            }
            datagram::TYPE_ACK => self.on_ack(&protocol_data).await,
            _ => self.dispatch_to_listeners(protocol_data).await,
        }
    }

    async fn on_ack(&self, data: &ProtocolData) {
        let datagram = match Datagram::decode(data.data()) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("undecodable ACK frame from channel {}, ignoring: {}", data.channel(), e);
                return;
            }
        };

        debug!("peer acknowledged datagram {:?}", datagram.id);
        if self.retry_queue.write().await.remove(&datagram.id).is_none() {
            debug!("no pending entry for acknowledged datagram {:?}", datagram.id);
        }
    }

    async fn dispatch_to_listeners(&self, data: ProtocolData) {
        let listeners = self.data_listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_data(&data).await {
                error!("listener failed handling frame from channel {}: {}", data.channel(), e);
                self.bus.publish(ProtocolEvent::ReceiveError {
                    channel: data.channel().to_string(),
                    data: data.data().clone(),
                    error: e.to_string(),
                }).await;
                return;
            }
        }

        self.bus.publish(ProtocolEvent::ReceiveSuccess {
            channel: data.channel().to_string(),
            data: data.data().clone(),
        }).await;
    }

    async fn write(&self, data: ProtocolData) {
        debug!("writing {:?}", data);

        let datagram = match Datagram::decode(data.data()) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("outbound frame for channel {} is not a valid datagram, dropping: {}", data.channel(), e);
                return;
            }
        };

        // sent immediately whether or not an ACK is requested
        let channel = self.channels.read().await.get(data.channel()).cloned();
        let Some(channel) = channel else {
            warn!("cannot write to channel {}, it is not registered", data.channel());
            return;
        };
        if let Err(e) = channel.write(data.data()).await {
            error!("error writing to channel {}: {}", data.channel(), e);
        }

        if datagram.ack {
            self.add_to_retry_queue(data, datagram.id).await;
        }
    }

    /// NB: once `destroyed` is set the enqueue is skipped, but the immediate write in
    ///  [`Shared::write`] has already happened - a reliable message written during
    ///  shutdown is delivered at most once, without retries.
    async fn add_to_retry_queue(&self, data: ProtocolData, id: Bytes) {
        if self.destroyed.load(Ordering::SeqCst) {
            warn!("connector manager is shut down, discarding reliable datagram {:?} for channel {}", id, data.channel());
            return;
        }

        debug!("datagram {:?} requests an ACK, queueing it for re-sending", id);
        self.retry_queue.write().await
            .insert(id, RetryData { data, attempts: 0 });
    }

    async fn close_channel(&self, channel_id: &str, cause: CloseCause) {
        debug!("closing channel {}, cause {:?}", channel_id, cause);

        let channel = self.channels.write().await.remove(channel_id);
        let Some(channel) = channel else {
            warn!("channel {} is not registered, nothing to close", channel_id);
            return;
        };

        if let Err(e) = channel.close().await {
            error!("error closing channel {}: {}", channel_id, e);
        }
        self.bus.publish(ProtocolEvent::ChannelClosed { channel: channel_id.to_string(), cause }).await;
    }

    /// Re-sends everything in the retry queue every [`RETRY_INTERVAL`] until shutdown
    ///  *and* an empty queue coincide - after shutdown the queue drains within at most
    ///  `MAX_RETRY_ATTEMPTS * RETRY_INTERVAL` because every pass either re-sends or
    ///  evicts each entry. Once the loop exits it stops the liveness sweeper.
    async fn run_retry_pump(&self, sweeper_cancel: CancellationToken) {
        loop {
            let queue_size = self.retry_queue.read().await.len();
            if self.destroyed.load(Ordering::SeqCst) && queue_size == 0 {
                break;
            }

            if queue_size > 0 {
                debug!("re-sending {} datagrams awaiting an ACK", queue_size);
                self.retry_pass().await;
            }
            sleep(RETRY_INTERVAL).await;
        }

        info!("retry pump finished, stopping the liveness sweeper");
        sweeper_cancel.cancel();
    }

    async fn retry_pass(&self) {
        let ids = self.retry_queue.read().await.keys().cloned().collect::<Vec<_>>();

        for id in ids {
            // every entry is re-checked under the lock so that a concurrent ACK or
            //  channel close wins over the re-send
            let entry = {
                let queue = self.retry_queue.read().await;
                queue.get(&id).map(|e| (e.data.clone(), e.attempts))
            };
            let Some((payload, attempts)) = entry else {
                continue;
            };

            if attempts >= MAX_RETRY_ATTEMPTS {
                debug!("datagram {:?} was re-sent {} times without an ACK, giving up", id, attempts);
                self.retry_queue.write().await.remove(&id);
                continue;
            }

            let channel = self.channels.read().await.get(payload.channel()).cloned();
            let Some(channel) = channel else {
                debug!("channel {} is gone, dropping pending datagram {:?}", payload.channel(), id);
                self.retry_queue.write().await.remove(&id);
                continue;
            };

            // count the attempt before the write so a failing channel cannot keep an
            //  entry alive forever
            {
                let mut queue = self.retry_queue.write().await;
                match queue.get_mut(&id) {
                    Some(entry) => entry.attempts += 1,
                    None => continue,
                }
            }

            if let Err(e) = channel.write(payload.data()).await {
                error!("re-sending datagram {:?} to channel {} failed, keeping it for the next pass: {}", id, payload.channel(), e);
            }
        }
    }

    /// Closes channels whose inactivity exceeds the heartbeat threshold, scanning
    ///  every fifth of the threshold - an expired channel is evicted at most one sweep
    ///  period after the threshold passes.
    async fn run_sweeper(&self, cancel: CancellationToken) {
        loop {
            self.sweep_pass().await;

            select! {
                _ = cancel.cancelled() => {
                    if self.destroyed.load(Ordering::SeqCst) {
                        debug!("shutdown in progress, liveness sweeper clearing the registry");
                        self.channels.write().await.clear();
                        self.data_listeners.write().await.clear();
                        break;
                    }
                    // the stop signal is only ever sent by the retry pump on its way
                    //  out, so a cancellation without shutdown is a bug somewhere
                    error!("liveness sweeper was cancelled without a shutdown, ignoring");
                    sleep(self.config.sweep_interval).await;
                }
                _ = sleep(self.config.sweep_interval) => {}
            }
        }

        info!("liveness sweeper finished");
    }

    async fn sweep_pass(&self) {
        debug!("scanning for channels with an expired heartbeat");
        let now = Instant::now();

        let snapshot = self.channels.read().await.iter()
            .map(|(id, channel)| (id.clone(), channel.clone()))
            .collect::<Vec<_>>();

        for (id, channel) in snapshot {
            let idle_secs = now.saturating_duration_since(channel.last_active()).as_secs();
            if idle_secs > self.config.heartbeat_secs {
                info!("channel {} missed its heartbeat ({}s idle), closing it", id, idle_secs);
                self.close_channel(&id, CloseCause::Timeout).await;
            }
        }
    }
}
