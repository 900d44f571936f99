use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// One live client connection, created and owned by the transport that accepted it.
///  The connector manager shares channels with the transport as `Arc<dyn Channel>`
///  and is responsible for calling [`Channel::close`] at most once per registration.
///
/// The id must stay stable for the lifetime of the connection and must not be re-used
///  after `close`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> String;

    fn remote_host(&self) -> String;

    /// local port the connection terminates on
    fn port(&self) -> u16;

    /// time of the most recent observed activity
    fn last_active(&self) -> Instant;

    /// stamp activity now
    fn heartbeat(&self);

    async fn write(&self, data: &[u8]) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}
