use async_trait::async_trait;

use crate::protocol::protocol_data::ProtocolData;

/// Business-side consumer of non-control frames. Listeners are invoked in registration
///  order over a snapshot of the listener list; an error from one listener aborts the
///  dispatch of that frame but never escapes the dispatcher.
#[async_trait]
pub trait ProtocolDataListener: Send + Sync + 'static {
    async fn on_data(&self, data: &ProtocolData) -> anyhow::Result<()>;
}
