use std::fmt::{Debug, Formatter};

use bytes::Bytes;

/// One framed message together with its addressing: the raw datagram bytes, the local
///  port and remote host of the connection they belong to, and the channel id. Created
///  for each inbound frame and for each outbound write, immutable thereafter.
#[derive(Clone, Eq, PartialEq)]
pub struct ProtocolData {
    data: Bytes,
    port: u16,
    remote_host: String,
    channel: String,
}

impl Debug for ProtocolData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProtocolData{{channel:{}, remote:{}:{}, {} bytes}}", self.channel, self.remote_host, self.port, self.data.len())
    }
}

impl ProtocolData {
    pub fn new(data: Bytes, port: u16, remote_host: &str, channel: &str) -> ProtocolData {
        ProtocolData {
            data,
            port,
            remote_host: remote_host.to_string(),
            channel: channel.to_string(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
