use async_trait::async_trait;

use crate::error::Error;
use crate::models::ids::ChannelId;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait PlatformIntegration {
    async fn connect(&mut self) -> Result<(), Error>;
    async fn disconnect(&mut self) -> Result<(), Error>;
    async fn get_connection_status(&self) -> Result<ConnectionStatus, Error>;
}

/// Where command results are reported back to.
#[async_trait]
pub trait CommandReply: Send + Sync {
    async fn reply(&self, channel_id: ChannelId, text: &str) -> Result<(), Error>;
}
