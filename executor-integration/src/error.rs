use thiserror::Error;

/// Generic transport/channel failure shared by the Hub Client, Trade Queue and
/// Notifier Hub plumbing.
#[derive(Debug, Clone, Error)]
pub enum IntegrationError {
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("{0}")]
    Other(String),
}
