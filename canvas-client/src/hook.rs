//! Reconnect hooks.

use async_trait::async_trait;
use canvas_sync::{ReconnectHook, RemoteError, SyncError, SyncResult};
use tokio::sync::mpsc;

/// Forwards each scheduled attempt to whoever owns the transport.
///
/// The owner reconnects however it likes and reports the outcome back to the
/// monitor with a transport signal.
#[derive(Debug, Clone)]
pub struct ForwardingHook {
    tx: mpsc::UnboundedSender<u32>,
}

impl ForwardingHook {
    /// Create a hook and the receiver that sees attempt numbers.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReconnectHook for ForwardingHook {
    async fn reconnect(&self, attempt: u32) -> SyncResult<()> {
        self.tx.send(attempt).map_err(|_| {
            SyncError::Remote(RemoteError::Network("transport owner is gone".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_attempts() {
        let (hook, mut rx) = ForwardingHook::channel();
        hook.reconnect(1).await.expect("delivered");
        hook.reconnect(2).await.expect("delivered");
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        drop(rx);
        assert!(hook.reconnect(3).await.is_err());
    }
}
