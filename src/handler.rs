use crate::error::ErrorKind;
use crate::payload::GatewayEvent;
use crate::shard::ShardState;
use std::future::Future;

/// Receives everything the shards report upward.
///
/// Methods are called from the shard's own task, so a slow handler delays
/// that shard only. Panics are caught and logged.
///
/// # Example
///
/// ```ignore
/// struct Bot;
///
/// impl EventHandler for Bot {
///     async fn on_event(&self, shard_id: u32, event: GatewayEvent) {
///         if event.name == "MESSAGE_CREATE" {
///             println!("shard {}: {}", shard_id, event.data["content"]);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync + 'static {
    /// A dispatch (op 0) received by `shard_id`, READY and RESUMED included
    fn on_event(&self, shard_id: u32, event: GatewayEvent) -> impl Future<Output = ()> + Send;

    /// A shard changed lifecycle state
    fn on_state_change(
        &self,
        _shard_id: u32,
        _from: ShardState,
        _to: ShardState,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A shard hit an error. Fatal errors are followed by a transition to Closed.
    fn on_error(
        &self,
        _shard_id: u32,
        _kind: ErrorKind,
        _message: &str,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    async fn on_event(&self, _shard_id: u32, _event: GatewayEvent) {}
}
