//! The extension point of the reactor.

use crate::context::ChannelContext;
use crate::error::ChannelError;
use crate::graph::{GraphError, GraphTag, StateGraph};
use crate::interest::InterestOps;
use crate::transport::CipherEngine;

/// One kind of channel server: its graph, its context factory and its hooks.
///
/// A reactor is generic over its protocol; everything protocol-specific
/// (class loading, job dispatch, client submission) lives behind this trait.
pub trait Protocol: Sized + Send + Sync + 'static {
    /// State tags.
    type State: GraphTag;
    /// Transition tags.
    type Transition: GraphTag;
    /// Per-channel protocol data.
    type Attachment: Send + 'static;

    /// Short name used for thread names and logs.
    fn name(&self) -> &str;

    /// Build the protocol's graph. Called once, when the reactor is created.
    fn build_graph(&self) -> Result<StateGraph<Self>, GraphError>;

    /// State of a freshly accepted channel.
    fn initial_state(&self) -> Self::State;

    /// Interest of a freshly accepted channel.
    fn initial_interest(&self) -> InterestOps;

    /// Create the attachment of a new channel.
    fn create_attachment(&self) -> Self::Attachment;

    /// Engine for secure channels; `None` frames on the raw socket.
    fn cipher_engine(&self) -> Option<Box<dyn CipherEngine>> {
        None
    }

    /// Runs on the reactor thread right after a channel is accepted, before its
    /// socket is first registered with the selector. The interest registered is
    /// the one in effect when this returns; returning a transition applies it
    /// first, e.g. to move into a state writing a greeting queued with
    /// [`ChannelContext::send`]. An error closes the channel.
    fn post_accept(
        &self,
        _ctx: &mut ChannelContext<Self>,
    ) -> Result<Option<Self::Transition>, ChannelError> {
        Ok(None)
    }

    /// Called when a state failed. The channel is closed afterwards.
    fn handle_exception(&self, ctx: &mut ChannelContext<Self>, error: &ChannelError) {
        if error.is_disconnect() {
            tracing::debug!(
                "{}: channel {} disconnected in state {:?}",
                self.name(),
                ctx.id(),
                ctx.state()
            );
        } else {
            tracing::warn!(
                "{}: channel {} failed in state {:?}: {error}",
                self.name(),
                ctx.id(),
                ctx.state()
            );
        }
    }

    /// Called once for every channel after its socket was closed, whatever
    /// the reason. Releases protocol resources held for the channel.
    fn channel_closed(&self, _ctx: &ChannelContext<Self>) {}

    /// Runs on the reactor thread after every readiness wait.
    fn post_select(&self) {}

    /// Polled by the reactor loop; `true` makes the loop exit.
    fn external_stop_condition(&self) -> bool {
        false
    }
}
