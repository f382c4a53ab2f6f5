//! Channel protocol of the driver's main port.
//!
//! A connecting node or client first sends one frame carrying its uuid. The
//! driver records it, answers [`IDENTITY_ACK`] and from then on echoes every
//! frame it receives.

use std::sync::atomic::{AtomicUsize, Ordering};

use grid_nio::{
    ChannelContext, ChannelError, GraphError, GraphTag, InterestOps, Protocol, StateGraph,
};

/// Reply to a successful identification.
pub const IDENTITY_ACK: &[u8] = b"ack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    WaitIdentity,
    SendAck,
    WaitFrame,
    SendEcho,
}

impl GraphTag for PeerState {
    const ALL: &'static [Self] = &[
        PeerState::WaitIdentity,
        PeerState::SendAck,
        PeerState::WaitFrame,
        PeerState::SendEcho,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerTransition {
    ToWaitIdentity,
    ToSendAck,
    ToWaitFrame,
    ToSendEcho,
}

impl GraphTag for PeerTransition {
    const ALL: &'static [Self] = &[
        PeerTransition::ToWaitIdentity,
        PeerTransition::ToSendAck,
        PeerTransition::ToWaitFrame,
        PeerTransition::ToSendEcho,
    ];
}

/// Identification followed by echo.
#[derive(Default)]
pub struct PeerProtocol {
    identified: AtomicUsize,
}

impl PeerProtocol {
    /// Channels that completed identification since startup.
    pub fn identified_count(&self) -> usize {
        self.identified.load(Ordering::Relaxed)
    }
}

fn wait_identity(ctx: &mut ChannelContext<PeerProtocol>) -> Result<PeerTransition, ChannelError> {
    if !ctx.read_message()? {
        return Ok(PeerTransition::ToWaitIdentity);
    }
    let payload = ctx.take_message().unwrap_or_default();
    let uuid = String::from_utf8(payload)
        .map_err(|_| ChannelError::Protocol("identity is not valid UTF-8".to_string()))?;
    if uuid.is_empty() {
        return Err(ChannelError::Protocol("empty identity".to_string()));
    }
    tracing::info!("Channel {} identified as {uuid}", ctx.id());
    ctx.set_uuid(uuid)?;
    ctx.send(IDENTITY_ACK.to_vec())?;
    Ok(PeerTransition::ToSendAck)
}

fn send_ack(ctx: &mut ChannelContext<PeerProtocol>) -> Result<PeerTransition, ChannelError> {
    if !ctx.write_message()? {
        return Ok(PeerTransition::ToSendAck);
    }
    ctx.reset_message();
    Ok(PeerTransition::ToWaitFrame)
}

fn wait_frame(ctx: &mut ChannelContext<PeerProtocol>) -> Result<PeerTransition, ChannelError> {
    if !ctx.read_message()? {
        return Ok(PeerTransition::ToWaitFrame);
    }
    let payload = ctx.take_message().unwrap_or_default();
    tracing::trace!("Channel {} echoing {} bytes", ctx.id(), payload.len());
    ctx.send(payload)?;
    Ok(PeerTransition::ToSendEcho)
}

fn send_echo(ctx: &mut ChannelContext<PeerProtocol>) -> Result<PeerTransition, ChannelError> {
    if !ctx.write_message()? {
        return Ok(PeerTransition::ToSendEcho);
    }
    ctx.reset_message();
    Ok(PeerTransition::ToWaitFrame)
}

impl Protocol for PeerProtocol {
    type State = PeerState;
    type Transition = PeerTransition;
    type Attachment = ();

    fn name(&self) -> &str {
        "driver"
    }

    fn build_graph(&self) -> Result<StateGraph<Self>, GraphError> {
        StateGraph::builder()
            .state(PeerState::WaitIdentity, wait_identity)
            .state(PeerState::SendAck, send_ack)
            .state(PeerState::WaitFrame, wait_frame)
            .state(PeerState::SendEcho, send_echo)
            .transition(PeerTransition::ToWaitIdentity, PeerState::WaitIdentity, InterestOps::READ)
            .transition(PeerTransition::ToSendAck, PeerState::SendAck, InterestOps::WRITE)
            .transition(PeerTransition::ToWaitFrame, PeerState::WaitFrame, InterestOps::READ)
            .transition(PeerTransition::ToSendEcho, PeerState::SendEcho, InterestOps::WRITE)
            .build()
    }

    fn initial_state(&self) -> PeerState {
        PeerState::WaitIdentity
    }

    fn initial_interest(&self) -> InterestOps {
        InterestOps::READ
    }

    fn create_attachment(&self) {}

    fn channel_closed(&self, ctx: &ChannelContext<Self>) {
        if ctx.uuid().is_some() {
            self.identified.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            "Channel {} ({}) closed after {} bytes",
            ctx.id(),
            ctx.uuid().unwrap_or("unidentified"),
            ctx.channel_count()
        );
    }
}
