//! Small protocols shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::ChannelContext;
use crate::error::ChannelError;
use crate::graph::{GraphError, GraphTag, StateGraph};
use crate::interest::InterestOps;
use crate::protocol::Protocol;

/// Single-state protocol that never moves.
pub(crate) struct Blank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BlankState {
    Only,
}

impl GraphTag for BlankState {
    const ALL: &'static [Self] = &[BlankState::Only];
}

impl Protocol for Blank {
    type State = BlankState;
    type Transition = BlankState;
    type Attachment = ();

    fn name(&self) -> &str {
        "blank"
    }

    fn build_graph(&self) -> Result<StateGraph<Self>, GraphError> {
        StateGraph::builder()
            .state(BlankState::Only, |_: &mut ChannelContext<Self>| Ok(BlankState::Only))
            .transition(BlankState::Only, BlankState::Only, InterestOps::READ)
            .build()
    }

    fn initial_state(&self) -> BlankState {
        BlankState::Only
    }

    fn initial_interest(&self) -> InterestOps {
        InterestOps::READ
    }

    fn create_attachment(&self) {}
}

/// `A -ToB-> B -ToA-> A`, each state only flipping to the other.
///
/// Counts the hook invocations it receives.
#[derive(Default)]
pub(crate) struct Flip {
    pub(crate) exceptions: AtomicUsize,
    pub(crate) closed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FlipState {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FlipTransition {
    ToA,
    ToB,
}

impl GraphTag for FlipState {
    const ALL: &'static [Self] = &[FlipState::A, FlipState::B];
}

impl GraphTag for FlipTransition {
    const ALL: &'static [Self] = &[FlipTransition::ToA, FlipTransition::ToB];
}

impl Flip {
    pub(crate) fn graph() -> Result<StateGraph<Self>, GraphError> {
        StateGraph::builder()
            .state(FlipState::A, |ctx: &mut ChannelContext<Self>| {
                ctx.attachment += 1;
                Ok(FlipTransition::ToB)
            })
            .state(FlipState::B, |ctx: &mut ChannelContext<Self>| {
                ctx.attachment += 1;
                Ok(FlipTransition::ToA)
            })
            .transition(FlipTransition::ToB, FlipState::B, InterestOps::WRITE)
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .build()
    }
}

impl Protocol for Flip {
    type State = FlipState;
    type Transition = FlipTransition;
    /// Number of states performed.
    type Attachment = u32;

    fn name(&self) -> &str {
        "flip"
    }

    fn build_graph(&self) -> Result<StateGraph<Self>, GraphError> {
        Flip::graph()
    }

    fn initial_state(&self) -> FlipState {
        FlipState::A
    }

    fn initial_interest(&self) -> InterestOps {
        InterestOps::NONE
    }

    fn create_attachment(&self) -> u32 {
        0
    }

    fn handle_exception(&self, _ctx: &mut ChannelContext<Self>, _error: &ChannelError) {
        self.exceptions.fetch_add(1, Ordering::SeqCst);
    }

    fn channel_closed(&self, _ctx: &ChannelContext<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
