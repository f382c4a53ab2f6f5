//! Declarative state/transition graphs.
//!
//! A protocol is described by two enums: the states a channel can be in and
//! the transitions a state can request. The graph maps every state tag to the
//! [`ChannelState`] implementing it, and every transition tag to the
//! [`Transition`] it stands for. The same reactor serves structurally
//! different protocols by swapping the graph.

use std::fmt::{self, Debug};
use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::context::ChannelContext;
use crate::error::ChannelError;
use crate::interest::InterestOps;
use crate::protocol::Protocol;

/// A closed enumeration usable as a state or transition tag.
///
/// `ALL` must list every variant; [`GraphBuilder::build`] uses it to prove the
/// graph exhaustive.
pub trait GraphTag: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Every variant of the enum.
    const ALL: &'static [Self];
}

/// Behavior of a channel in one state.
///
/// Invoked on a worker thread when the channel becomes ready in this state;
/// returns the transition to apply. Must not block: I/O is only attempted
/// after readiness, so it either progresses or reports "not yet".
pub trait ChannelState<P: Protocol>: Send + Sync {
    /// Do the work for this state.
    fn perform(&self, ctx: &mut ChannelContext<P>) -> Result<P::Transition, ChannelError>;
}

impl<P, F> ChannelState<P> for F
where
    P: Protocol,
    F: Fn(&mut ChannelContext<P>) -> Result<P::Transition, ChannelError> + Send + Sync,
{
    fn perform(&self, ctx: &mut ChannelContext<P>) -> Result<P::Transition, ChannelError> {
        self(ctx)
    }
}

/// Target of a transition: the next state and the readiness to wait for there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    /// State the channel moves to.
    pub next_state: S,
    /// Interest registered once the channel is in `next_state`.
    pub interest: InterestOps,
}

/// Errors detected while building a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A state tag has no behavior.
    #[error("no behavior registered for state {0}")]
    MissingState(String),
    /// A transition tag has no target.
    #[error("no target registered for transition {0}")]
    MissingTransition(String),
    /// A state tag was registered twice.
    #[error("state {0} registered twice")]
    DuplicateState(String),
    /// A transition tag was registered twice.
    #[error("transition {0} registered twice")]
    DuplicateTransition(String),
}

/// Immutable graph of one protocol.
pub struct StateGraph<P: Protocol> {
    states: FxHashMap<P::State, Box<dyn ChannelState<P>>>,
    transitions: FxHashMap<P::Transition, Transition<P::State>>,
}

impl<P: Protocol> StateGraph<P> {
    /// Start describing a graph.
    pub fn builder() -> GraphBuilder<P> {
        GraphBuilder {
            states: FxHashMap::default(),
            transitions: FxHashMap::default(),
            duplicate: None,
        }
    }

    /// Behavior of `state`.
    pub fn state(&self, state: P::State) -> &dyn ChannelState<P> {
        // Exhaustive by construction, see `GraphBuilder::build`.
        self.states[&state].as_ref()
    }

    /// Target of `transition`.
    pub fn transition(&self, transition: P::Transition) -> Transition<P::State> {
        self.transitions[&transition]
    }
}

impl<P: Protocol> fmt::Debug for StateGraph<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateGraph")
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("transitions", &self.transitions)
            .finish()
    }
}

/// Collects states and transitions, then checks them for completeness.
pub struct GraphBuilder<P: Protocol> {
    states: FxHashMap<P::State, Box<dyn ChannelState<P>>>,
    transitions: FxHashMap<P::Transition, Transition<P::State>>,
    duplicate: Option<GraphError>,
}

impl<P: Protocol> GraphBuilder<P> {
    /// Register the behavior of `tag`.
    pub fn state(mut self, tag: P::State, behavior: impl ChannelState<P> + 'static) -> Self {
        if self.states.insert(tag, Box::new(behavior)).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(GraphError::DuplicateState(format!("{tag:?}")));
        }
        self
    }

    /// Register the target of `tag`.
    pub fn transition(mut self, tag: P::Transition, next_state: P::State, interest: InterestOps) -> Self {
        let target = Transition {
            next_state,
            interest,
        };
        if self.transitions.insert(tag, target).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(GraphError::DuplicateTransition(format!("{tag:?}")));
        }
        self
    }

    /// Finish the graph, failing on the first missing or duplicated tag.
    pub fn build(self) -> Result<StateGraph<P>, GraphError> {
        if let Some(duplicate) = self.duplicate {
            return Err(duplicate);
        }
        if let Some(missing) = P::State::ALL.iter().find(|s| !self.states.contains_key(s)) {
            return Err(GraphError::MissingState(format!("{missing:?}")));
        }
        if let Some(missing) = P::Transition::ALL
            .iter()
            .find(|t| !self.transitions.contains_key(t))
        {
            return Err(GraphError::MissingTransition(format!("{missing:?}")));
        }
        Ok(StateGraph {
            states: self.states,
            transitions: self.transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Flip, FlipState, FlipTransition};

    fn stay_a(_: &mut ChannelContext<Flip>) -> Result<FlipTransition, ChannelError> {
        Ok(FlipTransition::ToA)
    }

    #[test]
    fn test_complete_graph_builds() {
        let graph = Flip::graph().unwrap();
        assert_eq!(
            graph.transition(FlipTransition::ToB),
            Transition {
                next_state: FlipState::B,
                interest: InterestOps::WRITE,
            }
        );
        assert_eq!(graph.transition(FlipTransition::ToA).next_state, FlipState::A);
    }

    #[test]
    fn test_missing_state_aborts_build() {
        let result = StateGraph::<Flip>::builder()
            .state(FlipState::A, stay_a)
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .transition(FlipTransition::ToB, FlipState::B, InterestOps::WRITE)
            .build();
        assert_eq!(result.unwrap_err(), GraphError::MissingState("B".to_string()));
    }

    #[test]
    fn test_missing_transition_aborts_build() {
        let result = StateGraph::<Flip>::builder()
            .state(FlipState::A, stay_a)
            .state(FlipState::B, stay_a)
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .build();
        assert_eq!(
            result.unwrap_err(),
            GraphError::MissingTransition("ToB".to_string())
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let result = StateGraph::<Flip>::builder()
            .state(FlipState::A, stay_a)
            .state(FlipState::A, stay_a)
            .state(FlipState::B, stay_a)
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .transition(FlipTransition::ToB, FlipState::B, InterestOps::WRITE)
            .build();
        assert_eq!(result.unwrap_err(), GraphError::DuplicateState("A".to_string()));
    }
}
