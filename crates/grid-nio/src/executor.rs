//! Execution of channel transitions on a worker pool.
//!
//! The reactor hands a ready channel's context to the pool and forgets about
//! it until the context comes back as an [`Outcome`]. While a worker holds the
//! context, its socket is not registered for readiness, so no second
//! transition can start for the same channel.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::context::{ChannelContext, ConnectionId};
use crate::error::ChannelError;
use crate::graph::StateGraph;
use crate::protocol::Protocol;

/// What happened to a context handed to the pool.
pub enum Outcome<P: Protocol> {
    /// The transition was applied; the context carries its next state and
    /// interest.
    Completed(ChannelContext<P>),
    /// The state failed and the channel was closed.
    Closed(ConnectionId),
}

/// Run the current state of `ctx` and apply the transition it returns.
///
/// Returns `None` when the state failed or panicked, in which case the
/// protocol's `handle_exception` and `channel_closed` hooks have run and the
/// socket is shut down.
pub(crate) fn execute<P: Protocol>(
    protocol: &P,
    graph: &StateGraph<P>,
    mut ctx: ChannelContext<P>,
) -> Option<ChannelContext<P>> {
    let state = ctx.state();
    let result = panic::catch_unwind(AssertUnwindSafe(|| graph.state(state).perform(&mut ctx)))
        .unwrap_or_else(|payload| Err(ChannelError::Panicked(panic_message(payload.as_ref()))));

    match result {
        Ok(tag) => {
            apply_transition(graph, &mut ctx, tag);
            if ctx.state() != state {
                tracing::debug!(
                    "{}: channel {} {state:?} -{tag:?}-> {:?} [{:?}]",
                    protocol.name(),
                    ctx.id(),
                    ctx.state(),
                    ctx.interest()
                );
            } else {
                tracing::trace!(
                    "{}: channel {} stays in {state:?} via {tag:?} [{:?}]",
                    protocol.name(),
                    ctx.id(),
                    ctx.interest()
                );
            }
            Some(ctx)
        }
        Err(error) => {
            protocol.handle_exception(&mut ctx, &error);
            ctx.close();
            protocol.channel_closed(&ctx);
            None
        }
    }
}

/// Move `ctx` to the target of `tag`.
pub(crate) fn apply_transition<P: Protocol>(
    graph: &StateGraph<P>,
    ctx: &mut ChannelContext<P>,
    tag: P::Transition,
) {
    let target = graph.transition(tag);
    ctx.set_state(target.next_state);
    ctx.set_interest(target.interest);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Bounded pool of worker threads running transitions.
///
/// Contexts are submitted via [`submit`](Self::submit); every submitted
/// context produces exactly one [`Outcome`] on the channel given at
/// construction, followed by a call to the notifier.
pub struct TransitionExecutor<P: Protocol> {
    /// Channel sender for submitting contexts to workers.
    task_sender: Option<Sender<ChannelContext<P>>>,
    /// Handles to the worker threads (for shutdown).
    worker_handles: Vec<JoinHandle<()>>,
    /// Contexts queued or being executed.
    in_flight: Arc<AtomicUsize>,
}

impl<P: Protocol> TransitionExecutor<P> {
    /// Spawn the pool.
    ///
    /// `pool_size` of 0 uses one worker per CPU. Workers are named
    /// `<name>-transition-<n>`.
    pub fn new<F>(
        name: &str,
        pool_size: usize,
        protocol: Arc<P>,
        graph: Arc<StateGraph<P>>,
        outcomes: Sender<Outcome<P>>,
        notify: F,
    ) -> std::io::Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let worker_count = if pool_size == 0 {
            num_cpus::get()
        } else {
            pool_size
        };
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(notify);

        let mut executor = Self {
            task_sender: Some(task_tx),
            worker_handles: Vec::with_capacity(worker_count),
            in_flight,
        };
        for n in 0..worker_count {
            let rx: Receiver<ChannelContext<P>> = task_rx.clone();
            let tx = outcomes.clone();
            let protocol = Arc::clone(&protocol);
            let graph = Arc::clone(&graph);
            let flight = Arc::clone(&executor.in_flight);
            let notify = Arc::clone(&notify);

            let spawned = std::thread::Builder::new()
                .name(format!("{name}-transition-{n}"))
                .spawn(move || {
                    while let Ok(ctx) = rx.recv() {
                        let id = ctx.id();
                        let outcome = match execute(protocol.as_ref(), &graph, ctx) {
                            Some(ctx) => Outcome::Completed(ctx),
                            None => Outcome::Closed(id),
                        };
                        flight.fetch_sub(1, Ordering::Relaxed);
                        if tx.send(outcome).is_err() {
                            break;
                        }
                        notify();
                    }
                });
            match spawned {
                Ok(handle) => executor.worker_handles.push(handle),
                Err(e) => {
                    executor.shutdown();
                    return Err(e);
                }
            }
        }
        tracing::debug!("{name}: started {worker_count} transition workers");
        Ok(executor)
    }

    /// Queue `ctx` for execution. Hands the context back if the pool was shut
    /// down.
    pub fn submit(&self, ctx: ChannelContext<P>) -> Result<(), ChannelContext<P>> {
        let Some(sender) = &self.task_sender else {
            return Err(ctx);
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        sender.send(ctx).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            e.into_inner()
        })
    }

    /// Number of contexts queued or being executed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Number of worker threads.
    pub fn pool_size(&self) -> usize {
        self.worker_handles.len()
    }

    /// Let workers finish the queued contexts, then join them.
    pub fn shutdown(&mut self) {
        // Dropping the sender ends each worker's loop once the queue is empty.
        self.task_sender.take();
        for handle in self.worker_handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Transition worker panicked outside a state");
            }
        }
    }
}

impl<P: Protocol> Drop for TransitionExecutor<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::interest::InterestOps;
    use crate::testing::{Flip, FlipState, FlipTransition};
    use std::io::Read;
    use std::sync::Mutex;
    use std::time::Duration;

    fn failing_graph(panic: bool) -> StateGraph<Flip> {
        StateGraph::builder()
            .state(FlipState::A, move |_: &mut ChannelContext<Flip>| {
                if panic {
                    panic!("state blew up");
                }
                Err(ChannelError::Protocol("unexpected frame".to_string()))
            })
            .state(FlipState::B, |_: &mut ChannelContext<Flip>| Ok(FlipTransition::ToA))
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .transition(FlipTransition::ToB, FlipState::B, InterestOps::WRITE)
            .build()
            .unwrap()
    }

    /// A -ToB-> B then B -ToA-> A leaves the channel in A with ToA's interest.
    #[test]
    fn test_transitions_apply_state_and_interest() {
        let protocol = Flip::default();
        let graph = Flip::graph().unwrap();
        let (ctx, _peer) = test_context::<Flip>(FlipState::A, 0);

        let ctx = execute(&protocol, &graph, ctx).unwrap();
        assert_eq!(ctx.state(), FlipState::B);
        assert_eq!(ctx.interest(), InterestOps::WRITE);

        let ctx = execute(&protocol, &graph, ctx).unwrap();
        assert_eq!(ctx.state(), FlipState::A);
        assert_eq!(ctx.interest(), InterestOps::READ);
        assert_eq!(ctx.attachment, 2);
        assert_eq!(protocol.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_state_error_closes_channel() {
        let protocol = Flip::default();
        let graph = failing_graph(false);
        let (ctx, mut peer) = test_context::<Flip>(FlipState::A, 0);

        assert!(execute(&protocol, &graph, ctx).is_none());
        assert_eq!(protocol.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(protocol.closed.load(Ordering::SeqCst), 1);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_state_panic_is_channel_fatal() {
        let protocol = Flip::default();
        let graph = failing_graph(true);
        let (ctx, mut peer) = test_context::<Flip>(FlipState::A, 0);

        assert!(execute(&protocol, &graph, ctx).is_none());
        assert_eq!(protocol.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(protocol.closed.load(Ordering::SeqCst), 1);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"bang".to_string()), "bang");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }

    #[test]
    fn test_pool_returns_one_outcome_per_context() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&names);
        let graph = StateGraph::builder()
            .state(FlipState::A, move |_: &mut ChannelContext<Flip>| {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                recorded.lock().unwrap().push(name);
                Ok(FlipTransition::ToB)
            })
            .state(FlipState::B, |_: &mut ChannelContext<Flip>| {
                Err(ChannelError::Protocol("closing".to_string()))
            })
            .transition(FlipTransition::ToA, FlipState::A, InterestOps::READ)
            .transition(FlipTransition::ToB, FlipState::B, InterestOps::WRITE)
            .build()
            .unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut executor = TransitionExecutor::new(
            "test",
            2,
            Arc::new(Flip::default()),
            Arc::new(graph),
            tx,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(executor.pool_size(), 2);

        let mut peers = Vec::new();
        for state in [FlipState::A, FlipState::A, FlipState::B] {
            let (ctx, peer) = test_context::<Flip>(state, 0);
            peers.push(peer);
            assert!(executor.submit(ctx).is_ok());
        }

        let mut completed = 0;
        let mut closed = 0;
        for _ in 0..3 {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Outcome::Completed(ctx) => {
                    assert_eq!(ctx.state(), FlipState::B);
                    completed += 1;
                }
                Outcome::Closed(_) => closed += 1,
            }
        }
        assert_eq!((completed, closed), (2, 1));

        executor.shutdown();
        assert_eq!(notified.load(Ordering::SeqCst), 3);
        assert_eq!(executor.in_flight_count(), 0);
        for name in names.lock().unwrap().iter() {
            assert!(name.starts_with("test-transition-"), "{name}");
        }

        let (ctx, _peer) = test_context::<Flip>(FlipState::A, 0);
        assert!(executor.submit(ctx).is_err());
    }
}
