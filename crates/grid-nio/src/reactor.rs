//! The server loop.
//!
//! One thread per [`Reactor`] owns the readiness poller, the listening sockets
//! and every channel waiting for readiness. When a channel becomes ready its
//! socket is deregistered and its context handed to the
//! [`TransitionExecutor`]; when the context comes back, the socket is
//! registered again for the interest of the transition that was applied. A
//! channel is therefore either parked on the reactor or held by exactly one
//! worker, which is what keeps its transitions sequential.
//!
//! Code outside the loop talks to it through a [`ReactorHandle`]: commands go
//! over a channel and a [`Waker`] interrupts the readiness wait.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use rustc_hash::FxHashMap;

use crate::context::{ChannelContext, ConnectionId, IdGenerator};
use crate::error::ReactorError;
use crate::executor::{Outcome, TransitionExecutor, apply_transition};
use crate::framing::FrameConfig;
use crate::graph::StateGraph;
use crate::interest::InterestOps;
use crate::protocol::Protocol;
use crate::socket::{configure_stream, create_listener};
use crate::transport::ChannelTransport;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Configuration of one reactor.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Name used for the loop thread, the worker threads and logs.
    pub name: String,
    /// Addresses to listen on. Port 0 binds an ephemeral port.
    pub bind_addrs: Vec<SocketAddr>,
    /// Transition workers; 0 means one per CPU.
    pub pool_size: usize,
    /// Upper bound of one readiness wait; `None` waits until something happens.
    pub select_timeout: Option<Duration>,
    /// Send and receive buffer size of channel sockets; `None` keeps the OS default.
    pub socket_buffer_size: Option<usize>,
    /// Framing limits of every channel.
    pub frame: FrameConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            name: "reactor".to_string(),
            bind_addrs: Vec::new(),
            pool_size: 0,
            select_timeout: None,
            socket_buffer_size: Some(32 * 1024),
            frame: FrameConfig::default(),
        }
    }
}

enum Command<P: Protocol> {
    Register {
        id: ConnectionId,
        stream: TcpStream,
        transition: P::Transition,
    },
    Transition {
        id: ConnectionId,
        transition: P::Transition,
        submit: bool,
    },
    Close {
        id: ConnectionId,
    },
    Shutdown,
}

/// State shared between the loop and its handles.
struct Shared {
    running: AtomicBool,
    channels: AtomicUsize,
    ids: IdGenerator,
}

/// A non-blocking channel server for protocol `P`.
pub struct Reactor<P: Protocol> {
    config: ReactorConfig,
    protocol: Arc<P>,
    graph: Arc<StateGraph<P>>,
    handle: Option<ReactorHandle<P>>,
    thread: Option<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl<P: Protocol> Reactor<P> {
    /// Create a reactor, building the protocol's graph.
    ///
    /// An incomplete graph fails here, before any port is bound.
    pub fn new(config: ReactorConfig, protocol: P) -> Result<Self, ReactorError> {
        let graph = protocol.build_graph()?;
        tracing::debug!("{}: built state graph {graph:?}", config.name);
        Ok(Self {
            config,
            protocol: Arc::new(protocol),
            graph: Arc::new(graph),
            handle: None,
            thread: None,
            local_addrs: Vec::new(),
        })
    }

    /// Bind every configured address and run the loop on its own thread.
    pub fn start(&mut self) -> Result<ReactorHandle<P>, ReactorError> {
        if self.handle.is_some() {
            return Err(ReactorError::AlreadyStarted);
        }
        let name = self.config.name.clone();
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listeners = Vec::with_capacity(self.config.bind_addrs.len());
        let mut local_addrs = Vec::with_capacity(self.config.bind_addrs.len());
        for (index, &addr) in self.config.bind_addrs.iter().enumerate() {
            let mut listener = create_listener(addr, self.config.socket_buffer_size)
                .map_err(|source| ReactorError::Bind { addr, source })?;
            poll.registry().register(
                &mut listener,
                Token(index + 1),
                mio::Interest::READABLE,
            )?;
            local_addrs.push(listener.local_addr()?);
            listeners.push(listener);
        }

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
        let notifier = Arc::clone(&waker);
        let executor = TransitionExecutor::new(
            &name,
            self.config.pool_size,
            Arc::clone(&self.protocol),
            Arc::clone(&self.graph),
            outcome_tx,
            move || {
                if let Err(e) = notifier.wake() {
                    tracing::warn!("Failed to wake reactor: {e}");
                }
            },
        )?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            channels: AtomicUsize::new(0),
            ids: IdGenerator::starting_at(listeners.len() as u64 + 1),
        });
        let mut event_loop = EventLoop {
            name: name.clone(),
            poll,
            listeners,
            channels: FxHashMap::default(),
            protocol: Arc::clone(&self.protocol),
            graph: Arc::clone(&self.graph),
            executor,
            commands: command_rx,
            outcomes: outcome_rx,
            shared: Arc::clone(&shared),
            select_timeout: self.config.select_timeout,
            socket_buffer_size: self.config.socket_buffer_size,
            frame: self.config.frame.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = event_loop.run() {
                    tracing::error!("{}: reactor loop terminated: {e}", event_loop.name);
                }
                event_loop.shutdown();
            })?;

        tracing::info!("{name}: listening on {local_addrs:?}");
        let handle = ReactorHandle {
            commands: command_tx,
            waker,
            shared,
        };
        self.local_addrs = local_addrs;
        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the loop, close every channel and join all threads. Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Some(handle) = &self.handle {
            // The loop may already have exited on its own.
            let _ = handle.send(Command::Shutdown);
        }
        if thread.join().is_err() {
            tracing::error!("{}: reactor thread panicked", self.config.name);
        }
        tracing::info!("{}: stopped", self.config.name);
    }

    /// Addresses actually bound, available after [`start`](Self::start).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// A handle to the running reactor.
    pub fn handle(&self) -> Option<ReactorHandle<P>> {
        self.handle.clone()
    }

    /// The protocol served.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }
}

impl<P: Protocol> Drop for Reactor<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Thread-safe access to a running reactor.
pub struct ReactorHandle<P: Protocol> {
    commands: Sender<Command<P>>,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
}

impl<P: Protocol> Clone for ReactorHandle<P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            waker: Arc::clone(&self.waker),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Protocol> ReactorHandle<P> {
    /// Hand an already connected outbound socket to the reactor.
    ///
    /// The channel starts in the protocol's initial state with no interest,
    /// then `transition` is applied to it.
    pub fn register_channel(
        &self,
        stream: std::net::TcpStream,
        transition: P::Transition,
    ) -> Result<ConnectionId, ReactorError> {
        if !self.is_running() {
            return Err(ReactorError::Stopped);
        }
        stream.set_nonblocking(true)?;
        let id = self.shared.ids.next_id();
        self.send(Command::Register {
            id,
            stream: TcpStream::from_std(stream),
            transition,
        })?;
        Ok(id)
    }

    /// Move channel `id` through `transition` from outside the executor.
    ///
    /// With `submit` the channel runs its new state right away instead of
    /// waiting for the transition's interest. A channel currently held by a
    /// worker gets the transition once the worker hands it back.
    pub fn transition_channel(
        &self,
        id: ConnectionId,
        transition: P::Transition,
        submit: bool,
    ) -> Result<(), ReactorError> {
        self.send(Command::Transition {
            id,
            transition,
            submit,
        })
    }

    /// Close channel `id`.
    pub fn close_channel(&self, id: ConnectionId) -> Result<(), ReactorError> {
        self.send(Command::Close { id })
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.load(Ordering::SeqCst)
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command<P>) -> Result<(), ReactorError> {
        if !self.is_running() {
            return Err(ReactorError::Stopped);
        }
        self.commands
            .send(command)
            .map_err(|_| ReactorError::Stopped)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Where a channel is.
enum Slot<P: Protocol> {
    /// On the reactor; its socket is registered iff its interest is not empty.
    Parked(ChannelContext<P>),
    /// Held by a worker, with the commands that arrived in the meantime.
    InFlight {
        pending: Vec<(P::Transition, bool)>,
        closing: bool,
    },
}

struct EventLoop<P: Protocol> {
    name: String,
    poll: Poll,
    listeners: Vec<TcpListener>,
    channels: FxHashMap<ConnectionId, Slot<P>>,
    protocol: Arc<P>,
    graph: Arc<StateGraph<P>>,
    executor: TransitionExecutor<P>,
    commands: Receiver<Command<P>>,
    outcomes: Receiver<Outcome<P>>,
    shared: Arc<Shared>,
    select_timeout: Option<Duration>,
    socket_buffer_size: Option<usize>,
    frame: FrameConfig,
}

impl<P: Protocol> EventLoop<P> {
    fn run(&mut self) -> Result<(), ReactorError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, self.select_timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Poll(e));
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(index) if index <= self.listeners.len() => self.accept(index - 1),
                    Token(raw) => self.dispatch_ready(ConnectionId(raw as u64)),
                }
            }

            self.drain_outcomes();
            if self.drain_commands() {
                return Ok(());
            }
            self.protocol.post_select();
            if self.protocol.external_stop_condition() {
                tracing::info!("{}: external stop condition reached", self.name);
                return Ok(());
            }
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok((stream, addr)) => self.on_accept(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    tracing::warn!("{}: transient accept error: {e}", self.name);
                }
                Err(e) => {
                    tracing::error!("{}: accept failed: {e}", self.name);
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_stream(&stream, self.socket_buffer_size) {
            tracing::debug!("{}: could not configure socket of {addr}: {e}", self.name);
        }
        let id = self.shared.ids.next_id();
        let mut ctx = self.new_context(id, stream);
        ctx.set_interest(self.protocol.initial_interest());
        self.shared.channels.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("{}: accepted {addr} as channel {id}", self.name);

        match self.protocol.post_accept(&mut ctx) {
            Ok(Some(transition)) => apply_transition(&self.graph, &mut ctx, transition),
            Ok(None) => {}
            Err(error) => {
                self.protocol.handle_exception(&mut ctx, &error);
                self.close_context(ctx);
                return;
            }
        }
        self.park(ctx);
    }

    fn new_context(&self, id: ConnectionId, stream: TcpStream) -> ChannelContext<P> {
        let transport = match self.protocol.cipher_engine() {
            Some(engine) => ChannelTransport::secure(stream, engine),
            None => ChannelTransport::plain(stream),
        };
        ChannelContext::new(
            id,
            transport,
            self.protocol.initial_state(),
            self.frame.clone(),
            self.protocol.create_attachment(),
        )
    }

    fn dispatch_ready(&mut self, id: ConnectionId) {
        // Events for channels held by a worker are stale.
        if let Some(mut ctx) = self.take_parked(id) {
            self.unregister(&mut ctx);
            self.submit(ctx);
        }
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            match outcome {
                Outcome::Completed(ctx) => self.on_completed(ctx),
                Outcome::Closed(id) => {
                    self.channels.remove(&id);
                    self.shared.channels.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn on_completed(&mut self, mut ctx: ChannelContext<P>) {
        let (pending, closing) = match self.channels.remove(&ctx.id()) {
            Some(Slot::InFlight { pending, closing }) => (pending, closing),
            _ => (Vec::new(), false),
        };
        if closing {
            self.close_context(ctx);
            return;
        }
        let mut submit = false;
        for (transition, resubmit) in pending {
            apply_transition(&self.graph, &mut ctx, transition);
            submit |= resubmit;
        }
        if submit {
            self.submit(ctx);
        } else {
            self.park(ctx);
        }
    }

    /// Returns `true` on shutdown.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register {
                    id,
                    stream,
                    transition,
                } => self.register(id, stream, transition),
                Command::Transition {
                    id,
                    transition,
                    submit,
                } => self.transition(id, transition, submit),
                Command::Close { id } => self.close_channel(id),
                Command::Shutdown => return true,
            }
        }
        false
    }

    fn register(&mut self, id: ConnectionId, stream: TcpStream, transition: P::Transition) {
        if let Err(e) = configure_stream(&stream, self.socket_buffer_size) {
            tracing::debug!("{}: could not configure socket of {id}: {e}", self.name);
        }
        let mut ctx = self.new_context(id, stream);
        self.shared.channels.fetch_add(1, Ordering::SeqCst);
        apply_transition(&self.graph, &mut ctx, transition);
        tracing::debug!(
            "{}: registered outbound channel {id} in {:?}",
            self.name,
            ctx.state()
        );
        self.park(ctx);
    }

    fn transition(&mut self, id: ConnectionId, transition: P::Transition, submit: bool) {
        if let Some(Slot::InFlight { pending, .. }) = self.channels.get_mut(&id) {
            pending.push((transition, submit));
            return;
        }
        let Some(mut ctx) = self.take_parked(id) else {
            tracing::debug!("{}: transition {transition:?} for unknown channel {id}", self.name);
            return;
        };
        self.unregister(&mut ctx);
        apply_transition(&self.graph, &mut ctx, transition);
        if submit {
            self.submit(ctx);
        } else {
            self.park(ctx);
        }
    }

    fn close_channel(&mut self, id: ConnectionId) {
        if let Some(Slot::InFlight { closing, .. }) = self.channels.get_mut(&id) {
            *closing = true;
            return;
        }
        if let Some(mut ctx) = self.take_parked(id) {
            self.unregister(&mut ctx);
            self.close_context(ctx);
        }
    }

    fn take_parked(&mut self, id: ConnectionId) -> Option<ChannelContext<P>> {
        if !matches!(self.channels.get(&id), Some(Slot::Parked(_))) {
            return None;
        }
        match self.channels.remove(&id) {
            Some(Slot::Parked(ctx)) => Some(ctx),
            _ => None,
        }
    }

    /// Hand `ctx` to a worker with zero interest.
    fn submit(&mut self, mut ctx: ChannelContext<P>) {
        let id = ctx.id();
        ctx.set_interest(InterestOps::NONE);
        self.channels.insert(
            id,
            Slot::InFlight {
                pending: Vec::new(),
                closing: false,
            },
        );
        if let Err(ctx) = self.executor.submit(ctx) {
            self.channels.remove(&id);
            self.close_context(ctx);
        }
    }

    /// Register the interest of `ctx` and keep it until it is ready.
    fn park(&mut self, mut ctx: ChannelContext<P>) {
        let id = ctx.id();
        let interest = ctx.interest();
        if interest.is_readable() && ctx.transport().has_buffered_input() {
            self.submit(ctx);
            return;
        }
        if let Some(mio_interest) = interest.to_mio() {
            let token = Token(id.0 as usize);
            let registered = self.poll.registry().register(
                ctx.transport_mut().stream_mut(),
                token,
                mio_interest,
            );
            if let Err(e) = registered {
                tracing::warn!("{}: failed to register channel {id}: {e}", self.name);
                ctx.set_interest(InterestOps::NONE);
                self.close_context(ctx);
                return;
            }
        }
        self.channels.insert(id, Slot::Parked(ctx));
    }

    fn unregister(&self, ctx: &mut ChannelContext<P>) {
        if !ctx.interest().is_empty() {
            if let Err(e) = self
                .poll
                .registry()
                .deregister(ctx.transport_mut().stream_mut())
            {
                tracing::trace!("{}: deregister of channel {}: {e}", self.name, ctx.id());
            }
            ctx.set_interest(InterestOps::NONE);
        }
    }

    fn close_context(&self, mut ctx: ChannelContext<P>) {
        ctx.close();
        self.protocol.channel_closed(&ctx);
        self.shared.channels.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("{}: closed channel {}", self.name, ctx.id());
    }

    /// Close every listener and channel, then stop the workers.
    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for mut listener in self.listeners.drain(..) {
            let _ = self.poll.registry().deregister(&mut listener);
        }

        let slots: Vec<Slot<P>> = self.channels.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Slot::Parked(mut ctx) = slot {
                self.unregister(&mut ctx);
                self.close_context(ctx);
            }
        }

        self.executor.shutdown();
        while let Ok(outcome) = self.outcomes.try_recv() {
            match outcome {
                Outcome::Completed(ctx) => self.close_context(ctx),
                Outcome::Closed(_) => {
                    self.shared.channels.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        while self.commands.try_recv().is_ok() {}
    }
}
