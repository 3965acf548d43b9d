// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Tokio driver and public channel handle.
//!
//! [`Channel::open`] spawns one actor task per controller. The actor owns
//! every socket, timer and piece of protocol state; collaborators talk to it
//! through a cloneable command handle and observe it through the returned
//! event receiver. All state mutation happens inside the actor, one input at
//! a time, so the engine needs no locks.

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::heartbeat::{HeartbeatTick, HeartbeatTimers};
use crate::notify;
use crate::profile::DeviceProfile;
use crate::rpc;
use crate::state_machine::{Action, ChannelStateMachine, Input};
use crate::streams;
use crate::wire;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeromq::{ReqSocket, Socket, SubSocket};

/// Handle to a live channel actor.
///
/// All methods are fire-and-forget, mirroring the event-driven protocol
/// underneath: effects and failures surface on the event receiver. Commands
/// sent after teardown are silently dropped. When the last handle is dropped
/// the actor tears the connection down.
///
/// # Example
/// ```ignore
/// use servolink_channel::{Channel, ChannelConfig, ChannelEvent};
///
/// let (channel, mut events) = Channel::open(
///     ChannelConfig::new("192.168.1.20", 5000),
///     Arc::new(Mk2Profile),
/// )?;
/// while let Some(event) = events.recv().await {
///     match event {
///         ChannelEvent::ConnectionReady => channel.subscribe_stream(0),
///         ChannelEvent::StreamPacket(packet) => plot(packet),
///         ChannelEvent::ShuttingDown => break,
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Debug)]
enum Command {
    WriteRegister { index: u8, value: i32 },
    SubscribeStream { index: usize },
    UnsubscribeStream { index: usize },
    SetStreamAcquisitionConfig { time_span_seconds: f64, points: u32 },
    Shutdown,
}

impl Channel {
    /// Open a channel to one controller and start bring-up.
    ///
    /// Returns immediately; progress and failures are reported through the
    /// event receiver (`ConnectionReady` on success, exactly one
    /// `ConnectionFailed` otherwise). Must be called from within a tokio
    /// runtime.
    pub fn open(
        config: ChannelConfig,
        profile: Arc<dyn DeviceProfile>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(config, profile, commands_rx, events_tx));
        Ok((
            Self {
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    /// Write a register (signed view). Dropped while the register is
    /// unsynchronized; a no-op if the value is unchanged.
    pub fn write_register(&self, index: u8, value: i32) {
        self.send(Command::WriteRegister { index, value });
    }

    /// Add a reference to the given sample stream, opening the feed on the
    /// first subscription.
    pub fn subscribe_stream(&self, index: usize) {
        self.send(Command::SubscribeStream { index });
    }

    /// Drop a stream reference, closing the feed with the last one.
    pub fn unsubscribe_stream(&self, index: usize) {
        self.send(Command::UnsubscribeStream { index });
    }

    /// Request a new acquisition window. Only issued to the controller when
    /// it differs from the last known one; confirmation arrives as a
    /// `StreamAcquisitionConfigChanged` event.
    pub fn set_stream_acquisition_config(&self, time_span_seconds: f64, points: u32) {
        self.send(Command::SetStreamAcquisitionConfig {
            time_span_seconds,
            points,
        });
    }

    /// Tear the channel down. Idempotent; safe from any state.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

fn command_input(command: Command) -> Input {
    match command {
        Command::WriteRegister { index, value } => Input::WriteRegister { index, value },
        Command::SubscribeStream { index } => Input::SubscribeStream { index },
        Command::UnsubscribeStream { index } => Input::UnsubscribeStream { index },
        Command::SetStreamAcquisitionConfig {
            time_span_seconds,
            points,
        } => Input::SetStreamAcquisitionConfig {
            time_span_seconds,
            points,
        },
        Command::Shutdown => Input::ShutdownRequested,
    }
}

async fn run_channel(
    config: ChannelConfig,
    profile: Arc<dyn DeviceProfile>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let label = config.label();
    info!("[CHANNEL] {label} connecting to {}", config.rpc_endpoint());

    let mut rpc_socket = ReqSocket::new();
    if let Err(e) = rpc_socket.connect(&config.rpc_endpoint()).await {
        let error = ChannelError::Transport(e);
        warn!("[CHANNEL] {label} connection failed: {error}");
        let _ = events.send(ChannelEvent::ConnectionFailed {
            reason: error.to_string(),
        });
        let _ = events.send(ChannelEvent::ShuttingDown);
        return;
    }

    // Every socket task reports into one input queue; the actor is the only
    // place channel state is ever touched.
    let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();

    let timers = HeartbeatTimers::new(config.heartbeat_interval, config.heartbeat_timeout);
    let mut driver = Driver {
        config,
        label: label.clone(),
        events,
        requests_tx,
        inputs_tx: inputs_tx.clone(),
        timers,
        feeds: Feeds::default(),
    };
    driver.feeds.rpc = Some(tokio::spawn(rpc::run_rpc_endpoint(
        rpc_socket,
        requests_rx,
        inputs_tx,
    )));

    let mut sm = ChannelStateMachine::new(label, profile);
    if driver.execute(sm.start()).await {
        return;
    }

    loop {
        let input = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command_input(command),
                // Last handle gone: nobody can observe or drive this channel
                // any more, release the controller.
                None => Input::ShutdownRequested,
            },
            Some(input) = inputs_rx.recv() => input,
            tick = driver.timers.next() => match tick {
                HeartbeatTick::SendDue => Input::HeartbeatSendDue,
                HeartbeatTick::ReplyTimedOut => Input::HeartbeatTimedOut,
            },
        };
        if driver.execute(sm.handle(input)).await {
            return;
        }
    }
}

#[derive(Default)]
struct Feeds {
    rpc: Option<JoinHandle<()>>,
    notification: Option<JoinHandle<()>>,
    streams: HashMap<usize, JoinHandle<()>>,
}

impl Feeds {
    fn abort_all(&mut self) {
        if let Some(task) = self.rpc.take() {
            task.abort();
        }
        if let Some(task) = self.notification.take() {
            task.abort();
        }
        for (_, task) in self.streams.drain() {
            task.abort();
        }
    }
}

struct Driver {
    config: ChannelConfig,
    label: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    requests_tx: mpsc::UnboundedSender<Vec<u8>>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    timers: HeartbeatTimers,
    feeds: Feeds,
}

impl Driver {
    /// Execute one batch of state-machine actions. Returns true when the
    /// channel tore down and the actor must exit.
    async fn execute(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::SendRpc { method, args } => match wire::encode_request(method, args) {
                    Ok(frame) => {
                        let _ = self.requests_tx.send(frame);
                    }
                    Err(e) => self.fault(ChannelError::Protocol(e)),
                },
                Action::OpenNotificationFeed { port } => match self.open_feed(port).await {
                    Ok(socket) => {
                        debug!("[CHANNEL] {} notification feed on port {port}", self.label);
                        self.feeds.notification = Some(tokio::spawn(
                            notify::run_notification_feed(socket, self.inputs_tx.clone()),
                        ));
                    }
                    Err(e) => self.fault(e),
                },
                Action::OpenStreamFeed { stream_index, port } => {
                    match self.open_feed(port).await {
                        Ok(socket) => {
                            debug!(
                                "[CHANNEL] {} stream {stream_index} feed on port {port}",
                                self.label
                            );
                            self.feeds.streams.insert(
                                stream_index,
                                tokio::spawn(streams::run_stream_feed(
                                    stream_index,
                                    socket,
                                    self.inputs_tx.clone(),
                                )),
                            );
                        }
                        Err(e) => self.fault(e),
                    }
                }
                Action::CloseStreamFeed { stream_index } => {
                    if let Some(task) = self.feeds.streams.remove(&stream_index) {
                        debug!("[CHANNEL] {} stream {stream_index} feed closed", self.label);
                        task.abort();
                    }
                }
                Action::StartHeartbeat => self.timers.start(),
                Action::ArmReplyDeadline => self.timers.arm_reply_deadline(),
                Action::CancelReplyDeadline => self.timers.clear_reply_deadline(),
                Action::Emit(event) => {
                    let _ = self.events.send(event);
                }
                Action::Teardown => {
                    self.feeds.abort_all();
                    self.timers.stop();
                    debug!("[CHANNEL] {} released", self.label);
                    return true;
                }
            }
        }
        false
    }

    async fn open_feed(&self, port: u16) -> Result<SubSocket> {
        let mut socket = SubSocket::new();
        socket.connect(&self.config.endpoint(port)).await?;
        socket.subscribe("").await?;
        Ok(socket)
    }

    /// Feed a driver-side fault back through the input queue so it takes the
    /// same teardown path as every other error.
    fn fault(&self, error: ChannelError) {
        let _ = self.inputs_tx.send(Input::Fault(error));
    }
}
