//! Runtime-agnostic channel orchestration state machine.
//!
//! This is the pure, deterministic core of a channel: observed inputs go in,
//! the actions to perform come out. It owns every piece of channel state —
//! registers, the RPC queue, stream refcounts, the cached acquisition
//! config — but performs no I/O and holds no timers, so every protocol rule
//! is testable without sockets.
//!
//! Design constraints:
//! - No sleeps, no threads, no blocking waits
//! - No clocks: timer firings arrive as inputs, arming them is an action
//! - Single-threaded by construction; the driver feeds one input at a time

use crate::error::{ChannelError, ProtocolError};
use crate::events::ChannelEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::notify::Notification;
use crate::profile::{ChannelStatus, DeviceProfile};
use crate::register::RegisterBank;
use crate::rpc::{methods, RpcCall, RpcQueue, RpcTag};
use crate::streams::{StreamPacket, StreamSubscriptions};
use crate::wire;
use rmpv::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An observed event fed into the state machine by the driver.
#[derive(Debug)]
pub enum Input {
    /// Outcome of the oldest transmitted RPC
    RpcReply(Result<Value, ChannelError>),
    /// A decoded message from the notification feed
    Notification(Notification),
    /// A decoded packet from a stream feed
    StreamPacketReceived(StreamPacket),
    /// Fatal fault reported by any socket task
    Fault(ChannelError),
    /// The repeating heartbeat send timer fired
    HeartbeatSendDue,
    /// The heartbeat reply deadline expired
    HeartbeatTimedOut,
    /// Collaborator wants to write a register (signed view)
    WriteRegister { index: u8, value: i32 },
    /// Collaborator subscribes to a sample stream
    SubscribeStream { index: usize },
    /// Collaborator drops a sample-stream subscription
    UnsubscribeStream { index: usize },
    /// Collaborator requests a new acquisition window
    SetStreamAcquisitionConfig {
        time_span_seconds: f64,
        points: u32,
    },
    /// Collaborator asks for teardown
    ShutdownRequested,
}

/// An effect the driver must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Transmit an RPC request. Emitted only while the wire is free.
    SendRpc {
        method: &'static str,
        args: Vec<Value>,
    },
    /// Connect the notification SUB socket and start pumping it
    OpenNotificationFeed { port: u16 },
    /// Connect a stream SUB socket and start pumping it
    OpenStreamFeed { stream_index: usize, port: u16 },
    /// Close a stream feed
    CloseStreamFeed { stream_index: usize },
    /// Arm the repeating heartbeat send timer
    StartHeartbeat,
    /// Arm the one-shot heartbeat reply deadline
    ArmReplyDeadline,
    /// Cancel the heartbeat reply deadline
    CancelReplyDeadline,
    /// Deliver an event to collaborators
    Emit(ChannelEvent),
    /// Release every socket, task and timer; terminal
    Teardown,
}

/// Bring-up progresses strictly left to right; `Down` is terminal from any
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotificationPort,
    StreamPorts,
    ReadingRegisters,
    AcquisitionConfig,
    Ready,
    Down,
}

/// Deterministic protocol core of one channel.
pub struct ChannelStateMachine {
    label: String,
    profile: Arc<dyn DeviceProfile>,
    phase: Phase,
    bank: RegisterBank,
    pending_reads: VecDeque<u8>,
    rpc: RpcQueue,
    heartbeat: HeartbeatMonitor,
    subscriptions: StreamSubscriptions,
    stream_ports: Vec<u16>,
    acquisition_config: Option<(f64, u32)>,
    status: Option<ChannelStatus>,
}

impl ChannelStateMachine {
    pub fn new(label: impl Into<String>, profile: Arc<dyn DeviceProfile>) -> Self {
        let bank = RegisterBank::new(&profile.registers());
        let pending_reads = bank.indices().into();
        Self {
            label: label.into(),
            profile,
            phase: Phase::NotificationPort,
            bank,
            pending_reads,
            rpc: RpcQueue::new(),
            heartbeat: HeartbeatMonitor::new(),
            subscriptions: StreamSubscriptions::new(),
            stream_ports: Vec::new(),
            acquisition_config: None,
            status: None,
        }
    }

    /// Kick off bring-up. Must be called exactly once, before any input.
    pub fn start(&mut self) -> Vec<Action> {
        debug!("[CHANNEL] {} requesting notification port", self.label);
        self.invoke(RpcCall::new(
            RpcTag::NotificationPort,
            methods::NOTIFICATION_PORT,
            vec![],
        ))
        .into_iter()
        .collect()
    }

    /// Advance the state machine with one observed input.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        if self.phase == Phase::Down {
            return Vec::new();
        }
        match input {
            Input::RpcReply(Ok(result)) => self.on_rpc_result(result),
            Input::RpcReply(Err(error)) => {
                self.rpc.complete();
                self.fail(error)
            }
            Input::Notification(notification) => self.on_notification(notification),
            Input::StreamPacketReceived(packet) => {
                vec![Action::Emit(ChannelEvent::StreamPacket(packet))]
            }
            Input::Fault(error) => self.fail(error),
            Input::HeartbeatSendDue => self.on_heartbeat_due(),
            Input::HeartbeatTimedOut => self.fail(ChannelError::ConnectionTimedOut),
            Input::WriteRegister { index, value } => self.on_local_write(index, value),
            Input::SubscribeStream { index } => self.on_subscribe(index),
            Input::UnsubscribeStream { index } => self.on_unsubscribe(index),
            Input::SetStreamAcquisitionConfig {
                time_span_seconds,
                points,
            } => self.on_set_acquisition_config(time_span_seconds, points),
            Input::ShutdownRequested => self.shutdown(),
        }
    }

    /// Registers as currently synchronized.
    pub fn registers(&self) -> &RegisterBank {
        &self.bank
    }

    /// Last profile-derived status, once any register value is known.
    pub fn status(&self) -> Option<ChannelStatus> {
        self.status
    }

    /// Cached acquisition window, once bring-up has read it.
    pub fn stream_acquisition_config(&self) -> Option<(f64, u32)> {
        self.acquisition_config
    }

    /// Ports of the controller's stream feeds, by stream index.
    pub fn stream_ports(&self) -> &[u16] {
        &self.stream_ports
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn is_down(&self) -> bool {
        self.phase == Phase::Down
    }

    fn on_rpc_result(&mut self, result: Value) -> Vec<Action> {
        let Some(tag) = self.rpc.complete() else {
            return self.fail(ChannelError::Protocol(ProtocolError::malformed(
                "response",
                "reply without an outstanding request",
            )));
        };
        let mut actions = match self.dispatch_reply(tag, result) {
            Ok(actions) => actions,
            Err(error) => return self.fail(error),
        };
        if self.phase != Phase::Down {
            if let Some(call) = self.rpc.dispatch_next() {
                actions.push(send(call));
            }
        }
        actions
    }

    fn dispatch_reply(&mut self, tag: RpcTag, result: Value) -> Result<Vec<Action>, ChannelError> {
        match tag {
            RpcTag::NotificationPort => {
                let port = wire::as_port(&result, "notificationPort result")?;
                self.phase = Phase::StreamPorts;
                let mut actions = vec![Action::OpenNotificationFeed { port }];
                actions.extend(self.invoke(RpcCall::new(
                    RpcTag::StreamPorts,
                    methods::STREAM_PORTS,
                    vec![],
                )));
                Ok(actions)
            }
            RpcTag::StreamPorts => {
                self.stream_ports = wire::as_port_list(&result, "streamPorts result")?;
                self.phase = Phase::ReadingRegisters;
                debug!(
                    "[CHANNEL] {} synchronizing {} registers",
                    self.label,
                    self.pending_reads.len()
                );
                Ok(self.next_register_read())
            }
            RpcTag::ReadRegister { index, resync } => {
                let wire_value = wire::as_wire_value(&result, "readRegister result")?;
                let register = self.bank.get_mut(index).ok_or_else(|| {
                    ProtocolError::malformed("readRegister", format!("unknown register {index}"))
                })?;
                register.set_from_remote_query(wire_value);
                let mut actions = self.register_changed(index);
                if !resync && self.phase == Phase::ReadingRegisters {
                    actions.extend(self.next_register_read());
                }
                Ok(actions)
            }
            RpcTag::StreamAcquisitionConfig => {
                let config =
                    wire::as_acquisition_config(&result, "streamAcquisitionConfig result")?;
                self.acquisition_config = Some(config);
                self.phase = Phase::Ready;
                info!("[CHANNEL] {} connection ready", self.label);
                Ok(vec![
                    Action::StartHeartbeat,
                    Action::Emit(ChannelEvent::ConnectionReady),
                ])
            }
            RpcTag::SetStreamAcquisitionConfig => {
                // Fire-and-forget: the authoritative value arrives as a
                // streamAcquisitionConfigChanged notification.
                Ok(Vec::new())
            }
            RpcTag::ModifyRegister { index } => {
                let succeeded = wire::as_bool(&result, "modifyRegister result")?;
                if succeeded {
                    return Ok(Vec::new());
                }
                warn!(
                    "[CHANNEL] {} write conflict on register {index}, re-reading",
                    self.label
                );
                let register = self.bank.get_mut(index).ok_or_else(|| {
                    ProtocolError::malformed("modifyRegister", format!("unknown register {index}"))
                })?;
                register.mark_desynchronized();
                let mut actions = vec![Action::Emit(ChannelEvent::RegisterDesynchronized {
                    index,
                })];
                actions.extend(self.invoke(RpcCall::new(
                    RpcTag::ReadRegister {
                        index,
                        resync: true,
                    },
                    methods::READ_REGISTER,
                    vec![Value::from(index)],
                )));
                Ok(actions)
            }
            RpcTag::Ping => {
                self.heartbeat.on_reply();
                Ok(vec![Action::CancelReplyDeadline])
            }
        }
    }

    fn next_register_read(&mut self) -> Vec<Action> {
        // Registers are read one at a time so that each authoritative value
        // is applied before the next read goes out.
        if let Some(index) = self.pending_reads.pop_front() {
            self.invoke(RpcCall::new(
                RpcTag::ReadRegister {
                    index,
                    resync: false,
                },
                methods::READ_REGISTER,
                vec![Value::from(index)],
            ))
            .into_iter()
            .collect()
        } else {
            self.phase = Phase::AcquisitionConfig;
            self.invoke(RpcCall::new(
                RpcTag::StreamAcquisitionConfig,
                methods::STREAM_ACQUISITION_CONFIG,
                vec![],
            ))
            .into_iter()
            .collect()
        }
    }

    fn on_notification(&mut self, notification: Notification) -> Vec<Action> {
        match notification {
            Notification::RegisterChanged { index, wire_value } => {
                let Some(register) = self.bank.get_mut(index) else {
                    return self.fail(ChannelError::Protocol(ProtocolError::malformed(
                        "registerChanged",
                        format!("unknown register {index}"),
                    )));
                };
                if register.set_from_remote_notification(wire_value) {
                    self.register_changed(index)
                } else {
                    Vec::new()
                }
            }
            Notification::StreamAcquisitionConfigChanged {
                time_span_seconds,
                points,
            } => {
                self.acquisition_config = Some((time_span_seconds, points));
                vec![Action::Emit(ChannelEvent::StreamAcquisitionConfigChanged {
                    time_span_seconds,
                    points,
                })]
            }
            Notification::Shutdown => {
                info!("[CHANNEL] {} remote shutdown", self.label);
                self.shutdown()
            }
            Notification::Unknown { method, params } => {
                warn!(
                    "[CHANNEL] {} unrecognized notification {method} ({} params)",
                    self.label,
                    params.len()
                );
                Vec::new()
            }
        }
    }

    fn on_heartbeat_due(&mut self) -> Vec<Action> {
        if self.phase != Phase::Ready {
            return Vec::new();
        }
        if !self.heartbeat.on_send_due() {
            // Still waiting for the previous ping's reply.
            return Vec::new();
        }
        let mut actions = vec![Action::ArmReplyDeadline];
        actions.extend(self.invoke(RpcCall::new(RpcTag::Ping, methods::PING, vec![])));
        actions
    }

    fn on_local_write(&mut self, index: u8, value: i32) -> Vec<Action> {
        let Some(register) = self.bank.get_mut(index) else {
            warn!("[CHANNEL] {} write to unknown register {index}", self.label);
            return Vec::new();
        };
        let Some(write) = register.set_from_local_change(value) else {
            return Vec::new();
        };
        let mut actions = self.register_changed(index);
        actions.extend(self.invoke(RpcCall::new(
            RpcTag::ModifyRegister { index },
            methods::MODIFY_REGISTER,
            vec![
                Value::from(index),
                Value::from(write.old_wire),
                Value::from(write.new_wire),
            ],
        )));
        actions
    }

    fn on_subscribe(&mut self, index: usize) -> Vec<Action> {
        let Some(&port) = self.stream_ports.get(index) else {
            warn!(
                "[CHANNEL] {} subscription to unknown stream {index}",
                self.label
            );
            return Vec::new();
        };
        if self.subscriptions.subscribe(index) {
            self.subscriptions.mark_open(index);
            vec![Action::OpenStreamFeed {
                stream_index: index,
                port,
            }]
        } else {
            Vec::new()
        }
    }

    fn on_unsubscribe(&mut self, index: usize) -> Vec<Action> {
        if self.subscriptions.unsubscribe(index) {
            vec![Action::CloseStreamFeed {
                stream_index: index,
            }]
        } else {
            Vec::new()
        }
    }

    fn on_set_acquisition_config(&mut self, time_span_seconds: f64, points: u32) -> Vec<Action> {
        if self.acquisition_config == Some((time_span_seconds, points)) {
            return Vec::new();
        }
        // Do not update the cache here: whatever the controller actually
        // applied comes back as a notification.
        self.invoke(RpcCall::new(
            RpcTag::SetStreamAcquisitionConfig,
            methods::SET_STREAM_ACQUISITION_CONFIG,
            vec![Value::F64(time_span_seconds), Value::from(points)],
        ))
        .into_iter()
        .collect()
    }

    /// Emit the change event for `index` plus any derived-state transitions.
    fn register_changed(&mut self, index: u8) -> Vec<Action> {
        let mut actions = vec![Action::Emit(ChannelEvent::RegisterChanged {
            index,
            value: self.bank.value(index),
        })];

        let status = self.profile.status(&self.bank);
        if self.status != Some(status) {
            self.status = Some(status);
            actions.push(Action::Emit(ChannelEvent::StatusChanged(status)));
        }

        if self.profile.condition_register() == Some(index) {
            let condition_value = self.bank.wire_value(index);
            let active: Vec<_> = self
                .profile
                .error_conditions()
                .iter()
                .copied()
                .filter(|c| c.is_active(condition_value))
                .collect();
            actions.push(Action::Emit(ChannelEvent::ErrorConditionsChanged(active)));
        }
        actions
    }

    fn invoke(&mut self, call: RpcCall) -> Option<Action> {
        self.rpc.invoke(call).map(send)
    }

    fn shutdown(&mut self) -> Vec<Action> {
        info!("[CHANNEL] {} shutting down", self.label);
        self.phase = Phase::Down;
        self.subscriptions.close_all();
        vec![Action::Emit(ChannelEvent::ShuttingDown), Action::Teardown]
    }

    fn fail(&mut self, error: ChannelError) -> Vec<Action> {
        warn!("[CHANNEL] {} connection failed: {error}", self.label);
        self.phase = Phase::Down;
        self.subscriptions.close_all();
        vec![
            Action::Emit(ChannelEvent::ConnectionFailed {
                reason: error.to_string(),
            }),
            Action::Emit(ChannelEvent::ShuttingDown),
            Action::Teardown,
        ]
    }
}

fn send(call: RpcCall) -> Action {
    Action::SendRpc {
        method: call.method,
        args: call.args,
    }
}
