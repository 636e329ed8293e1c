use std::time::Instant as StdInstant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::hardware::{BleLink, HardwareClient, LinkEvent};
use super::model::{DeviceTarget, FoundDevice};
use super::transport::{BleClientNode, FanEntity, OutboundOp, Outbox};
use crate::config::FanConfig;
use crate::controller::FanController;
use crate::error::InteractionError;
use crate::fan::{FanCommand, FanState};
use crate::handlers::CommandError;
use crate::session::ConnectionState;

/// Something a running [`FanSession`] reports to its caller.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FanEvent {
    /// A link to the appliance was opened.
    Linked { device: FoundDevice },
    ConnectionChanged { state: ConnectionState },
    StateChanged { state: FanState },
    CommandSucceeded { command: FanCommand },
    CommandFailed { command: FanCommand, error: String },
}

/// [`FanEntity`] that forwards everything onto a channel.
#[derive(Debug, Clone)]
pub struct ChannelEntity {
    events: mpsc::UnboundedSender<FanEvent>,
}

impl ChannelEntity {
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<FanEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: FanEvent) {
        if self.events.send(event).is_err() {
            debug!("fan event receiver dropped");
        }
    }
}

impl FanEntity for ChannelEntity {
    fn set_state(&mut self, state: &FanState) {
        self.emit(FanEvent::StateChanged { state: *state });
    }

    fn write_failed(&mut self, command: &FanCommand, error: &CommandError) {
        self.emit(FanEvent::CommandFailed {
            command: *command,
            error: error.to_string(),
        });
    }

    fn write_succeeded(&mut self, command: &FanCommand) {
        self.emit(FanEvent::CommandSucceeded { command: *command });
    }

    fn connection_changed(&mut self, state: ConnectionState) {
        self.emit(FanEvent::ConnectionChanged { state });
    }
}

/// Totals reported when a [`FanSession`] stops.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionSummary {
    links_opened: u32,
    last_state: FanState,
}

impl SessionSummary {
    #[must_use]
    pub fn links_opened(&self) -> u32 {
        self.links_opened
    }

    #[must_use]
    pub fn last_state(&self) -> &FanState {
        &self.last_state
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum LinkOutcome {
    Cancelled,
    Lost { reached_ready: bool },
}

/// Async binding that runs a [`FanController`] against real or fake hardware.
///
/// Connects to the target, feeds link events and ticks into the controller,
/// flushes the controller's queued BLE operations and reconnects according to
/// the configured [`crate::ReconnectPolicy`].
#[derive(Clone, Copy)]
pub struct FanSession<'a> {
    hardware: &'a dyn HardwareClient,
    target: &'a DeviceTarget,
    config: &'a FanConfig,
}

impl<'a> FanSession<'a> {
    #[must_use]
    pub fn new(
        hardware: &'a dyn HardwareClient,
        target: &'a DeviceTarget,
        config: &'a FanConfig,
    ) -> Self {
        Self {
            hardware,
            target,
            config,
        }
    }

    /// Runs until `cancel` fires or reconnecting is no longer allowed.
    ///
    /// Commands received on `commands` are handed to the controller; every
    /// entity callback is published on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`InteractionError::ReconnectExhausted`] once the reconnect
    /// policy gives up.
    #[instrument(skip_all, level = "info", fields(target = %self.target))]
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<FanCommand>,
        events: mpsc::UnboundedSender<FanEvent>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, InteractionError> {
        let mut controller = FanController::new(
            self.config.clone(),
            Outbox::new(),
            ChannelEntity::new(events.clone()),
        );
        let policy = *self.config.reconnect();
        let mut links_opened = 0_u32;
        let mut failed_attempts = 0_u32;

        loop {
            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                connected = self.hardware.connect(self.target) => connected,
            };

            let lost = match connected {
                Ok(mut link) => {
                    links_opened += 1;
                    if events
                        .send(FanEvent::Linked {
                            device: link.device().clone(),
                        })
                        .is_err()
                    {
                        debug!("fan event receiver dropped");
                    }

                    let outcome = self
                        .drive_link(&mut controller, link.as_mut(), &mut commands, &cancel)
                        .await;
                    if let Err(error) = link.close().await {
                        debug!(%error, "failed to close link cleanly");
                    }
                    match outcome {
                        LinkOutcome::Cancelled => break,
                        LinkOutcome::Lost { reached_ready } => {
                            if reached_ready {
                                failed_attempts = 0;
                            }
                            InteractionError::LinkClosed
                        }
                    }
                }
                Err(error) => error,
            };

            failed_attempts += 1;
            if !policy.allows(failed_attempts) {
                warn!(%lost, attempts = failed_attempts, "giving up on the appliance");
                return Err(InteractionError::ReconnectExhausted {
                    attempts: failed_attempts,
                });
            }
            info!(
                %lost,
                attempt = failed_attempts,
                backoff = %humantime::format_duration(policy.backoff()),
                "reconnecting"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(policy.backoff()) => {}
            }
        }

        Ok(SessionSummary {
            links_opened,
            last_state: *controller.fan_state(),
        })
    }

    async fn drive_link(
        &self,
        controller: &mut FanController<Outbox, ChannelEntity>,
        link: &mut dyn BleLink,
        commands: &mut mpsc::UnboundedReceiver<FanCommand>,
        cancel: &CancellationToken,
    ) -> LinkOutcome {
        let mut reached_ready = false;
        let mut commands_open = true;
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        controller.on_connected(now());
        controller.on_services_resolved(now());

        loop {
            if let Some(lost) = flush(controller, link).await {
                if lost {
                    controller.on_disconnected(now());
                }
                return LinkOutcome::Lost { reached_ready };
            }
            reached_ready |= controller.connection_state() == ConnectionState::Ready;

            tokio::select! {
                () = cancel.cancelled() => {
                    controller.on_disconnected(now());
                    return LinkOutcome::Cancelled;
                }
                event = link.next_event() => match event {
                    LinkEvent::Notification { endpoint, bytes } => {
                        controller.on_notification(endpoint, &bytes, now());
                    }
                    LinkEvent::Disconnected => {
                        controller.on_disconnected(now());
                        return LinkOutcome::Lost { reached_ready };
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => controller.request(command, now()),
                    None => commands_open = false,
                },
                _ = ticker.tick() => controller.tick(now()),
            }
        }
    }
}

/// Performs queued BLE operations in order.
///
/// Returns `Some(true)` when the link failed underneath us and `Some(false)`
/// when the controller asked to disconnect.
async fn flush(
    controller: &mut FanController<Outbox, ChannelEntity>,
    link: &mut dyn BleLink,
) -> Option<bool> {
    for op in controller.client_mut().drain() {
        let result = match op {
            OutboundOp::Write { endpoint, bytes } => link.write(endpoint, &bytes).await,
            OutboundOp::Subscribe(endpoint) => link.subscribe(endpoint).await,
            OutboundOp::Disconnect => return Some(false),
        };
        if let Err(error) = result {
            warn!(%error, "BLE operation failed; treating link as lost");
            return Some(true);
        }
    }
    None
}

fn now() -> StdInstant {
    Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::hw::fake_backend::{FakeAppliance, FakeHardwareClient};
    use crate::key::DeviceKey;

    fn key() -> DeviceKey {
        DeviceKey::parse("00112233445566778899aabbccddeeff").expect("test key should parse")
    }

    fn config(reconnect: ReconnectPolicy) -> FanConfig {
        FanConfig::builder()
            .device_key(key())
            .reconnect(reconnect)
            .build()
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<FanEvent>,
        predicate: impl Fn(&FanEvent) -> bool,
    ) -> FanEvent {
        loop {
            let event = events.recv().await.expect("session should keep emitting");
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn command_reaches_the_appliance() {
        let client = FakeHardwareClient::new(FakeAppliance::builder().key(key()).build());
        let handle = client.handle();
        let target = DeviceTarget::default();
        let config = config(ReconnectPolicy::disabled());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = FanSession::new(&client, &target, &config).run(
            command_rx,
            event_tx,
            cancel.clone(),
        );
        let driver = async {
            next_matching(&mut event_rx, |event| {
                *event
                    == FanEvent::ConnectionChanged {
                        state: ConnectionState::Ready,
                    }
            })
            .await;
            command_tx
                .send(FanCommand::SetSpeed(12))
                .expect("session should accept commands");
            let done = next_matching(&mut event_rx, |event| {
                matches!(
                    event,
                    FanEvent::CommandSucceeded { .. } | FanEvent::CommandFailed { .. }
                )
            })
            .await;
            cancel.cancel();
            done
        };

        let (summary, done) = tokio::join!(session, driver);

        assert_eq!(
            FanEvent::CommandSucceeded {
                command: FanCommand::SetSpeed(12)
            },
            done
        );
        assert_eq!(12, handle.state().await.speed());
        let summary = summary.expect("session should stop cleanly");
        assert_eq!(1, summary.links_opened());
        assert_eq!(12, summary.last_state().speed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_the_link_drops() {
        let client = FakeHardwareClient::new(FakeAppliance::builder().key(key()).build());
        let handle = client.handle();
        let target = DeviceTarget::default();
        let config = config(
            ReconnectPolicy::builder()
                .backoff(Duration::from_millis(500))
                .max_attempts(3)
                .build(),
        );
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ready = |event: &FanEvent| {
            *event
                == FanEvent::ConnectionChanged {
                    state: ConnectionState::Ready,
                }
        };

        let session = FanSession::new(&client, &target, &config).run(
            command_rx,
            event_tx,
            cancel.clone(),
        );
        let driver = async {
            next_matching(&mut event_rx, ready).await;
            handle.drop_link().await;
            next_matching(&mut event_rx, |event| {
                *event
                    == FanEvent::ConnectionChanged {
                        state: ConnectionState::Disconnected,
                    }
            })
            .await;
            next_matching(&mut event_rx, ready).await;
            cancel.cancel();
        };

        let (summary, ()) = tokio::join!(session, driver);

        assert_eq!(2, summary.expect("session should stop cleanly").links_opened());
        assert_eq!(2, handle.connections().await);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_the_appliance_stays_away() {
        let client = FakeHardwareClient::new(FakeAppliance::builder().key(key()).build());
        client.handle().set_reachable(false).await;
        let target = DeviceTarget::default();
        let config = config(
            ReconnectPolicy::builder()
                .backoff(Duration::from_secs(1))
                .max_attempts(2)
                .build(),
        );
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let result = FanSession::new(&client, &target, &config)
            .run(command_rx, event_tx, CancellationToken::new())
            .await;

        assert_matches!(result, Err(InteractionError::ReconnectExhausted { attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_is_not_retried_forever() {
        let client = FakeHardwareClient::new(
            FakeAppliance::builder().key(key()).reject_auth(true).build(),
        );
        let target = DeviceTarget::default();
        let config = config(
            ReconnectPolicy::builder()
                .backoff(Duration::from_secs(1))
                .max_attempts(1)
                .build(),
        );
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let result = FanSession::new(&client, &target, &config)
            .run(command_rx, event_tx, CancellationToken::new())
            .await;

        assert_matches!(result, Err(InteractionError::ReconnectExhausted { attempts: 2 }));
    }
}
