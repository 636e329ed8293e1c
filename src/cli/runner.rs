use std::future::Future;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::RuntimeSettings;
use crate::fan::FanCommand;
use crate::hw::{FanEvent, FanSession, HardwareClient};

/// The CLI's ends of a running fan session.
pub(crate) struct SessionChannels {
    pub(crate) commands: mpsc::UnboundedSender<FanCommand>,
    pub(crate) events: mpsc::UnboundedReceiver<FanEvent>,
}

/// Runs a fan session alongside `consumer` and stops it once `consumer` returns.
///
/// A session failure wins over whatever the consumer reported, since the
/// consumer only sees a closed channel in that case.
pub(crate) async fn with_session<F, Fut, T>(
    hardware: &dyn HardwareClient,
    settings: &RuntimeSettings,
    consumer: F,
) -> Result<T>
where
    F: FnOnce(SessionChannels) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let session = FanSession::new(hardware, settings.target(), settings.config()).run(
        command_rx,
        event_tx,
        cancel.clone(),
    );
    let consumer = async {
        let result = consumer(SessionChannels {
            commands: command_tx,
            events: event_rx,
        })
        .await;
        cancel.cancel();
        result
    };

    let (session_result, consumer_result) = tokio::join!(session, consumer);
    match session_result {
        Ok(summary) => {
            debug!(links_opened = summary.links_opened(), "fan session stopped");
            consumer_result
        }
        Err(error) => Err(error.into()),
    }
}
