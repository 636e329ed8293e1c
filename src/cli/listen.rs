use std::io;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tokio::signal;
use tracing::{info, instrument};

use crate::cli::{OutputFormat, RuntimeSettings};
use crate::error::InteractionError;
use crate::hw::{FanEvent, HardwareClient};

use super::report::Reporter;
use super::runner::{SessionChannels, with_session};

/// Arguments for the `listen` command.
#[derive(Debug, Clone, Copy, Args)]
pub struct ListenArgs {
    /// Stop after this many fan state updates. If omitted, listen until Ctrl+C.
    #[arg(long)]
    max_updates: Option<usize>,
}

impl ListenArgs {
    /// Creates listen arguments with an optional update limit.
    #[must_use]
    pub fn new(max_updates: Option<usize>) -> Self {
        Self { max_updates }
    }

    #[must_use]
    pub(crate) fn max_updates(&self) -> Option<usize> {
        self.max_updates
    }
}

/// Why a listen session stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(tag = "reason", content = "limit", rename_all = "snake_case")]
pub enum ListenStopReason {
    #[display("reached limit of {_0} update(s)")]
    ReachedLimit(usize),
    #[display("interrupted")]
    Interrupted,
    #[display("session ended")]
    SessionEnded,
}

#[derive(Debug, Serialize)]
struct ListenSummary {
    event: &'static str,
    #[serde(flatten)]
    stop_reason: ListenStopReason,
    state_updates: usize,
}

/// Executes the `listen` command.
#[instrument(skip_all, level = "info", fields(max_updates = ?args.max_updates()))]
pub(crate) async fn run<W>(
    hardware: &dyn HardwareClient,
    settings: &RuntimeSettings,
    args: &ListenArgs,
    reporter: Reporter<'_, W>,
    format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let max_updates = args.max_updates();
    with_session(hardware, settings, |channels| {
        stream_updates(channels, max_updates, reporter, format)
    })
    .await
}

async fn stream_updates<W>(
    mut channels: SessionChannels,
    max_updates: Option<usize>,
    mut reporter: Reporter<'_, W>,
    format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut state_updates = 0_usize;

    let stop_reason = loop {
        if let Some(limit) = max_updates
            && state_updates >= limit
        {
            break ListenStopReason::ReachedLimit(limit);
        }

        let event = tokio::select! {
            event = channels.events.recv() => event,
            interrupted = &mut ctrl_c => {
                interrupted.map_err(|source| InteractionError::CtrlC { source })?;
                break ListenStopReason::Interrupted;
            }
        };
        let Some(event) = event else {
            break ListenStopReason::SessionEnded;
        };
        if matches!(event, FanEvent::StateChanged { .. }) {
            state_updates += 1;
        }
        reporter.event(&event)?;
    };
    info!(%stop_reason, state_updates, "listen stopped");

    let summary = ListenSummary {
        event: "stopped",
        stop_reason,
        state_updates,
    };
    match format {
        OutputFormat::Json => reporter.json(&summary)?,
        OutputFormat::Pretty => {
            let painter = *reporter.painter();
            let reason = match stop_reason {
                ListenStopReason::ReachedLimit(_) => painter.success(stop_reason.to_string()),
                ListenStopReason::Interrupted | ListenStopReason::SessionEnded => {
                    painter.warning(stop_reason.to_string())
                }
            };
            reporter.line(format!(
                "{} {reason} {}",
                painter.heading("Stopped:"),
                painter.value(format!("- received {state_updates} state update(s)"))
            ))?;
        }
    }
    Ok(())
}
