use std::fmt::{self, Display, Formatter};

use crate::config::ConfigSummary;
use crate::hw::DeviceTarget;

use super::painter::Painter;

/// Renders the effective configuration as aligned `field value` lines.
pub(crate) struct ConfigView<'a> {
    summary: &'a ConfigSummary,
    target: &'a DeviceTarget,
    painter: &'a Painter,
}

impl<'a> ConfigView<'a> {
    pub(crate) fn new(
        summary: &'a ConfigSummary,
        target: &'a DeviceTarget,
        painter: &'a Painter,
    ) -> Self {
        Self {
            summary,
            target,
            painter,
        }
    }
}

impl Display for ConfigView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let summary = self.summary;
        let rows = [
            ("target", self.target.to_string()),
            ("key_fingerprint", summary.key_fingerprint.clone()),
            ("optimistic", summary.optimistic.to_string()),
            ("ack_timeout", summary.ack_timeout.clone()),
            ("max_retries", summary.max_retries.to_string()),
            ("degraded_threshold", summary.degraded_threshold.to_string()),
            ("handshake_timeout", summary.handshake_timeout.clone()),
            ("tick_interval", summary.tick_interval.clone()),
            ("reconnect_backoff", summary.reconnect_backoff.clone()),
            (
                "reconnect_max_attempts",
                summary
                    .reconnect_max_attempts
                    .map_or_else(|| "unlimited".to_string(), |max| max.to_string()),
            ),
        ];
        let width = rows.iter().map(|(field, _)| field.len()).max().unwrap_or(0);

        write!(f, "{}", self.painter.heading("Configuration:"))?;
        for (field, value) in rows {
            write!(
                f,
                "\n  {} {}",
                self.painter.muted(format!("{field:<width$}")),
                self.painter.value(value)
            )?;
        }
        Ok(())
    }
}
