use std::io;

use serde::Serialize;
use time::OffsetDateTime;

use crate::cli::OutputFormat;
use crate::hw::FanEvent;
use crate::utils::format_timestamp;

use super::ui::{EventView, Painter};

#[derive(Serialize)]
struct Timestamped<'a, T: Serialize> {
    timestamp: String,
    #[serde(flatten)]
    record: &'a T,
}

/// Writes session events in the selected output format.
pub(crate) struct Reporter<'a, W> {
    out: &'a mut W,
    format: OutputFormat,
    painter: Painter,
}

impl<'a, W> Reporter<'a, W>
where
    W: io::Write,
{
    pub(crate) fn new(out: &'a mut W, format: OutputFormat, painter: Painter) -> Self {
        Self {
            out,
            format,
            painter,
        }
    }

    pub(crate) fn painter(&self) -> &Painter {
        &self.painter
    }

    pub(crate) fn event(&mut self, event: &FanEvent) -> io::Result<()> {
        match self.format {
            OutputFormat::Pretty => writeln!(self.out, "{}", EventView::new(event, &self.painter)),
            OutputFormat::Json => self.json(event),
        }
    }

    /// Writes one timestamped JSON object on its own line.
    pub(crate) fn json<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        let line = Timestamped {
            timestamp: format_timestamp(OffsetDateTime::now_utc()),
            record,
        };
        serde_json::to_writer(&mut *self.out, &line)?;
        writeln!(self.out)
    }

    pub(crate) fn line(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        writeln!(self.out, "{}", text.as_ref())
    }
}
