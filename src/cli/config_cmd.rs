use std::io;

use anyhow::Result;
use serde::Serialize;

use crate::cli::{OutputFormat, RuntimeSettings};
use crate::config::ConfigSummary;

use super::report::Reporter;
use super::ui::ConfigView;

#[derive(Serialize)]
struct ConfigRecord<'a> {
    event: &'static str,
    target: String,
    #[serde(flatten)]
    config: &'a ConfigSummary,
}

/// Executes the `config` command.
pub(crate) fn run<W>(
    settings: &RuntimeSettings,
    mut reporter: Reporter<'_, W>,
    format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let summary = settings.config().summary();
    match format {
        OutputFormat::Json => reporter.json(&ConfigRecord {
            event: "config",
            target: settings.target().to_string(),
            config: &summary,
        })?,
        OutputFormat::Pretty => {
            let painter = *reporter.painter();
            reporter.line(ConfigView::new(&summary, settings.target(), &painter).to_string())?;
        }
    }
    Ok(())
}
