use eyre::{eyre, WrapErr};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use peelscope_core::{SourceState, SourceTier};

/// Envelope printed to stdout for every command.
#[derive(Debug, Serialize)]
pub struct Report<'a, T: Serialize> {
    pub command: &'a str,
    pub generated_at: String,
    /// Source that was authoritative when the command finished.
    pub authoritative_source: SourceTier,
    pub degraded: bool,
    pub result: T,
}

pub fn render<T: Serialize>(command: &str, state: SourceState, result: T) -> eyre::Result<String> {
    let report = Report {
        command,
        generated_at: format_unix(now_unix()?)?,
        authoritative_source: state.authoritative,
        degraded: state.is_degraded(),
        result,
    };
    serde_json::to_string_pretty(&report).wrap_err("serialize command output")
}

/// RFC 3339 rendering of a unix timestamp.
pub fn format_unix(secs: u64) -> eyre::Result<String> {
    let secs = i64::try_from(secs).wrap_err("timestamp out of range")?;
    OffsetDateTime::from_unix_timestamp(secs)
        .wrap_err("timestamp out of range")?
        .format(&Rfc3339)
        .map_err(|e| eyre!("format timestamp: {e}"))
}

fn now_unix() -> eyre::Result<u64> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    u64::try_from(now).wrap_err("system clock before unix epoch")
}
