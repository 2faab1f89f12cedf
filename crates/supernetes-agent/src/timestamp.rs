//! Line timestamping
//!
//! The `timestamp` subcommand prepends an RFC 3339 timestamp to every stdin
//! line; the workload-side sbatch pipeline runs all container output through
//! it, producing the `<timestamp> <line>` format that log streaming parses
//! back apart.

use std::io::{BufRead, Write};

use chrono::{DateTime, Local, SecondsFormat, Utc};
use supernetes_common::{Error, Result};
use tracing::warn;

/// Run the stdin line timestamper until EOF
pub fn run() -> Result<()> {
    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lines() {
        let line = line.map_err(|e| Error::internal("timestamp", format!("failed to scan stdin: {e}")))?;
        writeln!(
            stdout,
            "{} {}",
            Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            line
        )?;
    }

    Ok(())
}

/// Split a timestamped log line into its timestamp and content.
///
/// Lines without a parseable timestamp are passed through whole with a zero
/// timestamp.
pub fn split_line(line: &[u8]) -> (Option<DateTime<Utc>>, &[u8]) {
    let Some(space) = line.iter().position(|&b| b == b' ') else {
        warn!(line = %String::from_utf8_lossy(line), "log line without timestamp");
        return (None, line);
    };

    let (stamp, rest) = line.split_at(space);
    let content = &rest[1..];

    match std::str::from_utf8(stamp)
        .ok()
        .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
    {
        Some(timestamp) => (Some(timestamp.with_timezone(&Utc)), content),
        None => {
            warn!(
                line = %String::from_utf8_lossy(content),
                "unable to parse timestamp for log line"
            );
            (None, content)
        }
    }
}
