// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide `tracing` subscriber writing glog-style lines.
//!
//! Lines go to the file named by `$NOVAROCKS_LOG_FILE` or the config's
//! `log_file`, and to stderr when neither is set or the file cannot be opened.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Local};
use tracing::Level;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

struct GlogFormatter;

/// `Lyyyymmdd hh:mm:ss.uuuuuu thread file:line] `
fn glog_header(level: &Level, now: &DateTime<Local>, thread: u64, file: &str, line: u32) -> String {
    let level_char = match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    };
    format!(
        "{level_char}{} {thread} {file}:{line}] ",
        now.format("%Y%m%d %H:%M:%S%.6f")
    )
}

fn current_thread_number() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse()
        .unwrap_or(0)
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let header = glog_header(
            metadata.level(),
            &Local::now(),
            current_thread_number(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        );
        writer.write_str(&header)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!("failed to create log directory {}: {err}, logging to stderr", parent.display());
        return None;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .inspect_err(|err| {
            eprintln!("failed to open log file {}: {err}, logging to stderr", path.display())
        })
        .ok()
}

/// Install the subscriber once; later calls are no-ops.
pub fn init_with_level(level: &str, log_file: Option<&Path>) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::new(level);
        match log_file.and_then(open_log_file) {
            Some(file) => {
                let _ = tracing_fmt()
                    .with_env_filter(env_filter)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .event_format(GlogFormatter)
                    .try_init();
            }
            None => {
                let _ = tracing_fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::io::stderr)
                    .with_ansi(atty::is(atty::Stream::Stderr))
                    .event_format(GlogFormatter)
                    .try_init();
            }
        }
    });
}

/// Initialize logging from the loaded config, falling back to `info` on stderr
/// when no config file exists.
pub fn init_from_config() {
    let cfg = crate::novarocks_config::config().ok();
    let filter = cfg.map_or("info", |cfg| cfg.effective_log_filter());
    let log_file = std::env::var("NOVAROCKS_LOG_FILE")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| cfg.and_then(|cfg| cfg.log_file.clone()));
    init_with_level(filter, log_file.as_deref().map(Path::new));
}

pub use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_follows_glog_layout() {
        let now = Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("local time");
        assert_eq!(
            glog_header(&Level::WARN, &now, 42, "src/olap/tablet.rs", 120),
            "W20240309 07:05:01.000000 42 src/olap/tablet.rs:120] "
        );
    }

    #[test]
    fn unwritable_log_file_falls_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(open_log_file(dir.path()).is_none());
        assert!(open_log_file(&dir.path().join("be.log")).is_some());
    }
}
