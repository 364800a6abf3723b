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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaRocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaRocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config was not installed: {}", path.display()))
}

pub fn init_from_env_or_default() -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaRocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("novarocks.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAROCKS_CONFIG or create ./novarocks.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaRocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novarocks_schema_change=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Append log lines to this file instead of stderr.
    /// `$NOVAROCKS_LOG_FILE` overrides it.
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub schema_change: SchemaChangeConfig,
}

impl NovaRocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaRocksConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        cfg.schema_change.validate()?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(self.log_level.as_str())
    }
}

impl Default for NovaRocksConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            log_file: None,
            schema_change: SchemaChangeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchemaChangeConfig {
    /// Byte budget of the in-memory sort buffer used by sorting schema change.
    #[serde(default = "default_memory_limitation_per_thread_for_schema_change_bytes")]
    pub memory_limitation_per_thread_for_schema_change_bytes: usize,
    /// Rows held by the sort buffer before a run is flushed. 0 means unbounded.
    #[serde(default)]
    pub schema_change_sort_max_buffered_rows: usize,
    #[serde(default = "default_schema_change_batch_size")]
    pub schema_change_batch_size: usize,
    #[serde(default = "default_be_exec_version")]
    pub be_exec_version: i32,
}

fn default_memory_limitation_per_thread_for_schema_change_bytes() -> usize {
    2 * 1024 * 1024 * 1024
}

fn default_schema_change_batch_size() -> usize {
    4096
}

fn default_be_exec_version() -> i32 {
    5
}

impl SchemaChangeConfig {
    fn validate(&self) -> Result<()> {
        if self.memory_limitation_per_thread_for_schema_change_bytes == 0 {
            return Err(anyhow!(
                "schema_change.memory_limitation_per_thread_for_schema_change_bytes must be positive"
            ));
        }
        if self.schema_change_batch_size == 0 {
            return Err(anyhow!(
                "schema_change.schema_change_batch_size must be positive"
            ));
        }
        Ok(())
    }
}

impl Default for SchemaChangeConfig {
    fn default() -> Self {
        Self {
            memory_limitation_per_thread_for_schema_change_bytes:
                default_memory_limitation_per_thread_for_schema_change_bytes(),
            schema_change_sort_max_buffered_rows: 0,
            schema_change_batch_size: default_schema_change_batch_size(),
            be_exec_version: default_be_exec_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::NovaRocksConfig;

    #[test]
    fn test_schema_change_defaults() {
        let cfg: NovaRocksConfig = toml::from_str(
            r#"
[schema_change]
"#,
        )
        .expect("parse config");
        assert_eq!(
            cfg.schema_change
                .memory_limitation_per_thread_for_schema_change_bytes,
            2_147_483_648
        );
        assert_eq!(cfg.schema_change.schema_change_sort_max_buffered_rows, 0);
        assert_eq!(cfg.schema_change.schema_change_batch_size, 4096);
        assert_eq!(cfg.schema_change.be_exec_version, 5);
    }

    #[test]
    fn test_schema_change_can_be_overridden() {
        let cfg: NovaRocksConfig = toml::from_str(
            r#"
log_level = "debug"

[schema_change]
memory_limitation_per_thread_for_schema_change_bytes = 1048576
schema_change_sort_max_buffered_rows = 500
be_exec_version = 2
"#,
        )
        .expect("parse config");
        assert_eq!(
            cfg.schema_change
                .memory_limitation_per_thread_for_schema_change_bytes,
            1_048_576
        );
        assert_eq!(cfg.schema_change.schema_change_sort_max_buffered_rows, 500);
        assert_eq!(cfg.schema_change.be_exec_version, 2);
        assert_eq!(cfg.effective_log_filter(), "debug");
    }

    #[test]
    fn test_log_filter_takes_precedence() {
        let cfg: NovaRocksConfig = toml::from_str(
            r#"
log_level = "info"
log_filter = "novarocks_schema_change=trace"
log_file = "log/be.INFO"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.effective_log_filter(), "novarocks_schema_change=trace");
        assert_eq!(cfg.log_file.as_deref(), Some("log/be.INFO"));
    }

    #[test]
    fn test_load_rejects_zero_budget() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[schema_change]\nmemory_limitation_per_thread_for_schema_change_bytes = 0"
        )
        .expect("write config");
        let err = NovaRocksConfig::load_from_file(file.path()).expect_err("zero budget");
        assert!(
            err.to_string().contains("must be positive"),
            "err={}",
            err
        );
    }
}
