use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Per-stage pool and queue sizing.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StageFile {
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub mem_capacity: Option<usize>,
    pub high_watermark: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct ConfigFile {
    #[serde(alias = "urls")]
    pub targets: Option<Vec<String>>,
    pub input_file: Option<String>,
    pub scope: Option<Vec<String>>,
    pub max_depth: Option<u32>,
    pub plugins: Option<Vec<String>>,

    pub rate: Option<u32>,
    pub workers: Option<usize>,
    pub pool_size: Option<usize>,
    pub max_requests_per_connection: Option<u32>,
    pub idle_connection_timeout_s: Option<u64>,
    pub request_timeout_s: Option<u64>,
    pub timeout_floor_ms: Option<u64>,
    pub timeout_ceiling_ms: Option<u64>,
    pub max_body_bytes: Option<usize>,
    pub proxy: Option<String>,
    pub header: Option<String>,
    pub follow_redirects: Option<bool>,

    pub crawl: Option<StageFile>,
    pub audit: Option<StageFile>,
    pub grep: Option<StageFile>,
    pub output_stage: Option<StageFile>,
    pub grep_low_watermark: Option<usize>,
    pub grep_high_watermark: Option<usize>,
    pub spill_dir: Option<String>,
    pub plugin_timeout_s: Option<u64>,
    pub shutdown_grace_s: Option<u64>,
    pub resize_interval_ms: Option<u64>,

    pub parser_workers: Option<usize>,
    pub parser_memory_limit_mb: Option<u64>,
    pub parser_timeout_s: Option<u64>,
    pub parser_max_tasks: Option<u32>,

    pub max_findings_per_plugin: Option<usize>,
    pub output: Option<String>,
    pub output_format: Option<String>,
    pub events: Option<String>,
    pub no_color: Option<bool>,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .or_else(|| {
            let drive = env::var_os("HOMEDRIVE")?;
            let path = env::var_os("HOMEPATH")?;
            Some(PathBuf::from(drive).join(path))
        })
}

pub fn default_config_path() -> Option<PathBuf> {
    Some(home_dir()?.join(".scanline").join("config.yml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn load_config(path: &PathBuf, allow_missing: bool) -> Result<ConfigFile, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str::<ConfigFile>(&contents)
            .map_err(|e| format!("failed to parse config '{}': {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && allow_missing => {
            Ok(ConfigFile::default())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("config file not found '{}'", path.display()))
        }
        Err(e) => Err(format!("failed to read config '{}': {e}", path.display())),
    }
}

pub fn default_config_yaml() -> String {
    r#"# scanline config
#
# Location (default):
#   ~/.scanline/config.yml

# Targets (choose at least one)
# targets:
#   - https://example.com/
# input_file: ./targets.txt
# scope: [example.com]
max_depth: 10
# plugins: [web_spider, reflected_input, error_pages]

# HTTP
rate: 0
pool_size: 50
max_requests_per_connection: 100
idle_connection_timeout_s: 30
request_timeout_s: 10
timeout_floor_ms: 2000
timeout_ceiling_ms: 60000
max_body_bytes: 2097152
# proxy: http://127.0.0.1:8080
# header: "Key: Value"
follow_redirects: false

# Stages
crawl:
  min_workers: 4
  max_workers: 20
  mem_capacity: 1000
audit:
  min_workers: 4
  max_workers: 20
  mem_capacity: 1000
grep:
  min_workers: 2
  max_workers: 10
  mem_capacity: 1000
output_stage:
  min_workers: 1
  max_workers: 2
grep_low_watermark: 500
grep_high_watermark: 2000
# spill_dir: /tmp/scanline
plugin_timeout_s: 60
shutdown_grace_s: 5
resize_interval_ms: 500

# Parser processes
parser_memory_limit_mb: 128
parser_timeout_s: 10
parser_max_tasks: 20

# Output
max_findings_per_plugin: 10
# output: ./report.json
# output_format: json
# events: ./events.jsonl
no_color: false
"#
    .to_string()
}

pub fn ensure_default_config_file(path: &PathBuf) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }
    let parent = path
        .parent()
        .ok_or_else(|| format!("invalid config path '{}'", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| {
        format!(
            "failed to create config directory '{}': {e}",
            parent.display()
        )
    })?;
    std::fs::write(path, default_config_yaml())
        .map_err(|e| format!("failed to write config file '{}': {e}", path.display()))?;
    Ok(())
}
