use crate::ranking::{RankingEvaluator, TieBreak, DEFAULT_TIE_BREAKS};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    env,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const CONFIG_PATH_VAR: &str = "BRACKET_ENGINE_CONFIG";
pub const TIE_BREAKS_VAR: &str = "BRACKET_TIE_BREAKS";
pub const LOG_DIR_VAR: &str = "BRACKET_LOG_DIR";
pub const AUDIT_LOG_VAR: &str = "BRACKET_AUDIT_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
  pub tie_breaks: Vec<TieBreak>,
  pub log_dir: Option<PathBuf>,
  pub audit_log: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      tie_breaks: DEFAULT_TIE_BREAKS.to_vec(),
      log_dir: None,
      audit_log: false,
    }
  }
}

impl EngineConfig {
  pub fn evaluator(&self) -> RankingEvaluator {
    RankingEvaluator::new(self.tie_breaks.clone())
  }

  pub fn logs_dir(&self) -> PathBuf {
    match &self.log_dir {
      Some(dir) if dir.is_absolute() => dir.clone(),
      Some(dir) => repo_root().join(dir),
      None => repo_root().join("logs"),
    }
  }

  pub fn audit_log_path(&self) -> PathBuf {
    self.logs_dir().join("resolution_audit.jsonl")
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("read config {}: {source}", path.display())]
  Read { path: PathBuf, source: io::Error },
  #[error("parse config {}: {source}", path.display())]
  Parse { path: PathBuf, source: serde_json::Error },
  #[error("{var}: {reason}")]
  Env { var: &'static str, reason: String },
  #[error("tie-break policy is empty; list at least one rule")]
  EmptyPolicy,
}

pub fn repo_root() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn env_default(key: &str) -> Option<String> {
  env::var(key)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

pub fn flag_value(raw: &str) -> bool {
  let value = raw.trim().to_ascii_lowercase();
  matches!(value.as_str(), "1" | "true" | "yes" | "on")
}

pub fn parse_tie_breaks(raw: &str) -> Result<Vec<TieBreak>, String> {
  let rules = raw
    .split(',')
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .map(str::parse::<TieBreak>)
    .collect::<Result<Vec<_>, _>>()?;
  if rules.is_empty() {
    return Err("no tie-break rules listed".to_string());
  }
  Ok(rules)
}

/// Applies `BRACKET_*` overrides from `lookup`, which returns trimmed,
/// non-empty values only.
pub fn apply_overrides_from(
  mut config: EngineConfig,
  lookup: impl Fn(&str) -> Option<String>,
) -> Result<EngineConfig, ConfigError> {
  if let Some(raw) = lookup(TIE_BREAKS_VAR) {
    config.tie_breaks = parse_tie_breaks(&raw).map_err(|reason| ConfigError::Env { var: TIE_BREAKS_VAR, reason })?;
  }
  if let Some(dir) = lookup(LOG_DIR_VAR) {
    config.log_dir = Some(PathBuf::from(dir));
  }
  if let Some(flag) = lookup(AUDIT_LOG_VAR) {
    config.audit_log = flag_value(&flag);
  }
  Ok(config)
}

pub fn apply_env_overrides(config: EngineConfig) -> Result<EngineConfig, ConfigError> {
  apply_overrides_from(config, env_default)
}

pub fn load_engine_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
  let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let config = serde_json::from_str::<EngineConfig>(&data).map_err(|source| ConfigError::Parse {
    path: path.to_path_buf(),
    source,
  })?;
  if config.tie_breaks.is_empty() {
    return Err(ConfigError::EmptyPolicy);
  }
  Ok(config)
}

/// Explicit path first, then `BRACKET_ENGINE_CONFIG`, then defaults; env
/// overrides apply on top of whichever was found.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
  let from_env = env_default(CONFIG_PATH_VAR).map(PathBuf::from);
  let config = match path.map(Path::to_path_buf).or(from_env) {
    Some(path) => load_engine_config_from(&path)?,
    None => EngineConfig::default(),
  };
  apply_env_overrides(config)
}

/// Variables a `.env` file may set; any other key in it is ignored.
const ENV_FILE_KEYS: [&str; 5] = [CONFIG_PATH_VAR, TIE_BREAKS_VAR, LOG_DIR_VAR, AUDIT_LOG_VAR, "RUST_LOG"];

/// Seeds the resolver's variables from `.env` next to the manifest.
/// Values already present in the environment win.
pub fn load_env_file() {
  let Ok(contents) = fs::read_to_string(repo_root().join(".env")) else {
    return;
  };
  for (key, value) in contents.lines().filter_map(parse_env_line) {
    if ENV_FILE_KEYS.contains(&key) && env::var_os(key).is_none() {
      env::set_var(key, value);
    }
  }
}

/// `KEY=value`, optionally prefixed with `export `. Quoted values are kept
/// verbatim; unquoted ones end at the first `#`.
pub fn parse_env_line(line: &str) -> Option<(&str, &str)> {
  let line = line.trim();
  if line.starts_with('#') {
    return None;
  }
  let (key, value) = line.strip_prefix("export ").unwrap_or(line).split_once('=')?;
  let key = key.trim();
  if key.is_empty() {
    return None;
  }
  let value = value.trim();
  let quoted = ['"', '\''].iter().find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote));
  let value = match quoted {
    Some(inner) => inner,
    None => value.split('#').next().unwrap_or_default().trim_end(),
  };
  Some((key, value))
}

pub fn bracket_configs_dir() -> PathBuf {
  repo_root().join("test_brackets")
}

/// Bare file names resolve inside `test_brackets/`; anything with a
/// directory component is taken relative to the crate root.
pub fn resolve_bracket_path(raw: &str) -> PathBuf {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return bracket_configs_dir().join(crate::types::DEFAULT_BRACKET_FILE);
  }
  let path = PathBuf::from(trimmed);
  if path.is_absolute() {
    return path;
  }
  if trimmed.contains(std::path::MAIN_SEPARATOR) || trimmed.contains('/') {
    return repo_root().join(path);
  }
  bracket_configs_dir().join(path)
}

/// Appends one JSON line to the audit log. Failures are dropped; the audit
/// trail never blocks resolution.
pub fn append_resolution_log(path: &Path, label: &str, payload: &Value) {
  if let Some(dir) = path.parent() {
    if fs::create_dir_all(dir).is_err() {
      return;
    }
  }
  let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
  let entry = json!({ "timestamp": timestamp, "label": label, "payload": payload });
  if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
    let _ = writeln!(file, "{entry}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(key, value)| (key.to_string(), value.to_string()))
      .collect();
    move |key: &str| map.get(key).cloned()
  }

  #[test]
  fn test_parse_env_line() {
    assert_eq!(parse_env_line("# comment"), None);
    assert_eq!(parse_env_line(""), None);
    assert_eq!(
      parse_env_line("export BRACKET_LOG_DIR=\"/tmp/logs\""),
      Some(("BRACKET_LOG_DIR", "/tmp/logs"))
    );
    assert_eq!(
      parse_env_line("BRACKET_AUDIT_LOG=yes # keep a trail"),
      Some(("BRACKET_AUDIT_LOG", "yes"))
    );
    assert_eq!(
      parse_env_line("BRACKET_TIE_BREAKS='wins,#h2h'"),
      Some(("BRACKET_TIE_BREAKS", "wins,#h2h"))
    );
    assert_eq!(parse_env_line("=value"), None);
    assert_eq!(parse_env_line("NO_VALUE"), None);
  }

  #[test]
  fn test_parse_tie_breaks() {
    assert_eq!(
      parse_tie_breaks("wins, pointDiff ,h2h").unwrap(),
      vec![TieBreak::Wins, TieBreak::PointDifferential, TieBreak::HeadToHead]
    );
    assert!(parse_tie_breaks(" , ").is_err());
    assert!(parse_tie_breaks("wins,coin").is_err());
  }

  #[test]
  fn test_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    fs::write(&path, r#"{"tieBreaks":["pointsScored","wins"],"auditLog":true}"#).unwrap();
    let config = load_engine_config_from(&path).unwrap();
    assert_eq!(config.tie_breaks, vec![TieBreak::PointsScored, TieBreak::Wins]);
    assert!(config.audit_log);
    assert_eq!(config.log_dir, None);
    assert_eq!(config.evaluator().policy(), &[TieBreak::PointsScored, TieBreak::Wins]);
  }

  #[test]
  fn test_load_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json");
    assert!(matches!(load_engine_config_from(&missing), Err(ConfigError::Read { .. })));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    let err = load_engine_config_from(&broken).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("broken.json"));

    let empty = dir.path().join("empty.json");
    fs::write(&empty, r#"{"tieBreaks":[]}"#).unwrap();
    assert!(matches!(load_engine_config_from(&empty), Err(ConfigError::EmptyPolicy)));
  }

  #[test]
  fn test_env_overrides() {
    let config = apply_overrides_from(
      EngineConfig::default(),
      lookup(&[
        (TIE_BREAKS_VAR, "wins,pointsScored"),
        (LOG_DIR_VAR, "/var/log/brackets"),
        (AUDIT_LOG_VAR, "on"),
      ]),
    )
    .unwrap();
    assert_eq!(config.tie_breaks, vec![TieBreak::Wins, TieBreak::PointsScored]);
    assert_eq!(config.logs_dir(), PathBuf::from("/var/log/brackets"));
    assert!(config.audit_log);

    let err = apply_overrides_from(EngineConfig::default(), lookup(&[(TIE_BREAKS_VAR, "luck")])).unwrap_err();
    assert!(matches!(err, ConfigError::Env { var: TIE_BREAKS_VAR, .. }));

    let untouched = apply_overrides_from(EngineConfig::default(), lookup(&[])).unwrap();
    assert_eq!(untouched, EngineConfig::default());
  }

  #[test]
  fn test_resolve_bracket_path() {
    assert_eq!(resolve_bracket_path("swiss.json"), bracket_configs_dir().join("swiss.json"));
    assert_eq!(
      resolve_bracket_path(""),
      bracket_configs_dir().join(crate::types::DEFAULT_BRACKET_FILE)
    );
    assert_eq!(resolve_bracket_path("/abs/layout.json"), PathBuf::from("/abs/layout.json"));
    assert_eq!(resolve_bracket_path("demos/layout.json"), repo_root().join("demos/layout.json"));
  }

  #[test]
  fn test_append_resolution_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("audit.jsonl");
    append_resolution_log(&path, "matchDecided", &json!({ "ready": [103] }));
    append_resolution_log(&path, "groupFinalized", &json!({}));
    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = contents
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["label"], "matchDecided");
    assert_eq!(lines[0]["payload"]["ready"][0], 103);
    assert!(lines[1]["timestamp"].as_str().is_some());
  }
}
