//! Per-agent database settings.

use crate::error::{DbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SETTINGS_DIR: &str = "data/db/agent_settings";

/// Tables an agent wants described in its system message. Empty means all.
///
/// Each table appears once, in the order it was first listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDbSettings {
    #[serde(default, deserialize_with = "unique_tables")]
    pub enabled_tables: Vec<String>,
}

impl AgentDbSettings {
    pub fn with_tables(tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            enabled_tables: dedup_tables(tables.into_iter().map(Into::into)),
        }
    }
}

/// Drop repeated names, keeping the first occurrence
pub fn dedup_tables(tables: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tables
        .into_iter()
        .filter(|table| seen.insert(table.clone()))
        .collect()
}

fn unique_tables<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(dedup_tables(Vec::<String>::deserialize(deserializer)?))
}

/// Where agent settings live. Provided by the host.
pub trait SettingsStore: Send + Sync {
    /// Settings for `agent`; defaults when none were saved
    fn load(&self, agent: &str) -> Result<AgentDbSettings>;

    fn save(&self, agent: &str, settings: &AgentDbSettings) -> Result<()>;
}

fn check_agent_name(agent: &str) -> Result<()> {
    let bad = agent.is_empty()
        || agent == "."
        || agent == ".."
        || agent.contains(['/', '\\', '\0']);
    if bad {
        return Err(DbError::Validation(format!("invalid agent name '{}'", agent)));
    }
    Ok(())
}

/// One pretty-printed JSON file per agent under a directory
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, agent: &str) -> Result<PathBuf> {
        check_agent_name(agent)?;
        Ok(self.dir.join(format!("{}.json", agent)))
    }
}

impl Default for JsonSettingsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SETTINGS_DIR)
    }
}

impl SettingsStore for JsonSettingsStore {
    /// A missing file means defaults. So does an unreadable one, with a warning,
    /// so a corrupt file never blocks an agent turn.
    fn load(&self, agent: &str) -> Result<AgentDbSettings> {
        let path = self.path_for(agent)?;
        if !path.exists() {
            debug!(agent = %agent, "no saved db settings");
            return Ok(AgentDbSettings::default());
        }

        let parsed = std::fs::read_to_string(&path)
            .map_err(DbError::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(DbError::from));

        match parsed {
            Ok(settings) => Ok(settings),
            Err(err) => {
                warn!(agent = %agent, path = %path.display(), error = %err, "ignoring unreadable db settings");
                Ok(AgentDbSettings::default())
            }
        }
    }

    fn save(&self, agent: &str, settings: &AgentDbSettings) -> Result<()> {
        let path = self.path_for(agent)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;
        debug!(agent = %agent, tables = settings.enabled_tables.len(), "saved db settings");
        Ok(())
    }
}

/// Settings kept in process memory
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    agents: RwLock<HashMap<String, AgentDbSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self, agent: &str) -> Result<AgentDbSettings> {
        check_agent_name(agent)?;
        Ok(self.agents.read().get(agent).cloned().unwrap_or_default())
    }

    fn save(&self, agent: &str, settings: &AgentDbSettings) -> Result<()> {
        check_agent_name(agent)?;
        self.agents.write().insert(agent.to_string(), settings.clone());
        Ok(())
    }
}
