//! Provenance of the runs whose records a tree holds.
//!
//! Entry `i` describes run index `i`. Entries are stored as JSON attributes
//! `run0`, `run1`, … of the `experiment_info` group.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{ATTR_RUN_COUNT, EXPERIMENT_INFO_GROUP};
use crate::container::ContainerFile;
use crate::errors::{BoxResult, BoxTreeError};

/// Metadata of one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunInfo {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl RunInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn run_key(index: usize) -> String {
    format!("run{}", index)
}

/// Writes every entry and the run count
pub(crate) fn save_runs(container: &mut ContainerFile, runs: &[RunInfo]) -> BoxResult<()> {
    container.require_group(EXPERIMENT_INFO_GROUP)?;
    for (i, run) in runs.iter().enumerate() {
        container.set_attribute(EXPERIMENT_INFO_GROUP, &run_key(i), serde_json::to_string(run)?)?;
    }
    container.set_attribute(EXPERIMENT_INFO_GROUP, ATTR_RUN_COUNT, runs.len().to_string())
}

/// Reads the stored entries.
///
/// Incomplete provenance does not fail the load: a missing or unreadable
/// entry is replaced by an empty one named after its key, so run indices
/// keep pointing at the right slot.
pub(crate) fn load_runs(container: &ContainerFile) -> BoxResult<Vec<RunInfo>> {
    if !container.has_group(EXPERIMENT_INFO_GROUP) {
        return Ok(Vec::new());
    }
    let count = match container.attribute(EXPERIMENT_INFO_GROUP, ATTR_RUN_COUNT) {
        Some(value) => value.parse::<usize>().map_err(|_| {
            BoxTreeError::FormatMismatch(format!(
                "attribute '{}' of '{}' is not a count: {}",
                ATTR_RUN_COUNT, EXPERIMENT_INFO_GROUP, value
            ))
        })?,
        None => {
            log::warn!(
                "Group '{}' has no '{}' attribute, run provenance ignored",
                EXPERIMENT_INFO_GROUP,
                ATTR_RUN_COUNT
            );
            return Ok(Vec::new());
        }
    };

    let mut runs = Vec::with_capacity(count);
    for i in 0..count {
        let key = run_key(i);
        let run = match container.attribute(EXPERIMENT_INFO_GROUP, &key) {
            Some(text) => match serde_json::from_str::<RunInfo>(text) {
                Ok(run) => run,
                Err(e) => {
                    log::warn!("Run entry '{}' is unreadable ({}), using an empty entry", key, e);
                    RunInfo::new(key)
                }
            },
            None => {
                log::warn!("Run entry '{}' is missing, using an empty entry", key);
                RunInfo::new(key)
            }
        };
        runs.push(run);
    }

    if container.attribute(EXPERIMENT_INFO_GROUP, &run_key(count)).is_some() {
        log::warn!(
            "Group '{}' holds entries past its run count {}, extra entries ignored",
            EXPERIMENT_INFO_GROUP,
            count
        );
    }
    Ok(runs)
}
