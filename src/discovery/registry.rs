// Registry snapshot parsing
// Reads core.entity_registry and core.config_entries from a controller's storage directory

use super::{DiscoverySource, EntityMapping, IntegrationRecord};
use crate::error::{MedicError, MedicResult};
use crate::healing::BreakerState;
use crate::state::entity_domain;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const ENTITY_REGISTRY_FILE: &str = "core.entity_registry";
pub const CONFIG_ENTRIES_FILE: &str = "core.config_entries";

#[derive(Debug, Deserialize)]
struct StorageFile<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct EntityRegistryData {
    #[serde(default)]
    entities: Vec<RegistryEntity>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntity {
    entity_id: String,

    #[serde(default)]
    config_entry_id: Option<String>,

    #[serde(default)]
    device_id: Option<String>,

    #[serde(default)]
    platform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigEntriesData {
    #[serde(default)]
    entries: Vec<ConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    entry_id: String,
    domain: String,

    #[serde(default)]
    title: Option<String>,
}

/// Exact entity to config-entry links read from a registry snapshot
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub integrations: Vec<IntegrationRecord>,
    pub mappings: Vec<EntityMapping>,
}

fn read_storage<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> MedicResult<T> {
    let path = dir.join(name);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| MedicError::Discovery(format!("cannot read {}: {e}", path.display())))?;
    let file: StorageFile<T> = serde_json::from_str(&raw)
        .map_err(|e| MedicError::Discovery(format!("cannot parse {}: {e}", path.display())))?;
    Ok(file.data)
}

/// Parse both registry files under `dir`
///
/// Entities without a config entry are skipped; entries referenced by an
/// entity but missing from the config entry list still get a record.
pub fn load_snapshot(dir: &Path) -> MedicResult<RegistrySnapshot> {
    let registry: EntityRegistryData = read_storage(dir, ENTITY_REGISTRY_FILE)?;
    let entries: ConfigEntriesData = read_storage(dir, CONFIG_ENTRIES_FILE)?;

    let mut records: BTreeMap<String, IntegrationRecord> = entries
        .entries
        .into_iter()
        .map(|entry| {
            let record = IntegrationRecord {
                title: entry.title.unwrap_or_else(|| entry.domain.clone()),
                entry_id: entry.entry_id.clone(),
                domain: entry.domain,
                entity_ids: BTreeSet::new(),
                source: DiscoverySource::Registry,
                breaker: BreakerState::default(),
            };
            (entry.entry_id, record)
        })
        .collect();

    let mut mappings = Vec::new();
    for entity in registry.entities {
        let Some(entry_id) = entity.config_entry_id else {
            continue;
        };

        let record = records.entry(entry_id.clone()).or_insert_with(|| IntegrationRecord {
            entry_id: entry_id.clone(),
            domain: entity
                .platform
                .clone()
                .unwrap_or_else(|| entity_domain(&entity.entity_id).to_string()),
            title: entry_id.clone(),
            entity_ids: BTreeSet::new(),
            source: DiscoverySource::Registry,
            breaker: BreakerState::default(),
        });
        record.entity_ids.insert(entity.entity_id.clone());

        mappings.push(EntityMapping {
            entity_id: entity.entity_id,
            entry_id,
            device_id: entity.device_id,
            source: DiscoverySource::Registry,
        });
    }

    // Entries that own nothing are not remediation targets
    let integrations = records
        .into_values()
        .filter(|record| !record.entity_ids.is_empty())
        .collect();

    Ok(RegistrySnapshot {
        integrations,
        mappings,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;
    use std::path::Path;

    /// Write a minimal two-entry registry snapshot
    pub fn write_registry(dir: &Path) {
        let registry = json!({
            "version": 1,
            "key": "core.entity_registry",
            "data": {"entities": [
                {"entity_id": "light.kitchen", "config_entry_id": "hue01", "device_id": "dev-kitchen", "platform": "hue"},
                {"entity_id": "light.hall", "config_entry_id": "hue01", "device_id": "dev-hall", "platform": "hue"},
                {"entity_id": "sensor.power", "config_entry_id": "shelly7", "device_id": null, "platform": "shelly"},
                {"entity_id": "sun.sun", "config_entry_id": null, "platform": "sun"}
            ]}
        });
        let entries = json!({
            "version": 1,
            "key": "core.config_entries",
            "data": {"entries": [
                {"entry_id": "hue01", "domain": "hue", "title": "Hue Bridge"},
                {"entry_id": "shelly7", "domain": "shelly", "title": "Shelly Plug"},
                {"entry_id": "unused", "domain": "met", "title": "Weather"}
            ]}
        });
        std::fs::write(dir.join(super::ENTITY_REGISTRY_FILE), registry.to_string()).unwrap();
        std::fs::write(dir.join(super::CONFIG_ENTRIES_FILE), entries.to_string()).unwrap();
    }
}
