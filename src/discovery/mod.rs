// Integration Directory
// Maps entities to remediation targets through a chain of discovery strategies

pub mod registry;

use crate::error::{MedicError, MedicResult};
use crate::healing::BreakerState;
use crate::network::Controller;
use crate::state::entity_domain;
use crate::store::Store;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// Prefix of synthetic per-domain targets
pub const HEURISTIC_PREFIX: &str = "heuristic:";

/// Whether a target id was synthesized by the domain heuristic
pub fn is_heuristic(entry_id: &str) -> bool {
    entry_id.starts_with(HEURISTIC_PREFIX)
}

/// Where a mapping came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Registry,
    Heuristic,
    Manual,
    Persisted,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::Registry => "registry",
            DiscoverySource::Heuristic => "heuristic",
            DiscoverySource::Manual => "manual",
            DiscoverySource::Persisted => "persisted",
        }
    }

    /// A new mapping replaces an existing one only at equal or higher rank
    fn rank(&self) -> u8 {
        match self {
            DiscoverySource::Heuristic => 0,
            DiscoverySource::Persisted => 1,
            DiscoverySource::Registry => 2,
            DiscoverySource::Manual => 3,
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoverySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registry" => Ok(DiscoverySource::Registry),
            "heuristic" => Ok(DiscoverySource::Heuristic),
            "manual" => Ok(DiscoverySource::Manual),
            "persisted" => Ok(DiscoverySource::Persisted),
            other => Err(format!("unknown discovery source {other:?}")),
        }
    }
}

/// Remediation target with its breaker fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub entry_id: String,

    /// Integration domain, e.g. "hue"
    pub domain: String,

    pub title: String,

    pub entity_ids: BTreeSet<String>,

    pub source: DiscoverySource,

    #[serde(default)]
    pub breaker: BreakerState,
}

/// Entity to target link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub entity_id: String,
    pub entry_id: String,
    pub device_id: Option<String>,
    pub source: DiscoverySource,
}

/// Output of one discovery strategy
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub source: DiscoverySource,
    pub integrations: Vec<IntegrationRecord>,
    pub mappings: Vec<EntityMapping>,
}

impl DiscoveryResult {
    fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[derive(Debug, Default)]
struct DirectoryIndex {
    integrations: HashMap<String, IntegrationRecord>,
    entities: HashMap<String, EntityMapping>,
}

/// Per-instance entity to integration directory
///
/// Lookups never regress: discovery results are merged into the index and
/// persisted by upsert, nothing is ever removed.
pub struct IntegrationDirectory {
    instance_id: String,

    /// Storage directory with registry snapshot files
    registry_path: Option<PathBuf>,

    store: Option<Store>,

    index: RwLock<DirectoryIndex>,
}

impl IntegrationDirectory {
    pub fn new(instance_id: impl Into<String>, registry_path: Option<PathBuf>, store: Option<Store>) -> Self {
        Self {
            instance_id: instance_id.into(),
            registry_path,
            store,
            index: RwLock::new(DirectoryIndex::default()),
        }
    }

    /// Warm the index from the store; returns the number of mappings loaded
    pub async fn load_persisted(&self) -> MedicResult<usize> {
        match self.persisted().await? {
            Some(result) => {
                let count = result.mappings.len();
                self.merge(&result);
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Run the strategy chain; the first non-empty result wins
    #[instrument(skip(self, controller), fields(instance = %self.instance_id))]
    pub async fn discover_all(&self, controller: &dyn Controller) -> MedicResult<DiscoveryResult> {
        let mut failures = Vec::new();

        match self.from_registry() {
            Ok(Some(result)) => return Ok(self.accept(result).await),
            Ok(None) => {}
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "registry discovery failed");
                failures.push(e.to_string());
            }
        }

        match self.from_heuristic(controller).await {
            Ok(Some(result)) => return Ok(self.accept(result).await),
            Ok(None) => failures.push("no live entities".to_string()),
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "heuristic discovery failed");
                failures.push(e.to_string());
            }
        }

        match self.persisted().await {
            Ok(Some(result)) => {
                info!(
                    instance = %self.instance_id,
                    mappings = result.mappings.len(),
                    "using persisted integration mappings"
                );
                self.merge(&result);
                return Ok(result);
            }
            Ok(None) => failures.push("nothing persisted".to_string()),
            Err(e) => failures.push(e.to_string()),
        }

        Err(MedicError::Discovery(failures.join("; ")))
    }

    fn from_registry(&self) -> MedicResult<Option<DiscoveryResult>> {
        let Some(path) = &self.registry_path else {
            return Ok(None);
        };

        let snapshot = registry::load_snapshot(path)?;
        let result = DiscoveryResult {
            source: DiscoverySource::Registry,
            integrations: snapshot.integrations,
            mappings: snapshot.mappings,
        };
        Ok((!result.is_empty()).then_some(result))
    }

    async fn from_heuristic(&self, controller: &dyn Controller) -> MedicResult<Option<DiscoveryResult>> {
        let states = controller.get_states().await?;

        let mut by_domain: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for state in &states {
            by_domain
                .entry(entity_domain(&state.entity_id).to_string())
                .or_default()
                .insert(state.entity_id.clone());
        }

        let mut integrations = Vec::with_capacity(by_domain.len());
        let mut mappings = Vec::with_capacity(states.len());
        for (domain, entity_ids) in by_domain {
            let entry_id = format!("{HEURISTIC_PREFIX}{domain}");
            mappings.extend(entity_ids.iter().map(|entity_id| EntityMapping {
                entity_id: entity_id.clone(),
                entry_id: entry_id.clone(),
                device_id: None,
                source: DiscoverySource::Heuristic,
            }));
            integrations.push(IntegrationRecord {
                entry_id,
                title: format!("{domain} (by domain)"),
                domain,
                entity_ids,
                source: DiscoverySource::Heuristic,
                breaker: BreakerState::default(),
            });
        }

        let result = DiscoveryResult {
            source: DiscoverySource::Heuristic,
            integrations,
            mappings,
        };
        Ok((!result.is_empty()).then_some(result))
    }

    async fn persisted(&self) -> MedicResult<Option<DiscoveryResult>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        let instance = self.instance_id.clone();
        let (integrations, mappings) = store
            .run_blocking(move |store| {
                Ok((store.load_integrations(&instance)?, store.load_entity_mappings(&instance)?))
            })
            .await?;

        let result = DiscoveryResult {
            source: DiscoverySource::Persisted,
            integrations,
            mappings,
        };
        Ok((!result.is_empty()).then_some(result))
    }

    /// Merge a fresh result and persist what was merged; store errors are logged
    async fn accept(&self, result: DiscoveryResult) -> DiscoveryResult {
        let (records, mappings) = self.merge(&result);
        info!(
            instance = %self.instance_id,
            source = %result.source,
            integrations = result.integrations.len(),
            mappings = result.mappings.len(),
            "integration discovery complete"
        );

        if let Some(store) = &self.store {
            let instance = self.instance_id.clone();
            let persisted = store
                .run_blocking(move |store| store.merge_discovery(&instance, &records, &mappings))
                .await;
            if let Err(e) = persisted {
                warn!(instance = %self.instance_id, error = %e, "failed to persist discovery");
            }
        }

        result
    }

    /// Upsert records and mappings
    ///
    /// Returns the merged state of every touched record and the mappings
    /// actually applied, which is what gets persisted.
    fn merge(&self, result: &DiscoveryResult) -> (Vec<IntegrationRecord>, Vec<EntityMapping>) {
        let mut index = self.index.write();

        for record in &result.integrations {
            match index.integrations.get_mut(&record.entry_id) {
                Some(existing) => {
                    existing.domain = record.domain.clone();
                    existing.title = record.title.clone();
                    existing.entity_ids.extend(record.entity_ids.iter().cloned());
                    if record.source.rank() >= existing.source.rank() {
                        existing.source = record.source;
                    }
                }
                None => {
                    index.integrations.insert(record.entry_id.clone(), record.clone());
                }
            }
        }

        let mut applied = Vec::with_capacity(result.mappings.len());
        for mapping in &result.mappings {
            let replace = index
                .entities
                .get(&mapping.entity_id)
                .map_or(true, |existing| mapping.source.rank() >= existing.source.rank());
            if !replace {
                debug!(entity_id = %mapping.entity_id, "keeping higher-ranked mapping");
                continue;
            }

            let mut mapping = mapping.clone();
            if mapping.device_id.is_none() {
                mapping.device_id = index
                    .entities
                    .get(&mapping.entity_id)
                    .and_then(|existing| existing.device_id.clone());
            }
            index.entities.insert(mapping.entity_id.clone(), mapping.clone());
            applied.push(mapping);
        }

        let records = result
            .integrations
            .iter()
            .filter_map(|record| index.integrations.get(&record.entry_id).cloned())
            .collect();
        (records, applied)
    }

    /// Pin an entity to a target; persisted before it becomes visible
    pub async fn add_manual_mapping(&self, entity_id: &str, entry_id: &str) -> MedicResult<()> {
        let record = {
            let index = self.index.read();
            let mut record = index.integrations.get(entry_id).cloned().unwrap_or_else(|| IntegrationRecord {
                entry_id: entry_id.to_string(),
                domain: entity_domain(entity_id).to_string(),
                title: entry_id.to_string(),
                entity_ids: BTreeSet::new(),
                source: DiscoverySource::Manual,
                breaker: BreakerState::default(),
            });
            record.entity_ids.insert(entity_id.to_string());
            record
        };
        let mapping = EntityMapping {
            entity_id: entity_id.to_string(),
            entry_id: entry_id.to_string(),
            device_id: self.device_for_entity(entity_id),
            source: DiscoverySource::Manual,
        };

        if let Some(store) = &self.store {
            let instance = self.instance_id.clone();
            let (r, m) = (record.clone(), mapping.clone());
            store
                .run_blocking(move |store| store.merge_discovery(&instance, &[r], &[m]))
                .await?;
        }

        self.merge(&DiscoveryResult {
            source: DiscoverySource::Manual,
            integrations: vec![record],
            mappings: vec![mapping],
        });
        info!(instance = %self.instance_id, %entity_id, %entry_id, "manual mapping added");
        Ok(())
    }

    /// Target owning an entity
    pub fn integration_for_entity(&self, entity_id: &str) -> Option<IntegrationRecord> {
        let index = self.index.read();
        let mapping = index.entities.get(entity_id)?;
        index.integrations.get(&mapping.entry_id).cloned()
    }

    pub fn mapping_for_entity(&self, entity_id: &str) -> Option<EntityMapping> {
        self.index.read().entities.get(entity_id).cloned()
    }

    pub fn device_for_entity(&self, entity_id: &str) -> Option<String> {
        self.index
            .read()
            .entities
            .get(entity_id)
            .and_then(|m| m.device_id.clone())
    }

    /// Look up a target by id
    pub fn resolve(&self, entry_id: &str) -> Option<IntegrationRecord> {
        self.index.read().integrations.get(entry_id).cloned()
    }

    pub fn integrations(&self) -> Vec<IntegrationRecord> {
        let mut records: Vec<_> = self.index.read().integrations.values().cloned().collect();
        records.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        records
    }

    pub fn mapping_count(&self) -> usize {
        self.index.read().entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeController;

    #[tokio::test]
    async fn test_registry_snapshot_wins() {
        let dir = tempfile::tempdir().unwrap();
        registry::fixtures::write_registry(dir.path());
        let controller = FakeController::with_entities(&["light.kitchen", "switch.pump"]);

        let directory = IntegrationDirectory::new("home", Some(dir.path().to_path_buf()), None);
        let result = directory.discover_all(&controller).await.unwrap();

        assert_eq!(result.source, DiscoverySource::Registry);
        assert_eq!(directory.integration_for_entity("light.kitchen").unwrap().entry_id, "hue01");
        assert_eq!(directory.device_for_entity("light.hall").as_deref(), Some("dev-hall"));
        assert!(directory.integration_for_entity("switch.pump").is_none());
    }

    #[tokio::test]
    async fn test_heuristic_groups_by_domain() {
        let controller = FakeController::with_entities(&[
            "light.kitchen",
            "light.hall",
            "sensor.power",
            "sensor.temp",
            "sensor.humidity",
            "switch.pump",
        ]);
        let directory = IntegrationDirectory::new("home", None, None);
        let result = directory.discover_all(&controller).await.unwrap();

        assert_eq!(result.source, DiscoverySource::Heuristic);
        assert_eq!(result.mappings.len(), 6);
        assert_eq!(result.integrations.len(), 3);
        let target = directory.integration_for_entity("sensor.temp").unwrap();
        assert_eq!(target.entry_id, "heuristic:sensor");
        assert!(is_heuristic(&target.entry_id));
    }

    #[tokio::test]
    async fn test_unreadable_registry_falls_back_to_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FakeController::with_entities(&["light.kitchen"]);
        let directory = IntegrationDirectory::new("home", Some(dir.path().to_path_buf()), None);

        let result = directory.discover_all(&controller).await.unwrap();
        assert_eq!(result.source, DiscoverySource::Heuristic);
    }

    #[tokio::test]
    async fn test_persisted_fallback_and_explicit_error() {
        let store = Store::open_in_memory().unwrap();
        let controller = FakeController::with_entities(&["light.kitchen"]);

        let first = IntegrationDirectory::new("home", None, Some(store.clone()));
        first.discover_all(&controller).await.unwrap();

        // Controller unreachable and no registry: last persisted result is used
        let offline = FakeController::default();
        offline.fail_states(true);
        let second = IntegrationDirectory::new("home", None, Some(store.clone()));
        let result = second.discover_all(&offline).await.unwrap();
        assert_eq!(result.source, DiscoverySource::Persisted);
        assert_eq!(
            second.integration_for_entity("light.kitchen").unwrap().entry_id,
            "heuristic:light"
        );

        // Another instance sharing the store has nothing persisted
        let other = IntegrationDirectory::new("cabin", None, Some(store));
        let err = other.discover_all(&offline).await.unwrap_err();
        assert!(matches!(err, MedicError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_never_regresses_to_coarser_mapping() {
        let dir = tempfile::tempdir().unwrap();
        registry::fixtures::write_registry(dir.path());
        let controller = FakeController::with_entities(&["light.kitchen"]);

        let directory = IntegrationDirectory::new("home", Some(dir.path().to_path_buf()), None);
        directory.discover_all(&controller).await.unwrap();

        // Heuristic result does not displace the exact registry mapping
        let heuristic = directory.from_heuristic(&controller).await.unwrap().unwrap();
        directory.merge(&heuristic);
        assert_eq!(directory.integration_for_entity("light.kitchen").unwrap().entry_id, "hue01");
    }

    #[tokio::test]
    async fn test_persisted_records_accumulate_entities() {
        let store = Store::open_in_memory().unwrap();
        let directory = IntegrationDirectory::new("home", None, Some(store.clone()));

        directory
            .discover_all(&FakeController::with_entities(&["light.kitchen"]))
            .await
            .unwrap();
        directory
            .discover_all(&FakeController::with_entities(&["light.hall"]))
            .await
            .unwrap();

        let in_memory = directory.resolve("heuristic:light").unwrap();
        let persisted = store.load_integration("home", "heuristic:light").unwrap().unwrap();
        assert_eq!(persisted.entity_ids, in_memory.entity_ids);
        assert_eq!(persisted.entity_ids.len(), 2);

        // A restart sees the same directory
        let restored = IntegrationDirectory::new("home", None, Some(store));
        assert_eq!(restored.load_persisted().await.unwrap(), 2);
        assert_eq!(restored.resolve("heuristic:light").unwrap().entity_ids, in_memory.entity_ids);
    }

    #[tokio::test]
    async fn test_manual_mapping_is_persisted_and_visible() {
        let store = Store::open_in_memory().unwrap();
        let directory = IntegrationDirectory::new("home", None, Some(store.clone()));

        directory.add_manual_mapping("sensor.garage", "zwave42").await.unwrap();
        let record = directory.integration_for_entity("sensor.garage").unwrap();
        assert_eq!(record.entry_id, "zwave42");
        assert_eq!(record.source, DiscoverySource::Manual);

        let restored = IntegrationDirectory::new("home", None, Some(store));
        assert_eq!(restored.load_persisted().await.unwrap(), 1);
        assert_eq!(restored.resolve("zwave42").unwrap().domain, "sensor");
    }
}
