use std::sync::Arc;

use riq_common::{Result, WarehouseConfig};
use riq_policy::{AccessPolicyEngine, AuditSink, RoleRegistry};
use riq_storage::{MetadataStore, PartitionWriter, StorageBackend};

pub type SharedSession = Arc<Session>;

/// Everything one warehouse handle shares across queries.
#[derive(Debug)]
pub struct Session {
    pub config: WarehouseConfig,
    pub backend: Arc<dyn StorageBackend>,
    pub store: Arc<MetadataStore>,
    pub policy: AccessPolicyEngine,
    pub writer: PartitionWriter,
    pub audit: Arc<dyn AuditSink>,
}

impl Session {
    pub fn new(
        config: WarehouseConfig,
        backend: Arc<dyn StorageBackend>,
        registry: RoleRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let store = if config.persist_manifests {
            Arc::new(MetadataStore::open(Arc::clone(&backend))?)
        } else {
            Arc::new(MetadataStore::new())
        };
        let descriptors = store
            .tables()?
            .iter()
            .map(|t| store.descriptor(t))
            .collect::<Result<Vec<_>>>()?;
        registry.validate_tables(&descriptors.iter().map(|d| d.as_ref()).collect::<Vec<_>>())?;
        Ok(Self {
            writer: PartitionWriter::new(Arc::clone(&backend), Arc::clone(&store)),
            policy: AccessPolicyEngine::new(Arc::clone(&store), registry),
            audit,
            config,
            backend,
            store,
        })
    }
}
