//! Persistence layer for build history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteBuildStore;

pub use crate::core::ExecutionStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One recorded build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Unique build ID
    pub build_id: Uuid,

    pub build_name: String,

    pub vm_name: String,

    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,

    /// When the build finished (if it has)
    pub completed_at: Option<DateTime<Utc>>,

    /// Output directory of a successful build
    pub artifact_dir: Option<PathBuf>,

    /// Error message of a failed build
    pub error: Option<String>,
}

impl BuildRecord {
    /// A record for a build starting now
    pub fn start(build_name: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            build_id: Uuid::new_v4(),
            build_name: build_name.into(),
            vm_name: vm_name.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            artifact_dir: None,
            error: None,
        }
    }

    /// Mark the build as finished with `status`
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a build, replacing an earlier record with the same ID
    async fn save_build(&self, record: &BuildRecord) -> Result<()>;

    /// Load a build by ID
    async fn load_build(&self, build_id: Uuid) -> Result<Option<BuildRecord>>;

    /// List builds with the given name, newest first
    async fn list_builds(&self, build_name: &str) -> Result<Vec<BuildRecord>>;

    /// List all build names, sorted
    async fn list_build_names(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or `--no-history`)
#[derive(Default)]
pub struct InMemoryPersistence {
    builds: RwLock<HashMap<Uuid, BuildRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_build(&self, record: &BuildRecord) -> Result<()> {
        let mut builds = self.builds.write().await;
        builds.insert(record.build_id, record.clone());
        Ok(())
    }

    async fn load_build(&self, build_id: Uuid) -> Result<Option<BuildRecord>> {
        let builds = self.builds.read().await;
        Ok(builds.get(&build_id).cloned())
    }

    async fn list_builds(&self, build_name: &str) -> Result<Vec<BuildRecord>> {
        let builds = self.builds.read().await;
        let mut result: Vec<_> = builds
            .values()
            .filter(|b| b.build_name == build_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_build_names(&self) -> Result<Vec<String>> {
        let builds = self.builds.read().await;
        let mut names: Vec<_> = builds.values().map(|b| b.build_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
