/// Project lookup
///
/// Durable project storage lives outside this service; the coordinator reads it
/// through `ProjectCatalog`. `InMemoryProjectCatalog` backs tests and
/// single-process deployments.

use crate::project::types::Project;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn get(&self, tenant_id: &str, project_id: &str) -> Option<Project>;
    async fn put(&self, project: Project);
}

/// Snapshot-swapped map keyed by (tenant, project)
#[derive(Debug, Default)]
pub struct InMemoryProjectCatalog {
    projects: ArcSwap<HashMap<(String, String), Project>>,
}

impl InMemoryProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        let map = projects
            .into_iter()
            .map(|p| ((p.tenant_id.clone(), p.id.clone()), p))
            .collect();
        Self {
            projects: ArcSwap::new(Arc::new(map)),
        }
    }

    pub fn len(&self) -> usize {
        self.projects.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProjectCatalog for InMemoryProjectCatalog {
    async fn get(&self, tenant_id: &str, project_id: &str) -> Option<Project> {
        self.projects
            .load()
            .get(&(tenant_id.to_string(), project_id.to_string()))
            .cloned()
    }

    async fn put(&self, project: Project) {
        let key = (project.tenant_id.clone(), project.id.clone());
        self.projects.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), project.clone());
            next
        });
        tracing::debug!("📁 Stored project {}/{}", key.0, key.1);
    }
}
