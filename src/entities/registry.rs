// 🗂️ Cost Object Registry - in-memory index of clients, projects, categories
//
// Built once per snapshot from the record store and shared read-only by the
// resolver and aggregator. BTreeMaps keep iteration order deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Category, CategoryId, Client, ClientId, EntityRef, Project, ProjectId};
use crate::month::Month;

/// Plain serializable form of the registry (seed files, API payloads)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostObjectSnapshot {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, Default)]
pub struct CostObjectRegistry {
    projects: BTreeMap<ProjectId, Project>,
    clients: BTreeMap<ClientId, Client>,
    categories: BTreeMap<CategoryId, Category>,

    /// The shared "General" project whose costs get redistributed
    overhead_project_id: Option<ProjectId>,
}

impl CostObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CostObjectSnapshot) -> Self {
        let mut registry = CostObjectRegistry::new();
        for client in snapshot.clients {
            registry.add_client(client);
        }
        for project in snapshot.projects {
            registry.add_project(project);
        }
        for category in snapshot.categories {
            registry.add_category(category);
        }
        registry
    }

    pub fn with_overhead_project(mut self, project_id: impl Into<String>) -> Self {
        self.overhead_project_id = Some(ProjectId::new(project_id));
        self
    }

    pub fn set_overhead_project(&mut self, project_id: Option<ProjectId>) {
        self.overhead_project_id = project_id;
    }

    pub fn add_project(&mut self, project: Project) {
        self.projects.insert(project.id.clone(), project);
    }

    pub fn add_client(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn add_category(&mut self, category: Category) {
        self.categories.insert(category.id.clone(), category);
    }

    pub fn project(&self, id: &ProjectId) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn client(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn category(&self, id: &CategoryId) -> Option<&Category> {
        self.categories.get(id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    pub fn overhead_project_id(&self) -> Option<&ProjectId> {
        self.overhead_project_id.as_ref()
    }

    pub fn is_overhead(&self, id: &ProjectId) -> bool {
        self.overhead_project_id.as_ref() == Some(id)
    }

    /// Whether the referenced cost object exists
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Project(id) => self.projects.contains_key(id),
            EntityRef::Client(id) => self.clients.contains_key(id),
        }
    }

    /// Client a project rolls up into, if the project and its client are known
    pub fn owning_client(&self, project_id: &ProjectId) -> Option<&ClientId> {
        self.projects
            .get(project_id)
            .and_then(|project| project.client_id.as_ref())
            .filter(|client_id| self.clients.contains_key(*client_id))
    }

    /// Projects eligible to receive overhead in `month` (never the sink itself)
    pub fn active_projects_in(&self, month: Month) -> Vec<&Project> {
        self.projects
            .values()
            .filter(|project| !self.is_overhead(&project.id) && project.is_active_in(month))
            .collect()
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn to_snapshot(&self) -> CostObjectSnapshot {
        CostObjectSnapshot {
            clients: self.clients.values().cloned().collect(),
            projects: self.projects.values().cloned().collect(),
            categories: self.categories.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ProjectStatus;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn registry() -> CostObjectRegistry {
        let mut registry = CostObjectRegistry::new().with_overhead_project("GEN");
        registry.add_client(Client::new("C1", "Acme"));
        registry.add_project(Project::new("GEN", "General", date(2020, 1, 1)));
        registry.add_project(Project::new("P1", "Acme site", date(2024, 1, 1)).with_client("C1"));
        registry.add_project(
            Project::new("P2", "Old job", date(2023, 1, 1))
                .with_client("C1")
                .with_status(ProjectStatus::Completed),
        );
        registry.add_project(Project::new("P3", "Orphan", date(2024, 1, 1)).with_client("C404"));
        registry
    }

    #[test]
    fn test_owning_client_requires_known_client() {
        let registry = registry();
        assert_eq!(
            registry.owning_client(&ProjectId::new("P1")),
            Some(&ClientId::new("C1"))
        );
        assert_eq!(registry.owning_client(&ProjectId::new("P3")), None);
        assert_eq!(registry.owning_client(&ProjectId::new("nope")), None);
    }

    #[test]
    fn test_active_projects_exclude_sink_and_inactive() {
        let registry = registry();
        let month = Month::new(2025, 2).unwrap();
        let ids: Vec<&str> = registry
            .active_projects_in(month)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["P1", "P3"]);
    }

    #[test]
    fn test_snapshot_round_trip_keeps_counts() {
        let registry = registry();
        let rebuilt = CostObjectRegistry::from_snapshot(registry.to_snapshot());
        assert_eq!(rebuilt.project_count(), 4);
        assert_eq!(rebuilt.client_count(), 1);
        assert!(rebuilt.contains(&EntityRef::Client(ClientId::new("C1"))));
        assert!(!rebuilt.contains(&EntityRef::Client(ClientId::new("C404"))));
    }
}
