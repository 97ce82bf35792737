use crate::db::Stores;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ArtifactReaction, Generation, ReactionRecord, Table, Workflow, WorkflowReaction, WorkflowVersion,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// A workflow joined with its versions and the one currently selected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub workflow: Workflow,
    pub versions: Vec<WorkflowVersion>,
    pub selected_version: Option<WorkflowVersion>,
}

/// `entityId -> [reaction]`, in table order.
pub type ReactionMap = HashMap<String, Vec<String>>;

/// The pinned version when it is among `versions`, else the first one loaded.
pub fn select_version<'a>(versions: &'a [WorkflowVersion], pinned: Option<&str>) -> Option<&'a WorkflowVersion> {
    pinned
        .and_then(|pinned| versions.iter().find(|version| version.id == pinned))
        .or_else(|| versions.first())
}

#[derive(Debug, Default)]
struct ProjectionState {
    workflows: Vec<Workflow>,
    versions: HashMap<String, Vec<WorkflowVersion>>,
    views: Vec<WorkflowView>,
    pinned: HashMap<String, String>,
    active_thread: Option<String>,
    generations: Vec<Generation>,
    thread_generations: Vec<Generation>,
    workflow_reactions: ReactionMap,
    artifact_reactions: ReactionMap,
}

impl ProjectionState {
    fn rebuild_views(&mut self) {
        self.views = self
            .workflows
            .iter()
            .map(|workflow| {
                let versions = self.versions.get(&workflow.id).cloned().unwrap_or_default();
                let selected_version =
                    select_version(&versions, self.pinned.get(&workflow.id).map(String::as_str)).cloned();
                WorkflowView {
                    workflow: workflow.clone(),
                    versions,
                    selected_version,
                }
            })
            .collect();
    }

    fn rebuild_thread(&mut self) {
        let Some(thread_id) = self.active_thread.as_deref() else {
            self.thread_generations.clear();
            return;
        };
        let mut generations = self
            .generations
            .iter()
            .filter(|generation| generation.thread_id == thread_id)
            .cloned()
            .collect::<Vec<_>>();
        generations.sort_by(|left, right| {
            left.created_date
                .cmp(&right.created_date)
                .then_with(|| left.id.cmp(&right.id))
        });
        self.thread_generations = generations;
    }
}

/// In-memory views derived from the local tables, recomputed after sync passes.
///
/// Readers get clones; every rebuild bumps a revision published on a watch
/// channel so UI layers can re-read.
pub struct Projections {
    stores: Option<Stores>,
    state: RwLock<ProjectionState>,
    revision: watch::Sender<u64>,
}

impl Projections {
    /// `None` when running without local storage; views are then fed through
    /// the `replace_*` methods.
    pub fn new(stores: Option<Stores>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            stores,
            state: RwLock::new(ProjectionState::default()),
            revision,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn read(&self) -> AppResult<RwLockReadGuard<'_, ProjectionState>> {
        self.state
            .read()
            .map_err(|_| AppError::Internal("projection lock poisoned".to_string()))
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, ProjectionState>> {
        self.state
            .write()
            .map_err(|_| AppError::Internal("projection lock poisoned".to_string()))
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Recomputes whichever views depend on `table`.
    pub fn refresh(&self, table: Table) -> AppResult<()> {
        match table {
            Table::Workflows | Table::WorkflowVersions => self.refresh_workflows(),
            Table::Generations => self.refresh_generations(),
            Table::WorkflowReactions => self.refresh_reactions::<WorkflowReaction>(),
            Table::ArtifactReactions => self.refresh_reactions::<ArtifactReaction>(),
            Table::Artifacts | Table::Assets | Table::Threads => Ok(()),
        }
    }

    pub fn refresh_workflows(&self) -> AppResult<()> {
        let Some(stores) = &self.stores else {
            return Ok(());
        };
        let app = stores.app();
        let workflows = app.get_all::<Workflow>()?;
        let versions = app.get_all::<WorkflowVersion>()?;
        self.replace_workflows(workflows, versions)
    }

    /// Replaces the workflow sources and rejoins. Version lists keep the
    /// order they arrive in.
    pub fn replace_workflows(&self, workflows: Vec<Workflow>, versions: Vec<WorkflowVersion>) -> AppResult<()> {
        let mut by_parent: HashMap<String, Vec<WorkflowVersion>> = HashMap::new();
        for version in versions {
            by_parent.entry(version.parent_id.clone()).or_default().push(version);
        }
        {
            let mut state = self.write()?;
            state.workflows = workflows;
            state.versions = by_parent;
            state.rebuild_views();
        }
        self.bump();
        Ok(())
    }

    /// Pins a version for one workflow; `None` falls back to the first version.
    pub fn pin_version(&self, workflow_id: &str, version_id: Option<&str>) -> AppResult<()> {
        {
            let mut state = self.write()?;
            match version_id {
                Some(version_id) => {
                    state.pinned.insert(workflow_id.to_string(), version_id.to_string());
                }
                None => {
                    state.pinned.remove(workflow_id);
                }
            }
            state.rebuild_views();
        }
        self.bump();
        Ok(())
    }

    pub fn workflows(&self) -> AppResult<Vec<WorkflowView>> {
        Ok(self.read()?.views.clone())
    }

    pub fn workflow(&self, workflow_id: &str) -> AppResult<Option<WorkflowView>> {
        Ok(self
            .read()?
            .views
            .iter()
            .find(|view| view.workflow.id == workflow_id)
            .cloned())
    }

    pub fn set_active_thread(&self, thread_id: Option<&str>) -> AppResult<()> {
        {
            let mut state = self.write()?;
            state.active_thread = thread_id.map(str::to_string);
            state.rebuild_thread();
        }
        self.bump();
        Ok(())
    }

    pub fn active_thread(&self) -> AppResult<Option<String>> {
        Ok(self.read()?.active_thread.clone())
    }

    pub fn refresh_generations(&self) -> AppResult<()> {
        let Some(stores) = &self.stores else {
            return Ok(());
        };
        // Signed out: nothing to show.
        let generations = match stores.user() {
            Ok(user) => user.get_all::<Generation>()?,
            Err(AppError::NotAuthenticated(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        self.replace_generations(generations)
    }

    pub fn replace_generations(&self, generations: Vec<Generation>) -> AppResult<()> {
        {
            let mut state = self.write()?;
            state.generations = generations;
            state.rebuild_thread();
        }
        self.bump();
        Ok(())
    }

    /// Generations of the active thread, oldest first.
    pub fn thread_generations(&self) -> AppResult<Vec<Generation>> {
        Ok(self.read()?.thread_generations.clone())
    }

    pub fn refresh_reactions<R: ReactionRecord>(&self) -> AppResult<()> {
        let Some(stores) = &self.stores else {
            return Ok(());
        };
        let reactions = match stores.user() {
            Ok(user) => user.get_all::<R>()?,
            Err(AppError::NotAuthenticated(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        self.replace_reactions(&reactions)
    }

    pub fn replace_reactions<R: ReactionRecord>(&self, reactions: &[R]) -> AppResult<()> {
        let mut map = ReactionMap::new();
        for record in reactions {
            let reaction = record.reaction();
            map.entry(reaction.entity_id.clone())
                .or_default()
                .push(reaction.reaction.clone());
        }
        {
            let mut state = self.write()?;
            match R::TABLE {
                Table::WorkflowReactions => state.workflow_reactions = map,
                Table::ArtifactReactions => state.artifact_reactions = map,
                other => {
                    return Err(AppError::Internal(format!("{} is not a reaction table", other)));
                }
            }
        }
        self.bump();
        Ok(())
    }

    pub fn reactions(&self, table: Table, entity_id: &str) -> AppResult<Vec<String>> {
        let state = self.read()?;
        let map = match table {
            Table::WorkflowReactions => &state.workflow_reactions,
            Table::ArtifactReactions => &state.artifact_reactions,
            other => return Err(AppError::Internal(format!("{} is not a reaction table", other))),
        };
        Ok(map.get(entity_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::{select_version, Projections};
    use crate::db::{Database, Stores};
    use crate::models::{DatabaseScope, Generation, Table, Workflow, WorkflowReaction, WorkflowVersion};
    use std::sync::Arc;

    fn stores() -> Stores {
        Stores::new(
            Arc::new(Database::in_memory(DatabaseScope::App).expect("app db")),
            Some(Arc::new(Database::in_memory(DatabaseScope::User).expect("user db"))),
        )
    }

    fn workflow(id: &str) -> Workflow {
        serde_json::from_value(serde_json::json!({ "id": id, "modifiedDate": "2026-01-01" })).expect("workflow")
    }

    fn version(id: &str, parent: &str) -> WorkflowVersion {
        serde_json::from_value(serde_json::json!({ "id": id, "parentId": parent, "modifiedDate": "2026-01-01" }))
            .expect("version")
    }

    fn generation(id: &str, thread: &str, created: &str) -> Generation {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "threadId": thread,
            "createdDate": created,
            "modifiedDate": created
        }))
        .expect("generation")
    }

    #[test]
    fn pinned_version_wins_only_when_present() {
        let versions = vec![version("v2", "wf"), version("v1", "wf")];
        assert_eq!(select_version(&versions, None).map(|v| v.id.as_str()), Some("v2"));
        assert_eq!(select_version(&versions, Some("v1")).map(|v| v.id.as_str()), Some("v1"));
        assert_eq!(select_version(&versions, Some("gone")).map(|v| v.id.as_str()), Some("v2"));
        assert!(select_version(&[], Some("v1")).is_none());
    }

    #[test]
    fn workflows_join_versions_from_the_store() {
        let stores = stores();
        let app = stores.app();
        app.put_all(&[workflow("wf-1"), workflow("wf-2")]).expect("workflows");
        app.put_all(&[version("v-b", "wf-1"), version("v-a", "wf-1"), version("v-c", "wf-2")])
            .expect("versions");

        let projections = Projections::new(Some(stores.clone()));
        projections.refresh(Table::Workflows).expect("refresh");

        let view = projections.workflow("wf-1").expect("read").expect("wf-1");
        assert_eq!(view.versions.len(), 2);
        assert_eq!(view.selected_version.map(|v| v.id), Some("v-b".to_string()));

        projections.pin_version("wf-1", Some("v-a")).expect("pin");
        let view = projections.workflow("wf-1").expect("read").expect("wf-1");
        assert_eq!(view.selected_version.map(|v| v.id), Some("v-a".to_string()));
        assert_eq!(projections.workflows().expect("all").len(), 2);
    }

    #[test]
    fn thread_view_follows_active_thread_and_sorts() {
        let projections = Projections::new(None);
        projections
            .replace_generations(vec![
                generation("g3", "t1", "2026-01-03"),
                generation("g1", "t1", "2026-01-01"),
                generation("g2", "t2", "2026-01-02"),
            ])
            .expect("generations");
        assert!(projections.thread_generations().expect("empty").is_empty());

        projections.set_active_thread(Some("t1")).expect("activate");
        let ids = projections
            .thread_generations()
            .expect("view")
            .into_iter()
            .map(|g| g.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["g1", "g3"]);

        projections.set_active_thread(Some("t2")).expect("switch");
        assert_eq!(projections.thread_generations().expect("view").len(), 1);
    }

    #[test]
    fn reaction_map_groups_by_entity() {
        let stores = stores();
        let reactions = [(1, "wf-1", "like"), (2, "wf-2", "fire"), (3, "wf-1", "star")]
            .into_iter()
            .map(|(id, entity, reaction)| {
                serde_json::from_value::<WorkflowReaction>(
                    serde_json::json!({ "id": id, "entityId": entity, "reaction": reaction }),
                )
                .expect("reaction")
            })
            .collect::<Vec<_>>();
        stores.user().expect("user").put_all(&reactions).expect("seed");

        let projections = Projections::new(Some(stores));
        let revisions = projections.subscribe();
        projections.refresh(Table::WorkflowReactions).expect("refresh");

        assert!(revisions.has_changed().expect("sender alive"));
        assert_eq!(
            projections.reactions(Table::WorkflowReactions, "wf-1").expect("map"),
            vec!["like".to_string(), "star".to_string()]
        );
        assert!(projections.reactions(Table::ArtifactReactions, "wf-1").expect("map").is_empty());
        assert!(projections.reactions(Table::Assets, "wf-1").is_err());
    }

    #[test]
    fn signed_out_generations_are_empty() {
        let stores = Stores::new(Arc::new(Database::in_memory(DatabaseScope::App).expect("app db")), None);
        let projections = Projections::new(Some(stores));
        projections.refresh(Table::Generations).expect("refresh");
        assert!(projections.thread_generations().expect("view").is_empty());
    }
}
