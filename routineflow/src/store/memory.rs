//! In-memory routine store.

use super::{validate_write, RoutineChange, RoutineMutation, RoutineStore};
use crate::core::{
    ensure_initial, Pipeline, PipelineId, Routine, RoutineEdge, RoutineId, RoutineSpec,
};
use crate::errors::RoutineflowError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct StoreState {
    last_pipeline_id: u64,
    last_routine_id: u64,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    routines: BTreeMap<RoutineId, Routine>,
    edges: Vec<RoutineEdge>,
}

impl StoreState {
    fn routine(&self, id: RoutineId) -> Result<&Routine, RoutineflowError> {
        self.routines
            .get(&id)
            .ok_or(RoutineflowError::RoutineNotFound(id))
    }

    fn check_edge(&self, edge: RoutineEdge) -> Result<(), RoutineflowError> {
        let RoutineEdge {
            routine_id: from,
            next_routine_id: to,
        } = edge;
        let invalid = |reason: &str| RoutineflowError::InvalidEdge {
            from,
            to,
            reason: reason.to_string(),
        };

        if from == to {
            return Err(invalid("a routine cannot follow itself"));
        }
        if self.routine(from)?.pipeline_id != self.routine(to)?.pipeline_id {
            return Err(invalid("routines belong to different pipelines"));
        }
        if self.edges.contains(&edge) {
            return Err(RoutineflowError::DuplicateEdge { from, to });
        }
        if self.reaches(to, from) {
            return Err(invalid("the edge would create a cycle"));
        }
        Ok(())
    }

    fn reaches(&self, start: RoutineId, target: RoutineId) -> bool {
        let mut stack = vec![start];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(
                self.edges
                    .iter()
                    .filter(|edge| edge.routine_id == current)
                    .map(|edge| edge.next_routine_id),
            );
        }
        false
    }

    fn collect(&self, ids: impl Iterator<Item = RoutineId>) -> Vec<Routine> {
        ids.filter_map(|id| self.routines.get(&id).cloned()).collect()
    }
}

/// Routine store kept in process memory.
///
/// One mutex guards all rows, so every write is atomic with respect to
/// every other. The mutex is never held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryRoutineStore {
    state: Mutex<StoreState>,
}

impl InMemoryRoutineStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of routines.
    #[must_use]
    pub fn routine_count(&self) -> usize {
        self.state.lock().routines.len()
    }
}

#[async_trait]
impl RoutineStore for InMemoryRoutineStore {
    async fn create_pipeline(&self, name: &str) -> Result<Pipeline, RoutineflowError> {
        let mut state = self.state.lock();
        state.last_pipeline_id += 1;
        let pipeline = Pipeline {
            id: PipelineId(state.last_pipeline_id),
            name: name.to_string(),
            created_at: Utc::now(),
            reverting_at: None,
        };
        state.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Pipeline, RoutineflowError> {
        self.state
            .lock()
            .pipelines
            .get(&id)
            .cloned()
            .ok_or(RoutineflowError::PipelineNotFound(id))
    }

    async fn mark_pipeline_reverting(&self, id: PipelineId) -> Result<Pipeline, RoutineflowError> {
        let mut state = self.state.lock();
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or(RoutineflowError::PipelineNotFound(id))?;
        pipeline.reverting_at.get_or_insert_with(Utc::now);
        Ok(pipeline.clone())
    }

    async fn delete_pipeline(&self, id: PipelineId) -> Result<(), RoutineflowError> {
        let mut state = self.state.lock();
        if !state.pipelines.contains_key(&id) {
            return Err(RoutineflowError::PipelineNotFound(id));
        }
        let owned = state
            .routines
            .values()
            .filter(|routine| routine.pipeline_id == id)
            .count();
        if owned > 0 {
            return Err(RoutineflowError::ProtectedRecord {
                record: format!("pipeline #{id}"),
                referenced_by: format!("{owned} routine(s)"),
            });
        }
        state.pipelines.remove(&id);
        Ok(())
    }

    async fn insert_routine(
        &self,
        pipeline_id: PipelineId,
        spec: RoutineSpec,
        previous: Option<RoutineId>,
    ) -> Result<Routine, RoutineflowError> {
        ensure_initial(spec.status)?;

        let mut state = self.state.lock();
        if !state.pipelines.contains_key(&pipeline_id) {
            return Err(RoutineflowError::PipelineNotFound(pipeline_id));
        }
        if let Some(previous) = previous {
            let owner = state.routine(previous)?.pipeline_id;
            if owner != pipeline_id {
                return Err(RoutineflowError::InvalidEdge {
                    from: previous,
                    to: RoutineId(state.last_routine_id + 1),
                    reason: "routines belong to different pipelines".to_string(),
                });
            }
        }

        let routine = spec.into_routine(RoutineId(state.last_routine_id + 1), pipeline_id);
        routine.check_constraints()?;

        state.last_routine_id += 1;
        state.routines.insert(routine.id, routine.clone());
        if let Some(previous) = previous {
            state.edges.push(RoutineEdge::new(previous, routine.id));
        }
        Ok(routine)
    }

    async fn get_routine(&self, id: RoutineId) -> Result<Routine, RoutineflowError> {
        self.state.lock().routine(id).cloned()
    }

    async fn update_routine(
        &self,
        id: RoutineId,
        mutation: RoutineMutation,
    ) -> Result<RoutineChange, RoutineflowError> {
        let mut state = self.state.lock();
        let previous = state.routine(id)?.clone();

        let mut current = previous.clone();
        mutation(&mut current)?;
        validate_write(&previous, &current)?;
        current.updated_at = Utc::now();

        state.routines.insert(id, current.clone());
        Ok(RoutineChange { previous, current })
    }

    async fn delete_routine(&self, id: RoutineId) -> Result<(), RoutineflowError> {
        let mut state = self.state.lock();
        state.routine(id)?;
        let references = state
            .edges
            .iter()
            .filter(|edge| edge.routine_id == id || edge.next_routine_id == id)
            .count();
        if references > 0 {
            return Err(RoutineflowError::ProtectedRecord {
                record: format!("routine #{id}"),
                referenced_by: format!("{references} edge(s)"),
            });
        }
        state.routines.remove(&id);
        Ok(())
    }

    async fn add_edge(&self, edge: RoutineEdge) -> Result<(), RoutineflowError> {
        let mut state = self.state.lock();
        state.check_edge(edge)?;
        state.edges.push(edge);
        Ok(())
    }

    async fn routines(&self, pipeline_id: PipelineId) -> Result<Vec<Routine>, RoutineflowError> {
        let state = self.state.lock();
        if !state.pipelines.contains_key(&pipeline_id) {
            return Err(RoutineflowError::PipelineNotFound(pipeline_id));
        }
        Ok(state
            .routines
            .values()
            .filter(|routine| routine.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn edges(&self, pipeline_id: PipelineId) -> Result<Vec<RoutineEdge>, RoutineflowError> {
        let state = self.state.lock();
        if !state.pipelines.contains_key(&pipeline_id) {
            return Err(RoutineflowError::PipelineNotFound(pipeline_id));
        }
        Ok(state
            .edges
            .iter()
            .filter(|edge| {
                state
                    .routines
                    .get(&edge.routine_id)
                    .is_some_and(|routine| routine.pipeline_id == pipeline_id)
            })
            .copied()
            .collect())
    }

    async fn next_routines(&self, id: RoutineId) -> Result<Vec<Routine>, RoutineflowError> {
        let state = self.state.lock();
        state.routine(id)?;
        Ok(state.collect(
            state
                .edges
                .iter()
                .filter(|edge| edge.routine_id == id)
                .map(|edge| edge.next_routine_id),
        ))
    }

    async fn dependent_routines(&self, id: RoutineId) -> Result<Vec<Routine>, RoutineflowError> {
        let state = self.state.lock();
        state.routine(id)?;
        Ok(state.collect(
            state
                .edges
                .iter()
                .filter(|edge| edge.next_routine_id == id)
                .map(|edge| edge.routine_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RoutineStatus;
    use pretty_assertions::assert_eq;

    async fn store_with_pipeline() -> (InMemoryRoutineStore, PipelineId) {
        let store = InMemoryRoutineStore::new();
        let pipeline = store.create_pipeline("Spell").await.unwrap();
        (store, pipeline.id)
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let first = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();
        let second = store
            .insert_routine(pipeline_id, RoutineSpec::new("B"), None)
            .await
            .unwrap();

        assert_eq!(first.id, RoutineId(1));
        assert_eq!(second.id, RoutineId(2));
        assert_eq!(store.routine_count(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejects_non_pending_status() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let err = store
            .insert_routine(
                pipeline_id,
                RoutineSpec::new("A").with_status(RoutineStatus::Running),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RoutineflowError::InvalidInitialStatus(RoutineStatus::Running)
        ));
        assert_eq!(store.routine_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_rejects_constraint_violation() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let spec = RoutineSpec::new("A").with_max_retries(1).with_attempt_count(5);
        let err = store.insert_routine(pipeline_id, spec, None).await.unwrap_err();
        assert!(matches!(err, RoutineflowError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_insert_with_previous_links_edge() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let a = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();
        let b = store
            .insert_routine(pipeline_id, RoutineSpec::new("B"), Some(a.id))
            .await
            .unwrap();

        assert_eq!(
            store.edges(pipeline_id).await.unwrap(),
            vec![RoutineEdge::new(a.id, b.id)]
        );
        assert_eq!(store.next_routines(a.id).await.unwrap()[0].id, b.id);
        assert_eq!(store.dependent_routines(b.id).await.unwrap()[0].id, a.id);
    }

    #[tokio::test]
    async fn test_update_is_validated_against_persisted_status() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let routine = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();

        let err = store
            .update_routine(
                routine.id,
                Box::new(|routine| {
                    routine.status = RoutineStatus::Completed;
                    routine.output = Some(serde_json::json!({"x": 1}));
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoutineflowError::InvalidTransition(_)));

        let persisted = store.get_routine(routine.id).await.unwrap();
        assert_eq!(persisted.status, RoutineStatus::Pending);
        assert!(persisted.output.is_none());
    }

    #[tokio::test]
    async fn test_update_returns_change() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let routine = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();

        let change = store
            .update_routine(
                routine.id,
                Box::new(|routine| {
                    routine.status = RoutineStatus::Scheduled;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(change.previous.status, RoutineStatus::Pending);
        assert_eq!(change.current.status, RoutineStatus::Scheduled);
        assert!(change.status_changed());
    }

    #[tokio::test]
    async fn test_update_mutation_error_leaves_row() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let routine = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();

        let result = store
            .update_routine(
                routine.id,
                Box::new(|routine| {
                    routine.attempt_count = 9;
                    Err(RoutineflowError::Internal("nope".to_string()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_routine(routine.id).await.unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_edge_validation() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let other = store.create_pipeline("Other").await.unwrap();
        let a = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();
        let b = store
            .insert_routine(pipeline_id, RoutineSpec::new("B"), Some(a.id))
            .await
            .unwrap();
        let stranger = store
            .insert_routine(other.id, RoutineSpec::new("C"), None)
            .await
            .unwrap();

        assert!(matches!(
            store.add_edge(RoutineEdge::new(a.id, b.id)).await,
            Err(RoutineflowError::DuplicateEdge { .. })
        ));
        assert!(matches!(
            store.add_edge(RoutineEdge::new(a.id, a.id)).await,
            Err(RoutineflowError::InvalidEdge { .. })
        ));
        assert!(matches!(
            store.add_edge(RoutineEdge::new(b.id, a.id)).await,
            Err(RoutineflowError::InvalidEdge { .. })
        ));
        assert!(matches!(
            store.add_edge(RoutineEdge::new(a.id, stranger.id)).await,
            Err(RoutineflowError::InvalidEdge { .. })
        ));
    }

    #[tokio::test]
    async fn test_roots_and_leaves() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let a = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();
        let b = store
            .insert_routine(pipeline_id, RoutineSpec::new("B"), Some(a.id))
            .await
            .unwrap();
        let c = store
            .insert_routine(pipeline_id, RoutineSpec::new("C"), Some(a.id))
            .await
            .unwrap();
        let lonely = store
            .insert_routine(pipeline_id, RoutineSpec::new("D"), None)
            .await
            .unwrap();

        let roots: Vec<_> = store
            .roots(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let leaves: Vec<_> = store
            .leaves(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert_eq!(roots, vec![a.id, lonely.id]);
        assert_eq!(leaves, vec![b.id, c.id, lonely.id]);
    }

    #[tokio::test]
    async fn test_protected_deletes() {
        let (store, pipeline_id) = store_with_pipeline().await;
        let a = store
            .insert_routine(pipeline_id, RoutineSpec::new("A"), None)
            .await
            .unwrap();
        let b = store
            .insert_routine(pipeline_id, RoutineSpec::new("B"), Some(a.id))
            .await
            .unwrap();
        let c = store
            .insert_routine(pipeline_id, RoutineSpec::new("C"), None)
            .await
            .unwrap();

        assert!(matches!(
            store.delete_routine(b.id).await,
            Err(RoutineflowError::ProtectedRecord { .. })
        ));
        assert!(matches!(
            store.delete_pipeline(pipeline_id).await,
            Err(RoutineflowError::ProtectedRecord { .. })
        ));

        store.delete_routine(c.id).await.unwrap();
        assert!(matches!(
            store.get_routine(c.id).await,
            Err(RoutineflowError::RoutineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_empty_pipeline() {
        let (store, pipeline_id) = store_with_pipeline().await;
        store.delete_pipeline(pipeline_id).await.unwrap();
        assert!(matches!(
            store.get_pipeline(pipeline_id).await,
            Err(RoutineflowError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_pipeline_reverting_keeps_first_time() {
        let (store, pipeline_id) = store_with_pipeline().await;
        assert!(!store.get_pipeline(pipeline_id).await.unwrap().is_reverting());

        let first = store.mark_pipeline_reverting(pipeline_id).await.unwrap();
        let again = store.mark_pipeline_reverting(pipeline_id).await.unwrap();

        assert!(first.is_reverting());
        assert_eq!(again.reverting_at, first.reverting_at);
        assert_eq!(store.get_pipeline(pipeline_id).await.unwrap(), first);
        assert!(matches!(
            store.mark_pipeline_reverting(PipelineId(99)).await,
            Err(RoutineflowError::PipelineNotFound(_))
        ));
    }
}
