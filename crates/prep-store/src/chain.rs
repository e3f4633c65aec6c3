//! The version chain manager.
//!
//! Builds new steps on top of the repository, resolves step names, walks
//! chains, rewrites history for edits, and sweeps unreachable objects.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use prep_types::{root_content, root_step, Action, Content, ObjectId, Preparation, Step, StepRef};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectKind, StoredObject};
use crate::traits::PreparationRepository;

/// Objects removed by [`VersionChain::collect_garbage`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub steps_removed: usize,
    pub contents_removed: usize,
}

pub struct VersionChain {
    repository: Arc<dyn PreparationRepository>,
    // Writers hold it shared; the garbage sweep holds it exclusively so it
    // never sees objects written but not yet published by a head swap.
    sweep_guard: RwLock<()>,
}

impl VersionChain {
    /// Wrap `repository`, storing the root step and content if absent.
    pub fn new(repository: Arc<dyn PreparationRepository>) -> StoreResult<Self> {
        repository.add(root_content().clone().into())?;
        repository.add((*root_step()).into())?;
        Ok(Self {
            repository,
            sweep_guard: RwLock::new(()),
        })
    }

    pub fn repository(&self) -> &Arc<dyn PreparationRepository> {
        &self.repository
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn preparation(&self, preparation_id: &str) -> StoreResult<Preparation> {
        self.repository
            .preparation(preparation_id)?
            .ok_or_else(|| StoreError::PreparationNotFound(preparation_id.to_string()))
    }

    pub fn step(&self, id: &ObjectId) -> StoreResult<Step> {
        self.repository
            .step(id)?
            .ok_or(StoreError::StepNotFound(*id))
    }

    /// The full content a step points at.
    pub fn content_at(&self, step_id: &ObjectId) -> StoreResult<Content> {
        let step = self.step(step_id)?;
        self.repository
            .content(&step.content)?
            .ok_or(StoreError::BrokenChain {
                step: *step_id,
                missing: step.content,
            })
    }

    /// The actions applied at `step_id`, oldest first.
    pub fn actions_at(&self, step_id: &ObjectId) -> StoreResult<Vec<prep_types::Action>> {
        Ok(self.content_at(step_id)?.actions)
    }

    /// Resolve `head`, `origin`, or a concrete id to a stored step id.
    pub fn resolve_step(&self, preparation_id: &str, step: StepRef) -> StoreResult<ObjectId> {
        let id = match step {
            StepRef::Head => self.preparation(preparation_id)?.head,
            StepRef::Origin => root_step().id(),
            StepRef::Id(id) => id,
        };
        self.step(&id)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Walking
    // -----------------------------------------------------------------------

    /// Step ids from the root step to `head`, inclusive.
    ///
    /// Terminates because step ids are derived from their parent's id: a
    /// cycle would need a hash fixed point.
    pub fn list_steps(&self, head: &ObjectId) -> StoreResult<Vec<ObjectId>> {
        let mut ids = vec![*head];
        let mut current = self.step(head)?;
        while let Some(parent) = current.parent {
            current = self.repository.step(&parent)?.ok_or(StoreError::BrokenChain {
                step: *ids.last().unwrap_or(head),
                missing: parent,
            })?;
            ids.push(parent);
        }
        ids.reverse();
        Ok(ids)
    }

    /// The last `limit` step ids ending at `head`, oldest first.
    pub fn list_steps_limited(&self, head: &ObjectId, limit: usize) -> StoreResult<Vec<ObjectId>> {
        let mut ids = self.list_steps(head)?;
        let skip = ids.len().saturating_sub(limit);
        Ok(ids.split_off(skip))
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    pub fn create_preparation(
        &self,
        dataset_id: &str,
        name: &str,
        author: &str,
    ) -> StoreResult<Preparation> {
        let prep = Preparation::new(dataset_id, name, author);
        self.repository.add(prep.clone().into())?;
        info!(preparation = %prep.id, dataset = %dataset_id, "created preparation");
        Ok(prep)
    }

    pub fn append_action(&self, preparation_id: &str, action: Action) -> StoreResult<ObjectId> {
        self.append_actions(preparation_id, vec![action])
    }

    /// Append one step per action and publish the last as the new head.
    pub fn append_actions(&self, preparation_id: &str, actions: Vec<Action>) -> StoreResult<ObjectId> {
        let _guard = self.sweep_guard.read().map_err(poisoned)?;
        loop {
            let prep = self.preparation(preparation_id)?;
            let mut head = prep.head;
            for action in &actions {
                head = self.build_step(head, vec![action.clone()])?;
            }
            if self.publish_head(&prep, head)? {
                return Ok(head);
            }
        }
    }

    /// Point the head at an existing step (redo, or jump in history).
    ///
    /// Redo targets are unreachable from any head until published, so the
    /// existence check and the swap both run under the sweep guard.
    pub fn set_head(&self, preparation_id: &str, step: ObjectId) -> StoreResult<Preparation> {
        let _guard = self.sweep_guard.read().map_err(poisoned)?;
        self.step(&step)?;
        loop {
            let prep = self.preparation(preparation_id)?;
            if self.publish_head(&prep, step)? {
                return self.preparation(preparation_id);
            }
        }
    }

    /// Move the head to its parent. Fails at the root step.
    pub fn undo(&self, preparation_id: &str) -> StoreResult<ObjectId> {
        let _guard = self.sweep_guard.read().map_err(poisoned)?;
        loop {
            let prep = self.preparation(preparation_id)?;
            let parent = self
                .step(&prep.head)?
                .parent
                .ok_or(StoreError::RootStepImmutable)?;
            if self.publish_head(&prep, parent)? {
                return Ok(parent);
            }
        }
    }

    /// Replace the action(s) introduced at `step` and replay later steps.
    pub fn update_action(
        &self,
        preparation_id: &str,
        step: ObjectId,
        action: Action,
    ) -> StoreResult<ObjectId> {
        self.rewrite(preparation_id, step, Some(action))
    }

    /// Drop the action(s) introduced at `step` and replay later steps.
    pub fn delete_action(&self, preparation_id: &str, step: ObjectId) -> StoreResult<ObjectId> {
        self.rewrite(preparation_id, step, None)
    }

    fn rewrite(
        &self,
        preparation_id: &str,
        target: ObjectId,
        replacement: Option<Action>,
    ) -> StoreResult<ObjectId> {
        if target == root_step().id() {
            return Err(StoreError::RootStepImmutable);
        }
        let _guard = self.sweep_guard.read().map_err(poisoned)?;
        loop {
            let prep = self.preparation(preparation_id)?;
            let chain = self.list_steps(&prep.head)?;
            let position = chain
                .iter()
                .position(|id| *id == target)
                .ok_or_else(|| StoreError::StepNotInChain {
                    step: target,
                    preparation: preparation_id.to_string(),
                })?;

            // position > 0: the root is always chain[0] and was excluded above.
            let mut head = chain[position - 1];
            if let Some(action) = &replacement {
                head = self.build_step(head, vec![action.clone()])?;
            }
            for pair in chain[position..].windows(2) {
                let delta = self.delta(&pair[0], &pair[1])?;
                head = self.build_step(head, delta)?;
            }

            if self.publish_head(&prep, head)? {
                debug!(
                    preparation = %preparation_id,
                    step = %target.short_hex(),
                    head = %head.short_hex(),
                    "rewrote history"
                );
                return Ok(head);
            }
        }
    }

    /// Delete a preparation record. Its objects stay until the next sweep.
    pub fn delete_preparation(&self, preparation_id: &str) -> StoreResult<Preparation> {
        let prep = self.preparation(preparation_id)?;
        self.repository.remove(&prep.clone().into())?;
        info!(preparation = %preparation_id, "deleted preparation");
        Ok(prep)
    }

    /// Remove every step and content not reachable from a live head.
    pub fn collect_garbage(&self) -> StoreResult<GcReport> {
        let _guard = self.sweep_guard.write().map_err(poisoned)?;

        let mut live_steps: HashSet<ObjectId> = HashSet::from([root_step().id()]);
        for object in self.repository.list_all(ObjectKind::Preparation)? {
            if let StoredObject::Preparation(prep) = object {
                live_steps.extend(self.list_steps(&prep.head)?);
            }
        }

        let mut live_contents: HashSet<ObjectId> = HashSet::new();
        for id in &live_steps {
            live_contents.insert(self.step(id)?.content);
        }

        let mut report = GcReport::default();
        for object in self.repository.list_all(ObjectKind::Step)? {
            if let StoredObject::Step(step) = &object {
                if !live_steps.contains(&step.id()) && self.repository.remove(&object)? {
                    report.steps_removed += 1;
                }
            }
        }
        for object in self.repository.list_all(ObjectKind::Content)? {
            if let StoredObject::Content(content) = &object {
                if !live_contents.contains(&content.id()) && self.repository.remove(&object)? {
                    report.contents_removed += 1;
                }
            }
        }

        info!(
            steps = report.steps_removed,
            contents = report.contents_removed,
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Human-readable history of a preparation, root first.
    pub fn describe(&self, preparation_id: &str) -> StoreResult<String> {
        let prep = self.preparation(preparation_id)?;
        let chain = self.list_steps(&prep.head)?;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "preparation {} ({}) on dataset {}",
            prep.name, prep.id, prep.dataset_id
        );
        let _ = writeln!(out, "  root {}", chain[0].short_hex());
        for pair in chain.windows(2) {
            for action in self.delta(&pair[0], &pair[1])? {
                let params: Vec<String> = action
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                let _ = writeln!(
                    out,
                    "  step {} {}({})",
                    pair[1].short_hex(),
                    action.name,
                    params.join(", ")
                );
            }
        }
        let _ = write!(out, "  head {}", prep.head.short_hex());
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Store content, then the step on top of `parent`. Does not publish.
    fn build_step(&self, parent: ObjectId, actions: Vec<Action>) -> StoreResult<ObjectId> {
        let content = self.content_at(&parent)?.append(actions);
        let step = Step::new(Some(parent), content.id());
        self.repository.add(content.into())?;
        self.repository.add(step.into())?;
        debug!(parent = %parent.short_hex(), step = %step.id().short_hex(), "stored step");
        Ok(step.id())
    }

    /// Actions `child` added on top of `parent`.
    fn delta(&self, parent: &ObjectId, child: &ObjectId) -> StoreResult<Vec<Action>> {
        let before = self.content_at(parent)?.len();
        let mut actions = self.actions_at(child)?;
        Ok(actions.split_off(before.min(actions.len())))
    }

    fn publish_head(&self, prep: &Preparation, head: ObjectId) -> StoreResult<bool> {
        let swapped = self
            .repository
            .compare_and_set_head(&prep.id, prep.head, head)?;
        if swapped {
            debug!(preparation = %prep.id, head = %head.short_hex(), "moved head");
        } else {
            debug!(preparation = %prep.id, "head moved concurrently, retrying");
        }
        Ok(swapped)
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::LockPoisoned(e.to_string())
}

impl std::fmt::Debug for VersionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionChain").finish_non_exhaustive()
    }
}
