//! The orchestrator.

use std::sync::Arc;

use bytes::Bytes;
use prep_cache::{CacheKey, ContentCache, ResultSource, Sample};
use prep_pipeline::{
    ActionRegistry, DiffWriterNode, JsonSerializer, MetadataTarget, OutputBuffer, PipelineBuilder,
    WriterNode,
};
use prep_store::{GcReport, PreparationRepository, VersionChain};
use prep_types::{Action, ObjectId, Preparation, Schema, StepRef};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{EngineConfig, JSON_FORMAT};
use crate::dataset::{Dataset, DatasetSource};
use crate::error::{EngineError, EngineResult};

/// Run a preparation at one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub preparation_id: String,
    pub step: StepRef,
    pub sample: Sample,
    /// Defaults to the configured format.
    pub format: Option<String>,
    pub user_id: Option<String>,
}

impl ExecuteRequest {
    /// The shared result at the preparation's head, over the full dataset.
    pub fn head(preparation_id: impl Into<String>) -> Self {
        Self {
            preparation_id: preparation_id.into(),
            step: StepRef::Head,
            sample: Sample::Full,
            format: None,
            user_id: None,
        }
    }

    pub fn at(mut self, step: StepRef) -> Self {
        self.step = step;
        self
    }

    pub fn sample(mut self, sample: Sample) -> Self {
        self.sample = sample;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Output of [`PreparationEngine::execute`].
#[derive(Clone, Debug)]
pub struct Execution {
    /// The serialized envelope.
    pub content: Bytes,
    pub step_id: ObjectId,
    /// Whether the content came from the cache.
    pub cached: bool,
}

/// Diff two steps of one preparation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewRequest {
    pub preparation_id: String,
    pub reference: StepRef,
    pub candidate: StepRef,
    pub sample: Sample,
    /// Restrict the preview to these row ids.
    pub row_ids: Option<Vec<u64>>,
}

impl PreviewRequest {
    pub fn new(preparation_id: impl Into<String>, reference: StepRef, candidate: StepRef) -> Self {
        Self {
            preparation_id: preparation_id.into(),
            reference,
            candidate,
            sample: Sample::Full,
            row_ids: None,
        }
    }

    pub fn rows(mut self, row_ids: Vec<u64>) -> Self {
        self.row_ids = Some(row_ids);
        self
    }
}

/// Actions a step added on top of its parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub id: ObjectId,
    pub added: Vec<Action>,
}

/// Executes, previews and edits preparations.
pub struct PreparationEngine {
    chain: VersionChain,
    cache: Arc<dyn ContentCache>,
    registry: ActionRegistry,
    datasets: Arc<dyn DatasetSource>,
    config: EngineConfig,
}

impl PreparationEngine {
    pub fn new(
        repository: Arc<dyn PreparationRepository>,
        cache: Arc<dyn ContentCache>,
        registry: ActionRegistry,
        datasets: Arc<dyn DatasetSource>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        Ok(Self {
            chain: VersionChain::new(repository)?,
            cache,
            registry,
            datasets,
            config,
        })
    }

    pub fn chain(&self) -> &VersionChain {
        &self.chain
    }

    pub fn cache(&self) -> &Arc<dyn ContentCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Chain editing
    // -----------------------------------------------------------------------

    pub fn create_preparation(
        &self,
        dataset_id: &str,
        name: &str,
        author: &str,
    ) -> EngineResult<Preparation> {
        Ok(self.chain.create_preparation(dataset_id, name, author)?)
    }

    pub fn preparation(&self, preparation_id: &str) -> EngineResult<Preparation> {
        Ok(self.chain.preparation(preparation_id)?)
    }

    pub fn append_actions(&self, preparation_id: &str, actions: Vec<Action>) -> EngineResult<ObjectId> {
        for action in &actions {
            self.registry.resolve(action)?;
        }
        Ok(self.chain.append_actions(preparation_id, actions)?)
    }

    pub fn undo(&self, preparation_id: &str) -> EngineResult<ObjectId> {
        Ok(self.chain.undo(preparation_id)?)
    }

    /// Move the head to any stored step, for redo or jumps.
    pub fn set_head(&self, preparation_id: &str, step: StepRef) -> EngineResult<ObjectId> {
        let id = self.chain.resolve_step(preparation_id, step)?;
        Ok(self.chain.set_head(preparation_id, id)?.head)
    }

    pub fn update_action(
        &self,
        preparation_id: &str,
        step: StepRef,
        action: Action,
    ) -> EngineResult<ObjectId> {
        self.registry.resolve(&action)?;
        let id = self.chain.resolve_step(preparation_id, step)?;
        Ok(self.chain.update_action(preparation_id, id, action)?)
    }

    pub fn delete_action(&self, preparation_id: &str, step: StepRef) -> EngineResult<ObjectId> {
        let id = self.chain.resolve_step(preparation_id, step)?;
        Ok(self.chain.delete_action(preparation_id, id)?)
    }

    /// Steps from the root to the head, each with the actions it added.
    pub fn history(&self, preparation_id: &str, limit: Option<usize>) -> EngineResult<Vec<StepSummary>> {
        let prep = self.chain.preparation(preparation_id)?;
        let ids = match limit {
            Some(limit) => self.chain.list_steps_limited(&prep.head, limit)?,
            None => self.chain.list_steps(&prep.head)?,
        };
        ids.into_iter()
            .map(|id| {
                let step = self.chain.step(&id)?;
                let actions = self.chain.actions_at(&id)?;
                let inherited = match step.parent {
                    Some(parent) => self.chain.actions_at(&parent)?.len(),
                    None => 0,
                };
                Ok(StepSummary {
                    id,
                    added: actions.into_iter().skip(inherited).collect(),
                })
            })
            .collect()
    }

    pub fn describe(&self, preparation_id: &str) -> EngineResult<String> {
        Ok(self.chain.describe(preparation_id)?)
    }

    /// Delete the preparation, drop its cached results and sweep objects
    /// no other preparation reaches.
    pub fn delete_preparation(&self, preparation_id: &str) -> EngineResult<GcReport> {
        let prep = self.chain.delete_preparation(preparation_id)?;
        let scope = CacheKey::dataset(&prep.dataset_id).preparation(&prep.id);
        match self.cache.evict(&scope) {
            Ok(n) => debug!(preparation = %prep.id, evicted = n, "evicted cached results"),
            Err(e) => warn!(preparation = %prep.id, error = %e, "failed to evict cached results"),
        }
        Ok(self.chain.collect_garbage()?)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    pub fn execute(&self, request: &ExecuteRequest) -> EngineResult<Execution> {
        let format = self.format(request.format.as_deref())?;
        let prep = self.chain.preparation(&request.preparation_id)?;
        let step_id = self.chain.resolve_step(&prep.id, request.step)?;
        let key = self.result_key(&prep, &step_id, request.sample, format, request.user_id.as_deref());

        if let Some(content) = self.cached(&key) {
            debug!(key = %key, "serving cached result");
            return Ok(Execution {
                content,
                step_id,
                cached: true,
            });
        }

        let content = match self.compute(&prep, &step_id, request, &key) {
            Ok(content) => content,
            Err(e) => {
                self.evict_quietly(&key);
                self.evict_quietly(&key.metadata());
                return Err(e);
            }
        };

        if let Err(e) = self
            .cache
            .put_bytes(&key, self.config.content_ttl, &content)
        {
            warn!(key = %key, error = %e, "failed to cache result");
            self.evict_quietly(&key);
        }
        Ok(Execution {
            content,
            step_id,
            cached: false,
        })
    }

    /// The schema a step produces, from the metadata cache when present.
    pub fn metadata(
        &self,
        preparation_id: &str,
        step: StepRef,
        user_id: Option<&str>,
    ) -> EngineResult<Schema> {
        let format = self.format(None)?;
        let prep = self.chain.preparation(preparation_id)?;
        let step_id = self.chain.resolve_step(&prep.id, step)?;
        let key = self
            .result_key(&prep, &step_id, Sample::Full, format, user_id)
            .metadata();

        if let Some(bytes) = self.cached(&key) {
            match serde_json::from_slice::<Schema>(&bytes) {
                Ok(schema) => return Ok(schema),
                Err(e) => warn!(key = %key, error = %e, "ignoring unreadable cached metadata"),
            }
        }

        let mut request = ExecuteRequest::head(&prep.id).at(StepRef::Id(step_id));
        request.user_id = user_id.map(str::to_string);
        let execution = self.execute(&request)?;
        Ok(parse_envelope(&execution.content)?.schema)
    }

    fn compute(
        &self,
        prep: &Preparation,
        step_id: &ObjectId,
        request: &ExecuteRequest,
        key: &CacheKey,
    ) -> EngineResult<Bytes> {
        let (dataset, actions) = match self.incremental_base(prep, step_id, request)? {
            Some(base) => base,
            None => (
                self.datasets.open(&prep.dataset_id, request.sample)?,
                self.chain.actions_at(step_id)?,
            ),
        };
        let schema = dataset.schema_ref();

        let out = OutputBuffer::new();
        let writer = WriterNode::new(Box::new(JsonSerializer::new(out.clone())), schema.clone())
            .with_metadata(MetadataTarget {
                cache: Arc::clone(&self.cache),
                key: key.metadata(),
                ttl: self.config.metadata_ttl,
            });
        let pipeline = PipelineBuilder::new(&self.registry).single(&actions, Arc::new(writer))?;
        let summary = pipeline.execute(schema, dataset.rows)?;
        debug!(
            step = %step_id.short_hex(),
            actions = actions.len(),
            rows = summary.rows_in,
            "executed preparation"
        );
        Ok(Bytes::from(out.take()))
    }

    /// The cached output of the parent step plus the actions still to apply,
    /// when the parent's result is available.
    fn incremental_base(
        &self,
        prep: &Preparation,
        step_id: &ObjectId,
        request: &ExecuteRequest,
    ) -> EngineResult<Option<(Dataset, Vec<Action>)>> {
        if !self.config.incremental {
            return Ok(None);
        }
        let Some(parent) = self.chain.step(step_id)?.parent else {
            return Ok(None);
        };
        let actions = self.chain.actions_at(step_id)?;
        let inherited = self.chain.actions_at(&parent)?;
        if !actions.starts_with(&inherited) {
            return Ok(None);
        }

        let format = self.format(request.format.as_deref())?;
        let base = CacheKey::dataset(&prep.dataset_id)
            .preparation(&prep.id)
            .step(parent.to_hex())
            .sample(request.sample)
            .format(format);
        let candidates = [
            base.clone().for_source(ResultSource::Head, None),
            base.for_source(ResultSource::User, request.user_id.as_deref()),
        ];
        for key in &candidates {
            let Some(bytes) = self.cached(key) else {
                continue;
            };
            match parse_envelope(&bytes) {
                Ok(dataset) => {
                    debug!(
                        step = %step_id.short_hex(),
                        parent = %parent.short_hex(),
                        "continuing from cached parent result"
                    );
                    return Ok(Some((dataset, actions[inherited.len()..].to_vec())));
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring unreadable cached result"),
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Previews
    // -----------------------------------------------------------------------

    /// Diff of the candidate step's output against the reference step's.
    pub fn preview_steps(&self, request: &PreviewRequest) -> EngineResult<Bytes> {
        let prep = self.chain.preparation(&request.preparation_id)?;
        let reference = self.chain.resolve_step(&prep.id, request.reference)?;
        let candidate = self.chain.resolve_step(&prep.id, request.candidate)?;
        self.preview_actions(
            &prep.dataset_id,
            &self.chain.actions_at(&reference)?,
            &self.chain.actions_at(&candidate)?,
            request.sample,
            request.row_ids.as_deref(),
        )
    }

    /// Diff of two arbitrary action lists over one dataset.
    pub fn preview_actions(
        &self,
        dataset_id: &str,
        reference: &[Action],
        candidate: &[Action],
        sample: Sample,
        row_ids: Option<&[u64]>,
    ) -> EngineResult<Bytes> {
        let mut dataset = self.datasets.open(dataset_id, sample)?;
        if let Some(ids) = row_ids {
            dataset
                .rows
                .retain(|row| row.id().is_some_and(|id| ids.contains(&id)));
        }
        let schema = dataset.schema_ref();

        let out = OutputBuffer::new();
        let writer = DiffWriterNode::new(Box::new(JsonSerializer::new(out.clone())), 2, schema.clone());
        let pipeline =
            PipelineBuilder::new(&self.registry).diff(reference, candidate, Arc::new(writer))?;
        let summary = if self.config.concurrent_branches {
            pipeline.execute_concurrent(schema, dataset.rows)?
        } else {
            pipeline.execute(schema, dataset.rows)?
        };
        debug!(
            dataset = %dataset_id,
            rows = summary.rows_in,
            concurrent = self.config.concurrent_branches,
            "previewed diff"
        );
        Ok(Bytes::from(out.take()))
    }

    /// Ids of the columns the candidate step adds over the reference.
    pub fn created_columns(&self, request: &PreviewRequest) -> EngineResult<Vec<String>> {
        let content = self.preview_steps(request)?;
        Ok(parse_envelope(&content)?.schema.created_columns())
    }

    // -----------------------------------------------------------------------
    // Cache helpers
    // -----------------------------------------------------------------------

    fn format<'a>(&'a self, requested: Option<&'a str>) -> EngineResult<&'a str> {
        let format = requested.unwrap_or(&self.config.default_format);
        if format == JSON_FORMAT {
            Ok(format)
        } else {
            Err(EngineError::UnsupportedFormat(format.to_string()))
        }
    }

    fn result_key(
        &self,
        prep: &Preparation,
        step_id: &ObjectId,
        sample: Sample,
        format: &str,
        user_id: Option<&str>,
    ) -> CacheKey {
        let source = if *step_id == prep.head {
            ResultSource::Head
        } else {
            ResultSource::User
        };
        CacheKey::dataset(&prep.dataset_id)
            .preparation(&prep.id)
            .step(step_id.to_hex())
            .sample(sample)
            .format(format)
            .for_source(source, user_id)
    }

    fn cached(&self, key: &CacheKey) -> Option<Bytes> {
        match self.cache.read_all(key) {
            Ok(found) => found.map(Bytes::from),
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, recomputing");
                None
            }
        }
    }

    fn evict_quietly(&self, key: &CacheKey) {
        if let Err(e) = self.cache.evict(key) {
            warn!(key = %key, error = %e, "failed to evict cache entry");
        }
    }
}

fn parse_envelope(bytes: &[u8]) -> EngineResult<Dataset> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::MalformedResult(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_cache::InMemoryContentCache;
    use prep_pipeline::{ActionError, ActionResult};
    use prep_store::{InMemoryRepository, StoreError};
    use prep_types::{Column, Parameters, Row, SchemaRef};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::dataset::InMemoryDatasets;

    struct CountingDatasets {
        inner: InMemoryDatasets,
        opens: AtomicUsize,
    }

    impl DatasetSource for CountingDatasets {
        fn open(&self, dataset_id: &str, sample: Sample) -> EngineResult<Dataset> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(dataset_id, sample)
        }
    }

    fn param<'a>(p: &'a Parameters, key: &str) -> ActionResult<&'a String> {
        p.get(key)
            .ok_or_else(|| ActionError::new(format!("missing {key}")))
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(
            "uppercase",
            |mut row: Row, schema: SchemaRef, p: &Parameters| -> ActionResult<(Row, SchemaRef)> {
                let column = param(p, "column_id")?;
                if let Some(v) = row.get(column).map(str::to_uppercase) {
                    row.set(column.clone(), v);
                }
                Ok((row, schema))
            },
        );
        registry.register(
            "suffix",
            |mut row: Row, schema: SchemaRef, p: &Parameters| -> ActionResult<(Row, SchemaRef)> {
                let column = param(p, "column_id")?;
                let suffix = param(p, "value")?;
                if let Some(v) = row.get(column).map(|v| format!("{v}{suffix}")) {
                    row.set(column.clone(), v);
                }
                Ok((row, schema))
            },
        );
        registry.register(
            "rename",
            |row: Row, schema: SchemaRef, p: &Parameters| -> ActionResult<(Row, SchemaRef)> {
                let schema = schema
                    .with_renamed(param(p, "column_id")?, param(p, "name")?.clone())
                    .into_ref();
                Ok((row, schema))
            },
        );
        registry.register(
            "add_column",
            |mut row: Row, schema: SchemaRef, p: &Parameters| -> ActionResult<(Row, SchemaRef)> {
                let id = param(p, "column_id")?;
                row.set(id.clone(), "");
                let schema = schema
                    .with_column(Column::new(id.clone(), param(p, "name")?.clone()))
                    .into_ref();
                Ok((row, schema))
            },
        );
        registry.register(
            "explode",
            |_row: Row, _schema: SchemaRef, _p: &Parameters| -> ActionResult<(Row, SchemaRef)> {
                Err(ActionError::new("boom"))
            },
        );
        registry
    }

    struct Fixture {
        engine: PreparationEngine,
        cache: Arc<InMemoryContentCache>,
        datasets: Arc<CountingDatasets>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let datasets = Arc::new(CountingDatasets {
            inner: InMemoryDatasets::new(),
            opens: AtomicUsize::new(0),
        });
        datasets
            .inner
            .insert(
                "ds",
                Dataset::new(
                    Schema::new(vec![Column::new("A", "A")]),
                    vec![Row::from_values([("A", "x")]), Row::from_values([("A", "y")])],
                ),
            )
            .unwrap();
        let cache = Arc::new(InMemoryContentCache::new());
        let engine = PreparationEngine::new(
            Arc::new(InMemoryRepository::new()),
            cache.clone(),
            registry(),
            datasets.clone(),
            config,
        )
        .unwrap();
        Fixture {
            engine,
            cache,
            datasets,
        }
    }

    fn uppercase() -> Action {
        Action::new("uppercase").on_column("A")
    }

    fn text(bytes: &Bytes) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn head_execution_is_computed_then_cached() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "clean", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        let first = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();
        assert!(!first.cached);
        assert_eq!(
            text(&first.content),
            r#"{"records":[{"A":"X","__rowId":0},{"A":"Y","__rowId":1}],"metadata":{"columns":[{"id":"A","name":"A","type":"string","domain":""}]}}"#
        );

        let second = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();
        assert!(second.cached);
        assert_eq!(second.content, first.content);
        assert_eq!(f.datasets.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn head_result_is_shared_between_users() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "clean", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        f.engine
            .execute(&ExecuteRequest::head(&prep.id).user("alice"))
            .unwrap();
        let bob = f
            .engine
            .execute(&ExecuteRequest::head(&prep.id).user("bob"))
            .unwrap();
        assert!(bob.cached);
    }

    #[test]
    fn dataset_ids_with_delimiters_are_cached() {
        let f = fixture(EngineConfig::sequential());
        f.datasets
            .inner
            .insert(
                "my_data.v2",
                Dataset::new(
                    Schema::new(vec![Column::new("A", "A")]),
                    vec![Row::from_values([("A", "x")])],
                ),
            )
            .unwrap();
        let prep = f.engine.create_preparation("my_data.v2", "p", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        assert!(!f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap().cached);
        assert!(f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap().cached);
        f.engine.metadata(&prep.id, StepRef::Head, None).unwrap();
        assert_eq!(f.datasets.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn historical_steps_are_cached_per_user() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "clean", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        let request = ExecuteRequest::head(&prep.id).at(StepRef::Origin);
        let alice = f.engine.execute(&request.clone().user("alice")).unwrap();
        assert!(!alice.cached);
        assert_eq!(
            text(&alice.content),
            r#"{"records":[{"A":"x","__rowId":0},{"A":"y","__rowId":1}],"metadata":{"columns":[{"id":"A","name":"A","type":"string","domain":""}]}}"#
        );
        assert!(f.engine.execute(&request.clone().user("alice")).unwrap().cached);
        assert!(!f.engine.execute(&request.user("bob")).unwrap().cached);
    }

    #[test]
    fn failed_run_leaves_no_cache_entry() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "broken", "alice").unwrap();
        let head = f
            .engine
            .append_actions(&prep.id, vec![Action::new("explode")])
            .unwrap();

        let err = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(_)));

        let key = CacheKey::dataset("ds")
            .preparation(&prep.id)
            .step(head.to_hex())
            .format("json");
        assert!(!f.cache.has(&key).unwrap());
        assert!(!f.cache.has(&key.metadata()).unwrap());
    }

    #[test]
    fn unknown_actions_are_rejected_before_they_are_versioned() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        assert!(matches!(
            f.engine.append_actions(&prep.id, vec![Action::new("nope")]),
            Err(EngineError::Pipeline(_))
        ));
        assert_eq!(f.engine.history(&prep.id, None).unwrap().len(), 1);
    }

    #[test]
    fn incremental_execution_continues_from_cached_parent() {
        let f = fixture(EngineConfig {
            incremental: true,
            ..EngineConfig::sequential()
        });
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();
        f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();

        f.engine
            .append_actions(
                &prep.id,
                vec![Action::new("suffix").on_column("A").with_parameter("value", "!")],
            )
            .unwrap();
        let result = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();

        assert_eq!(f.datasets.opens.load(Ordering::SeqCst), 1);
        assert_eq!(
            text(&result.content),
            r#"{"records":[{"A":"X!","__rowId":0},{"A":"Y!","__rowId":1}],"metadata":{"columns":[{"id":"A","name":"A","type":"string","domain":""}]}}"#
        );
    }

    #[test]
    fn metadata_is_served_from_the_writer_published_schema() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        f.engine
            .append_actions(
                &prep.id,
                vec![Action::new("rename").on_column("A").with_parameter("name", "first")],
            )
            .unwrap();

        let schema = f.engine.metadata(&prep.id, StepRef::Head, None).unwrap();
        assert_eq!(schema.columns()[0].name, "first");
        assert_eq!(f.datasets.opens.load(Ordering::SeqCst), 1);

        f.engine.metadata(&prep.id, StepRef::Head, None).unwrap();
        assert_eq!(f.datasets.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preview_marks_changed_cells() {
        for concurrent in [false, true] {
            let f = fixture(EngineConfig {
                concurrent_branches: concurrent,
                ..EngineConfig::sequential()
            });
            let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
            f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

            let out = f
                .engine
                .preview_steps(&PreviewRequest::new(&prep.id, StepRef::Origin, StepRef::Head))
                .unwrap();
            let json: Value = serde_json::from_slice(&out).unwrap();
            assert_eq!(
                json["records"],
                serde_json::json!([
                    {"A": "X", "__rowId": 0, "__diff": {"A": "update"}},
                    {"A": "Y", "__rowId": 1, "__diff": {"A": "update"}}
                ])
            );
        }
    }

    #[test]
    fn preview_can_be_restricted_to_row_ids() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        let out = f
            .engine
            .preview_steps(
                &PreviewRequest::new(&prep.id, StepRef::Origin, StepRef::Head).rows(vec![1]),
            )
            .unwrap();
        let json: Value = serde_json::from_slice(&out).unwrap();
        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["A"], "Y");
    }

    #[test]
    fn created_columns_come_from_the_schema_diff() {
        let f = fixture(EngineConfig::default());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        f.engine
            .append_actions(
                &prep.id,
                vec![Action::new("add_column").on_column("B").with_parameter("name", "B")],
            )
            .unwrap();

        let created = f
            .engine
            .created_columns(&PreviewRequest::new(&prep.id, StepRef::Origin, StepRef::Head))
            .unwrap();
        assert_eq!(created, vec!["B".to_string()]);
    }

    #[test]
    fn missing_step_fails_the_preview() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        let bogus = StepRef::Id(ObjectId::from_hash([7; 32]));
        assert!(matches!(
            f.engine
                .preview_steps(&PreviewRequest::new(&prep.id, StepRef::Origin, bogus)),
            Err(EngineError::Store(StoreError::StepNotFound(_)))
        ));
    }

    #[test]
    fn undo_and_redo_move_the_shared_result() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        let upper = f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();

        f.engine.undo(&prep.id).unwrap();
        let undone = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();
        assert!(text(&undone.content).contains(r#"{"A":"x""#));

        f.engine.set_head(&prep.id, StepRef::Id(upper)).unwrap();
        let redone = f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();
        assert_eq!(redone.step_id, upper);
        assert!(text(&redone.content).contains(r#"{"A":"X""#));
    }

    #[test]
    fn history_lists_added_actions_per_step() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        let rename = Action::new("rename").on_column("A").with_parameter("name", "a");
        f.engine
            .append_actions(&prep.id, vec![uppercase(), rename.clone()])
            .unwrap();

        let history = f.engine.history(&prep.id, None).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].added.is_empty());
        assert_eq!(history[1].added, vec![uppercase()]);
        assert_eq!(history[2].added, vec![rename]);
        assert_eq!(f.engine.history(&prep.id, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_preparation_evicts_its_results() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        let head = f.engine.append_actions(&prep.id, vec![uppercase()]).unwrap();
        f.engine.execute(&ExecuteRequest::head(&prep.id)).unwrap();

        let key = CacheKey::dataset("ds")
            .preparation(&prep.id)
            .step(head.to_hex())
            .format("json");
        assert!(f.cache.has(&key).unwrap());

        let report = f.engine.delete_preparation(&prep.id).unwrap();
        assert!(!f.cache.has(&key).unwrap());
        assert!(!f.cache.has(&key.metadata()).unwrap());
        assert_eq!(report.steps_removed, 1);
        assert!(f.engine.preparation(&prep.id).is_err());
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let f = fixture(EngineConfig::sequential());
        let prep = f.engine.create_preparation("ds", "p", "alice").unwrap();
        let mut request = ExecuteRequest::head(&prep.id);
        request.format = Some("csv".into());
        assert!(matches!(
            f.engine.execute(&request),
            Err(EngineError::UnsupportedFormat(format)) if format == "csv"
        ));
    }
}
