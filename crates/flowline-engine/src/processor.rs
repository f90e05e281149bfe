//! Processor pipeline
//!
//! The periodic orchestrator that pulls one page from each configured
//! source, maps and validates the records, persists the result as a
//! write-once [`Package`] and advances the flow's [`ProcessState`].
//!
//! One tick, in order:
//!
//! 1. Take the tick guard, or skip the tick when a run is still in flight.
//! 2. Load the process state.
//! 3. For each source, in configuration order: pull the page following the
//!    source's last checkpoint, map each record and apply entity rules,
//!    apply collection rules to the valid set, save the package and append
//!    the finished run.
//! 4. Save the process state, whether or not step 3 failed.

use async_trait::async_trait;
use flowline_common::{FlowError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::engine::{ErrorPolicy, ItemProcessor, ProcessorEngine};
use crate::model::{
    Checkpoint, FlowId, InvalidRecord, Package, ProcessError, ProcessFlowState, ProcessState,
    ValidationError,
};
use crate::retry::RetryConfig;
use crate::rules::{CollectionRule, EntityRule};
use crate::schedule::{spawn_interval, ScheduleHandle, TickGuard};
use crate::source::{QuerySource, RecordSource};
use crate::storage::StateRepository;

/// Maps one source record to the output type
pub type Mapper<In, Out> = Arc<dyn Fn(&In) -> anyhow::Result<Out> + Send + Sync>;

/// Per-processor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSettings {
    pub flow_id: FlowId,
    /// Output entity type; names the process state document
    pub entity_type: String,
    /// Identity under which this processor reads source ledgers
    pub consumer_id: String,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub policy: ErrorPolicy,
    /// Applied to package persistence
    pub retry: RetryConfig,
}

impl ProcessorSettings {
    pub fn new(flow_id: FlowId, entity_type: impl Into<String>, config: &EngineConfig) -> Self {
        let entity_type = entity_type.into();
        Self {
            consumer_id: format!("{}-processor", entity_type),
            flow_id,
            entity_type,
            page_size: config.page_size,
            poll_interval: config.poll_interval(),
            policy: config.error_policy(),
            retry: config.retry,
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(FlowError::config("poll interval must be greater than 0"));
        }
        if self.page_size == 0 {
            return Err(FlowError::config("page size must be greater than 0"));
        }
        if self.consumer_id.is_empty() {
            return Err(FlowError::config("consumer id cannot be empty"));
        }
        Ok(())
    }
}

/// Result of one call to [`Processor::run_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run went through every source; lists the packages written
    Completed { packages: Vec<PathBuf> },
    /// A previous run was still in flight; nothing was done
    Skipped,
}

pub struct Processor<Out, In> {
    settings: ProcessorSettings,
    repo: StateRepository,
    sources: Vec<QuerySource<In>>,
    mapper: Mapper<In, Out>,
    entity_rules: Vec<Arc<dyn EntityRule<Out>>>,
    collection_rules: Vec<Arc<dyn CollectionRule<Out>>>,
    engine: ProcessorEngine,
    guard: TickGuard,
}

/// Builder for [`Processor`]
pub struct ProcessorBuilder<Out, In> {
    settings: ProcessorSettings,
    repo: StateRepository,
    sources: Vec<QuerySource<In>>,
    mapper: Mapper<In, Out>,
    entity_rules: Vec<Arc<dyn EntityRule<Out>>>,
    collection_rules: Vec<Arc<dyn CollectionRule<Out>>>,
    source_retry: Option<RetryConfig>,
}

impl<Out, In> ProcessorBuilder<Out, In>
where
    Out: Serialize + Send + Sync + 'static,
    In: Send + Sync + 'static,
{
    /// Add a ready-made source adapter
    pub fn with_source(mut self, source: QuerySource<In>) -> Self {
        self.sources.push(source);
        self
    }

    /// Wrap `source` in an adapter sharing this processor's flow and repository
    pub fn with_record_source(
        mut self,
        entity_type: impl Into<String>,
        source: Arc<dyn RecordSource<In>>,
    ) -> Self {
        let mut adapter = QuerySource::new(
            self.settings.flow_id.clone(),
            entity_type,
            source,
            self.repo.clone(),
        );
        if let Some(retry) = self.source_retry {
            adapter = adapter.with_retry(retry);
        }
        self.sources.push(adapter);
        self
    }

    /// Retry policy for adapters added later through [`Self::with_record_source`]
    pub fn with_source_retry(mut self, retry: RetryConfig) -> Self {
        self.source_retry = Some(retry);
        self
    }

    pub fn with_entity_rule(mut self, rule: impl EntityRule<Out> + 'static) -> Self {
        self.entity_rules.push(Arc::new(rule));
        self
    }

    pub fn with_collection_rule(mut self, rule: impl CollectionRule<Out> + 'static) -> Self {
        self.collection_rules.push(Arc::new(rule));
        self
    }

    pub fn build(self) -> Result<Processor<Out, In>> {
        self.settings.validate()?;
        if self.sources.is_empty() {
            return Err(FlowError::config(format!(
                "processor '{}' has no sources",
                self.settings.entity_type
            )));
        }

        Ok(Processor {
            engine: ProcessorEngine::new(self.settings.policy),
            settings: self.settings,
            repo: self.repo,
            sources: self.sources,
            mapper: self.mapper,
            entity_rules: self.entity_rules,
            collection_rules: self.collection_rules,
            guard: TickGuard::new(),
        })
    }
}

impl<Out, In> Processor<Out, In>
where
    Out: Serialize + Send + Sync + 'static,
    In: Send + Sync + 'static,
{
    pub fn builder(
        settings: ProcessorSettings,
        repo: StateRepository,
        mapper: impl Fn(&In) -> anyhow::Result<Out> + Send + Sync + 'static,
    ) -> ProcessorBuilder<Out, In> {
        ProcessorBuilder {
            settings,
            repo,
            sources: Vec::new(),
            mapper: Arc::new(mapper),
            entity_rules: Vec::new(),
            collection_rules: Vec::new(),
            source_retry: None,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_busy()
    }

    /// Current persisted process state
    pub async fn state(&self) -> Result<ProcessState> {
        self.repo
            .load_process_state(&self.settings.entity_type, &self.settings.flow_id)
            .await
    }

    /// Run the pipeline once, unless a run is already in flight
    #[instrument(skip(self), fields(flow = %self.settings.flow_id, entity_type = %self.settings.entity_type))]
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Previous run still in flight, skipping tick");
            return Ok(RunOutcome::Skipped);
        };

        let mut state = self.state().await?;
        let mut packages = Vec::new();

        let result = self.run_sources(&mut state, &mut packages).await;
        let saved = self
            .repo
            .save_process_state(&self.settings.entity_type, &state)
            .await;

        match (result, saved) {
            (Err(err), saved) => {
                if let Err(save_err) = saved {
                    error!(error = %save_err, "Failed to save process state after failed run");
                }
                Err(err)
            },
            (Ok(()), Err(save_err)) => Err(save_err),
            (Ok(()), Ok(())) => {
                info!(
                    packages = packages.len(),
                    checkpoint = %state.checkpoint,
                    "Run completed"
                );
                Ok(RunOutcome::Completed { packages })
            },
        }
    }

    /// Run on a timer until the returned handle is stopped
    pub fn start(self: Arc<Self>) -> Result<ScheduleHandle> {
        self.settings.validate()?;

        let name = format!("processor:{}", self.settings.entity_type);
        let period = self.settings.poll_interval;
        let processor = self;

        Ok(spawn_interval(name, period, move || {
            let processor = Arc::clone(&processor);
            async move {
                match processor.run_once().await {
                    Ok(RunOutcome::Completed { packages }) => {
                        debug!(packages = packages.len(), "Tick finished");
                    },
                    Ok(RunOutcome::Skipped) => {},
                    Err(e) => {
                        error!(
                            flow = %processor.settings.flow_id,
                            entity_type = %processor.settings.entity_type,
                            error = %e,
                            "Processor run failed"
                        );
                    },
                }
            }
        }))
    }

    async fn run_sources(&self, state: &mut ProcessState, packages: &mut Vec<PathBuf>) -> Result<()> {
        for source in &self.sources {
            if let Some(package) = self.run_source(source, state).await? {
                packages.push(package);
            }
        }
        Ok(())
    }

    /// Pull, partition and persist one page of `source`
    async fn run_source(&self, source: &QuerySource<In>, state: &mut ProcessState) -> Result<Option<PathBuf>> {
        let checkpoint_from = state.last_checkpoint(source.entity_type());
        let page = source
            .get(&self.settings.consumer_id, checkpoint_from, self.settings.page_size)
            .await?;

        if page.is_empty() {
            debug!(source = source.entity_type(), "No new data");
            return Ok(None);
        }

        let mut run = ProcessFlowState::begin(self.settings.flow_id.clone(), source.entity_type());
        let checkpoint_to = page.checkpoint_to;
        let input = page.into_records();
        let total = input.len();

        let mut page_run = PageRun {
            processor: self,
            package: Package::new(
                self.settings.flow_id.clone(),
                state.next_step(),
                source.entity_type(),
            ),
            checkpoint: checkpoint_to,
            written: None,
        };

        let summary = self.engine.process(input, &mut page_run).await;

        if summary.aborted {
            let reason = page_run
                .package
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "record processing failed".to_string());
            warn!(source = source.entity_type(), "Run aborted, checkpoint not advanced");
            return Err(FlowError::Aborted(reason));
        }

        if let Some(err) = summary.commit_error {
            return Err(match err.downcast::<FlowError>() {
                Ok(flow_err) => flow_err,
                Err(other) => FlowError::Commit(format!("{:#}", other)),
            });
        }

        let package = page_run.package;
        let key = page_run
            .written
            .ok_or_else(|| FlowError::Commit("package was not written".to_string()))?;

        run.entities_processed = summary.processed;
        run.entities_invalid = package.invalid.len();
        run.error_count = package.errors.len();
        run.package = Some(key.clone());
        state.record_run(run.finish(checkpoint_to));

        info!(
            source = source.entity_type(),
            records = total,
            valid = package.valid.len(),
            invalid = package.invalid.len(),
            errors = package.errors.len(),
            step = package.step,
            checkpoint = %checkpoint_to,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Page processed"
        );

        Ok(Some(key))
    }
}

/// Partitions one page into a package and persists it on commit
struct PageRun<'a, Out, In> {
    processor: &'a Processor<Out, In>,
    package: Package<Out>,
    checkpoint: Checkpoint,
    written: Option<PathBuf>,
}

#[async_trait]
impl<'a, Out, In> ItemProcessor<In> for PageRun<'a, Out, In>
where
    Out: Serialize + Send + Sync + 'static,
    In: Send + Sync + 'static,
{
    async fn process(&mut self, _index: usize, item: &In) -> anyhow::Result<Vec<ProcessError>> {
        let record = (self.processor.mapper)(item)?;

        let errors: Vec<ValidationError> = self
            .processor
            .entity_rules
            .iter()
            .filter_map(|rule| {
                rule.check(&record).err().map(|message| ValidationError {
                    rule: rule.name().to_string(),
                    message,
                })
            })
            .collect();

        if errors.is_empty() {
            self.package.valid.push(record);
        } else {
            self.package.invalid.push(InvalidRecord { record, errors });
        }

        // Invalid records still count as processed
        Ok(Vec::new())
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        for rule in &self.processor.collection_rules {
            if let Err(message) = rule.check(&self.package.valid) {
                warn!(rule = rule.name(), %message, "Collection rule violated");
                return Err(FlowError::rule_violation(rule.name(), message).into());
            }
        }

        let repo = &self.processor.repo;
        let package = &self.package;
        let checkpoint = self.checkpoint;
        let mut retry = self
            .processor
            .settings
            .retry
            .build::<FlowError>()
            .with_predicate(|e| !matches!(e, FlowError::AlreadyExists(_)));

        let key = retry
            .invoke(|| repo.save_package(package, checkpoint))
            .await?;

        self.written = Some(key);
        Ok(())
    }

    fn on_error(&mut self, index: usize, _item: &In, error: &anyhow::Error) {
        self.package
            .errors
            .push(ProcessError::exception(Some(index), format!("{:#}", error)));
    }
}
