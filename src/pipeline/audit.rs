//! Audit pipeline: the submit API, the queued unit of work and the
//! requirement lifecycle around vectorization.

use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::{
    config::Config,
    embedding::{self, EmbeddingClient, FastembedClient},
    relations::{self, RelationStore, RequirementRelation},
    requirements::{self, AuditStatus, RequirementStore},
    storage::{BackendLocal, StorageManager},
    vector::VectorStore,
};

use super::errors::PipelineError;
use super::matcher::{SimilarRequirement, VectorMatcher};
use super::relation_builder::RelationBuilder;
use super::task_runner::{self, Status, Task, TaskReport};
use super::vectorizer::{BatchOutcome, VectorizeOutcome, VectorizeStatus, Vectorizer};

/// Shared state the queue workers operate on.
pub struct PipelineCore {
    pub requirements: Arc<dyn RequirementStore>,
    pub relations: Arc<dyn RelationStore>,
    pub vectors: Arc<VectorStore>,
    pub vectorizer: Vectorizer,
    pub matcher: VectorMatcher,
    pub relation_builder: RelationBuilder,
}

impl PipelineCore {
    /// The queued unit of work: vectorize the batch, commit per-id status,
    /// then build relations over the successful subset.
    pub fn run_vectorize_batch(
        &self,
        ids: &[u64],
        config: Arc<RwLock<Config>>,
    ) -> Result<TaskReport, PipelineError> {
        let outcome = self.vectorizer.vectorize_batch(ids);
        let succeeded = outcome.succeeded();
        let failed = outcome.failed();

        // per-id conditional commits: ids that left InFlight some other
        // way (e.g. deleted meanwhile) are skipped, not failed
        self.requirements
            .transition_each(&succeeded, AuditStatus::InFlight, AuditStatus::Confirmed)?;
        self.requirements
            .transition_each(&failed, AuditStatus::InFlight, AuditStatus::Pending)?;

        let (threshold, top_k) = {
            let config = config.read().unwrap();
            (
                config.matching.similarity_threshold,
                config.matching.match_count,
            )
        };

        let created = self
            .relation_builder
            .build_similar_relations(&succeeded, threshold, top_k)?;

        let vectorized = outcome
            .outcomes
            .iter()
            .filter(|o| o.status == VectorizeStatus::Vectorized)
            .count();
        let skipped = outcome
            .outcomes
            .iter()
            .filter(|o| o.status == VectorizeStatus::Skipped)
            .count();

        Ok(TaskReport {
            vectorized,
            skipped,
            failed: failed.len(),
            relations_created: created.len(),
        })
    }
}

/// Result of an audit submission.
#[derive(Debug, Clone, Serialize)]
pub enum SubmitOutcome {
    Accepted { requirement_ids: Vec<u64> },
    Rejected { reason: String },
}

pub struct AuditPipeline {
    core: Arc<PipelineCore>,
    pub storage_mgr: Arc<dyn StorageManager>,
    config: Arc<RwLock<Config>>,

    task_tx: Option<Arc<mpsc::Sender<Task>>>,
    task_queue_handle: Option<std::thread::JoinHandle<()>>,
}

impl AuditPipeline {
    /// Build the full pipeline from config: CSV stores, fastembed client
    /// and the persistent vector store under `base_path`.
    pub fn new(config: Arc<RwLock<Config>>, base_path: &str) -> anyhow::Result<Self> {
        let storage_mgr: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(base_path)?);

        let (model_name, download_timeout, index_file, lock_timeout) = {
            let config = config.read().unwrap();
            (
                config.embedding.model.clone(),
                Duration::from_secs(config.embedding.download_timeout_secs),
                config.index.file.clone(),
                Duration::from_secs(config.index.lock_timeout_secs),
            )
        };

        let embedder: Arc<dyn EmbeddingClient> = Arc::new(FastembedClient::new(
            &model_name,
            base_path.into(),
            Some(download_timeout),
        )?);

        let vectors = Arc::new(VectorStore::open(
            std::path::Path::new(base_path).join(index_file),
            embedding::model_fingerprint(&model_name),
            lock_timeout,
        )?);

        let requirements: Arc<dyn RequirementStore> = Arc::new(requirements::BackendCsv::load(
            &format!("{base_path}/requirements.csv"),
        )?);
        let relation_store: Arc<dyn RelationStore> =
            Arc::new(relations::BackendCsv::load(&format!("{base_path}/relations.csv"))?);

        Ok(Self::with_stores(
            embedder,
            requirements,
            relation_store,
            vectors,
            storage_mgr,
            config,
        ))
    }

    /// Assemble the pipeline from pre-built collaborators. Hosts with their
    /// own store implementations plug in here.
    pub fn with_stores(
        embedder: Arc<dyn EmbeddingClient>,
        requirements: Arc<dyn RequirementStore>,
        relations: Arc<dyn RelationStore>,
        vectors: Arc<VectorStore>,
        storage_mgr: Arc<dyn StorageManager>,
        config: Arc<RwLock<Config>>,
    ) -> Self {
        let matcher = VectorMatcher::new(embedder.clone(), vectors.clone(), requirements.clone());
        let vectorizer = Vectorizer::new(embedder, vectors.clone(), requirements.clone());
        let relation_builder = RelationBuilder::new(matcher.clone(), relations.clone());

        let core = Arc::new(PipelineCore {
            requirements,
            relations,
            vectors,
            vectorizer,
            matcher,
            relation_builder,
        });

        Self {
            core,
            storage_mgr,
            config,
            task_tx: None,
            task_queue_handle: None,
        }
    }

    /// Start the worker loop, restarting any task the previous run left
    /// undone in the queue dump.
    pub fn run_queue(&mut self) {
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        let handle = std::thread::spawn({
            let core = self.core.clone();
            let storage_mgr = self.storage_mgr.clone();
            let config = self.config.clone();

            let mut queue_dump = task_runner::read_queue_dump(&storage_mgr);
            let task_list = queue_dump.queue.clone();

            queue_dump.queue = Vec::new();
            task_runner::write_queue_dump(&storage_mgr, &queue_dump);

            std::thread::spawn({
                let task_tx = task_tx.clone();

                move || {
                    for task in task_list {
                        if let Status::Done = task.status {
                            continue;
                        }

                        log::info!("restarting interrupted task \"{:?}\"", task.task);
                        if let Err(err) = task_tx.send(task.task) {
                            log::error!("failed to initialize interrupted task: {err:?}");
                        }
                    }
                }
            });

            move || {
                task_runner::start_queue(task_rx, core, storage_mgr, config);
            }
        });

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(Arc::new(task_tx));
    }

    pub fn shutdown(&self) {
        if let Some(task_tx) = self.task_tx.as_ref() {
            if let Err(err) = task_tx.send(Task::Shutdown) {
                log::error!("{err}");
            }
        }
    }

    pub fn wait_queue_finish(&mut self) {
        if let Some(handle) = self.task_queue_handle.take() {
            if let Err(err) = handle.join() {
                log::error!("task queue panicked: {err:?}");
            }
        }
    }

    /// Submit a batch for audit vectorization.
    ///
    /// The whole batch flips Pending -> InFlight in one atomic conditional
    /// transition; any id missing or not Pending rejects the batch
    /// untouched. Acceptance enqueues exactly one durable task.
    pub fn submit_for_vectorization(&self, ids: &[u64]) -> SubmitOutcome {
        if ids.is_empty() {
            return SubmitOutcome::Rejected {
                reason: "no requirement ids given".to_string(),
            };
        }

        if let Err(err) = self.core.requirements.transition_all(
            ids,
            AuditStatus::Pending,
            AuditStatus::InFlight,
        ) {
            return SubmitOutcome::Rejected {
                reason: err.to_string(),
            };
        }

        let enqueued = self
            .task_tx
            .as_ref()
            .map(|tx| {
                tx.send(Task::VectorizeBatch {
                    requirement_ids: ids.to_vec(),
                })
                .is_ok()
            })
            .unwrap_or(false);

        if !enqueued {
            // the flip must not outlive a failed enqueue
            if let Err(err) = self.core.requirements.transition_each(
                ids,
                AuditStatus::InFlight,
                AuditStatus::Pending,
            ) {
                log::error!("failed to revert submission of {ids:?}: {err}");
            }
            return SubmitOutcome::Rejected {
                reason: "task queue is not running".to_string(),
            };
        }

        log::info!("accepted {} requirements for vectorization", ids.len());
        SubmitOutcome::Accepted {
            requirement_ids: ids.to_vec(),
        }
    }

    pub fn vectorize_one(&self, id: u64) -> VectorizeOutcome {
        self.core.vectorizer.vectorize_one(id)
    }

    pub fn vectorize_batch(&self, ids: &[u64]) -> BatchOutcome {
        self.core.vectorizer.vectorize_batch(ids)
    }

    pub fn revectorize(&self, id: u64) -> Result<(), PipelineError> {
        self.core.vectorizer.revectorize(id)
    }

    pub fn vectorize_by_document(&self, document_id: u64) -> Result<BatchOutcome, PipelineError> {
        self.core.vectorizer.vectorize_by_document(document_id)
    }

    pub fn find_similar_by_content(
        &self,
        content: &str,
        threshold: Option<f32>,
        top_k: Option<usize>,
    ) -> Result<Vec<SimilarRequirement>, PipelineError> {
        let (threshold, top_k) = self.matching_params(threshold, top_k);
        self.core
            .matcher
            .find_similar_by_content(content, threshold, top_k)
    }

    pub fn find_similar_by_requirement_id(
        &self,
        id: u64,
        threshold: Option<f32>,
        top_k: Option<usize>,
    ) -> Result<Vec<SimilarRequirement>, PipelineError> {
        let (threshold, top_k) = self.matching_params(threshold, top_k);
        self.core
            .matcher
            .find_similar_by_requirement_id(id, threshold, top_k)
    }

    pub fn build_similar_relations(
        &self,
        ids: &[u64],
    ) -> Result<Vec<RequirementRelation>, PipelineError> {
        let (threshold, top_k) = self.matching_params(None, None);
        self.core
            .relation_builder
            .build_similar_relations(ids, threshold, top_k)
    }

    /// Cascade delete: vector out of the index (absence tolerated),
    /// relations soft-deleted in both directions, then the row itself.
    pub fn delete_requirement(&self, id: u64) -> Result<(), PipelineError> {
        self.core
            .requirements
            .get(id)?
            .ok_or(PipelineError::NotFound(id))?;

        self.core.vectors.remove(id)?;

        let removed_relations = self.core.relations.delete_for_requirement(id)?;
        self.core.requirements.delete(id)?;

        log::info!("deleted requirement {id} and {removed_relations} relations");

        Ok(())
    }

    pub fn core(&self) -> Arc<PipelineCore> {
        self.core.clone()
    }

    pub fn config(&self) -> Arc<RwLock<Config>> {
        self.config.clone()
    }

    fn matching_params(&self, threshold: Option<f32>, top_k: Option<usize>) -> (f32, usize) {
        let config = self.config.read().unwrap();
        (
            threshold.unwrap_or(config.matching.similarity_threshold),
            top_k.unwrap_or(config.matching.match_count),
        )
    }
}
