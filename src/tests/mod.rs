//! Cross-module flow tests with a deterministic embedding double.

mod pipeline;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::sleep;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::embedding::{model_fingerprint, EmbeddingClient, EmbeddingError};
use crate::pipeline::AuditPipeline;
use crate::requirements::{self, AuditStatus, RequirementCreate, RequirementStore};
use crate::storage::{BackendLocal, StorageManager};
use crate::vector::VectorStore;

pub const TEST_MODEL: &str = "static-test-model";

/// Deterministic embedding double: fixed vectors per content string,
/// programmable failures, hash-derived fallback for anything else.
pub struct StaticEmbedder {
    dimensions: usize,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    failing: Mutex<HashSet<String>>,
}

impl StaticEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn set(&self, content: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), self.dimensions);
        self.vectors
            .lock()
            .unwrap()
            .insert(content.to_string(), vector);
    }

    pub fn fail_on(&self, content: &str) {
        self.failing.lock().unwrap().insert(content.to_string());
    }
}

impl EmbeddingClient for StaticEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.failing.lock().unwrap().contains(text) {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "static failure for {text:?}"
            )));
        }

        if let Some(vector) = self.vectors.lock().unwrap().get(text) {
            return Ok(vector.clone());
        }

        // deterministic fallback so unregistered content still embeds
        let digest = Sha256::digest(text.as_bytes());
        Ok((0..self.dimensions)
            .map(|i| digest[i % digest.len()] as f32 + 1.0)
            .collect())
    }

    fn model_name(&self) -> &str {
        TEST_MODEL
    }
}

/// A fully assembled pipeline over temp-dir stores, with handles to every
/// collaborator the tests poke at directly.
pub struct Harness {
    pub pipeline: AuditPipeline,
    pub embedder: Arc<StaticEmbedder>,
    pub requirements: Arc<requirements::BackendCsv>,
    pub relations: Arc<crate::relations::BackendCsv>,
    pub vectors: Arc<VectorStore>,
    _tmp: tempfile::TempDir,
}

pub fn harness(dimensions: usize) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().to_str().unwrap();

    let embedder = Arc::new(StaticEmbedder::new(dimensions));
    let requirements =
        Arc::new(requirements::BackendCsv::load(&format!("{base}/requirements.csv")).unwrap());
    let relation_store =
        Arc::new(crate::relations::BackendCsv::load(&format!("{base}/relations.csv")).unwrap());
    let vectors = Arc::new(
        VectorStore::open(
            tmp.path().join("requirement_vectors.bin"),
            model_fingerprint(TEST_MODEL),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let storage_mgr: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(base).unwrap());
    let config = Arc::new(RwLock::new(Config::default()));

    let pipeline = AuditPipeline::with_stores(
        embedder.clone(),
        requirements.clone(),
        relation_store.clone(),
        vectors.clone(),
        storage_mgr,
        config,
    );

    Harness {
        pipeline,
        embedder,
        requirements,
        relations: relation_store,
        vectors,
        _tmp: tmp,
    }
}

pub fn create_requirement(store: &Arc<requirements::BackendCsv>, title: &str, content: &str) -> u64 {
    store
        .create(RequirementCreate {
            project_id: 1,
            document_id: 1,
            requirement_title: title.to_string(),
            requirement_content: content.to_string(),
            module: "auth".to_string(),
        })
        .unwrap()
        .id
}

/// Poll until no listed id is still InFlight.
pub fn wait_until_settled(store: &Arc<requirements::BackendCsv>, ids: &[u64]) {
    for _ in 0..200 {
        let settled = ids.iter().all(|id| {
            store
                .get(*id)
                .unwrap()
                .map(|r| r.status != AuditStatus::InFlight)
                .unwrap_or(true)
        });
        if settled {
            return;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("batch {ids:?} did not settle in time");
}
