use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    io::ErrorKind,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Instant,
};

/// Audit state machine owned by this subsystem.
///
/// Pending -> InFlight happens on audit submission, InFlight -> Confirmed
/// on successful vectorization, InFlight -> Pending on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditStatus {
    #[default]
    Pending,
    InFlight,
    Confirmed,
}

impl Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditStatus::Pending => "pending",
            AuditStatus::InFlight => "in_flight",
            AuditStatus::Confirmed => "confirmed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AuditStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuditStatus::Pending),
            "in_flight" => Ok(AuditStatus::InFlight),
            "confirmed" => Ok(AuditStatus::Confirmed),
            other => Err(anyhow!("unknown audit status: {other}")),
        }
    }
}

/// Test-case coverage lifecycle owned by the downstream generation
/// pipeline. This subsystem initializes it and never transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoverageStatus {
    #[default]
    NotStarted,
    Generating,
    Covered,
}

impl Display for CoverageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoverageStatus::NotStarted => "not_started",
            CoverageStatus::Generating => "generating",
            CoverageStatus::Covered => "covered",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CoverageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(CoverageStatus::NotStarted),
            "generating" => Ok(CoverageStatus::Generating),
            "covered" => Ok(CoverageStatus::Covered),
            other => Err(anyhow!("unknown coverage status: {other}")),
        }
    }
}

/// An audited requirement row. The id doubles as the vector id in the
/// index; `is_vectorized` is a cache of index membership, the index itself
/// is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: u64,
    pub project_id: u64,
    pub document_id: u64,

    pub requirement_title: String,
    pub requirement_content: String,
    pub module: String,

    pub status: AuditStatus,
    pub coverage: CoverageStatus,
    pub is_vectorized: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequirementCreate {
    pub project_id: u64,
    pub document_id: u64,
    pub requirement_title: String,
    pub requirement_content: String,
    #[serde(default)]
    pub module: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequirementUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

/// Filters combine with AND; live (non-deleted) rows only.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequirementQuery {
    pub id: Option<u64>,
    pub ids: Option<Vec<u64>>,
    pub project_id: Option<u64>,
    pub document_id: Option<u64>,
    pub status: Option<AuditStatus>,
    pub is_vectorized: Option<bool>,

    #[serde(default)]
    pub limit: Option<usize>,
}

/// A conditional status update failed its precondition.
#[derive(thiserror::Error, Debug)]
pub enum TransitionError {
    #[error("requirement {0} not found")]
    NotFound(u64),

    #[error("requirement {id} is {actual}, expected {expected}")]
    WrongStatus {
        id: u64,
        actual: AuditStatus,
        expected: AuditStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub trait RequirementStore: Send + Sync {
    fn create(&self, create: RequirementCreate) -> anyhow::Result<Requirement>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Requirement>>;
    fn search(&self, query: RequirementQuery) -> anyhow::Result<Vec<Requirement>>;
    fn update(&self, id: u64, update: RequirementUpdate) -> anyhow::Result<Requirement>;

    /// Flip the vectorized flag. The vectorizer is the sole caller.
    fn set_vectorized(&self, id: u64, vectorized: bool) -> anyhow::Result<()>;

    /// Atomically transition every id from `from` to `to`. All-or-nothing:
    /// any missing id or wrong current status fails the whole batch
    /// without mutating anything.
    fn transition_all(
        &self,
        ids: &[u64],
        from: AuditStatus,
        to: AuditStatus,
    ) -> Result<(), TransitionError>;

    /// Transition each id currently in `from` to `to`, skipping the rest.
    /// Returns the ids actually flipped.
    fn transition_each(
        &self,
        ids: &[u64],
        from: AuditStatus,
        to: AuditStatus,
    ) -> anyhow::Result<Vec<u64>>;

    /// Soft delete.
    fn delete(&self, id: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendCsv {
    list: Arc<RwLock<Vec<Requirement>>>,
    path: String,
}

const CSV_HEADERS: [&str; 12] = [
    "id",
    "project_id",
    "document_id",
    "requirement_title",
    "requirement_content",
    "module",
    "status",
    "coverage",
    "is_vectorized",
    "created_at",
    "updated_at",
    "deleted_at",
];

fn parse_timestamp(value: &str, field: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("couldnt parse record {field}: {e}"))?
        .with_timezone(&Utc))
}

impl BackendCsv {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("creating new requirement database at {path}");
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;
        let iter = csv_reader.records();

        let mut rows = vec![];
        for record in iter {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let project_id = record
                .get(1)
                .ok_or(anyhow!("couldnt get record project_id"))?
                .parse::<u64>()?;
            let document_id = record
                .get(2)
                .ok_or(anyhow!("couldnt get record document_id"))?
                .parse::<u64>()?;
            let requirement_title = record
                .get(3)
                .ok_or(anyhow!("couldnt get record requirement_title"))?
                .to_string();
            let requirement_content = record
                .get(4)
                .ok_or(anyhow!("couldnt get record requirement_content"))?
                .to_string();
            let module = record
                .get(5)
                .ok_or(anyhow!("couldnt get record module"))?
                .to_string();
            let status = record
                .get(6)
                .ok_or(anyhow!("couldnt get record status"))?
                .parse::<AuditStatus>()?;
            let coverage = record
                .get(7)
                .ok_or(anyhow!("couldnt get record coverage"))?
                .parse::<CoverageStatus>()?;
            let is_vectorized = record
                .get(8)
                .ok_or(anyhow!("couldnt get record is_vectorized"))?
                == "true";
            let created_at = parse_timestamp(
                record.get(9).ok_or(anyhow!("couldnt get record created_at"))?,
                "created_at",
            )?;
            let updated_at = parse_timestamp(
                record
                    .get(10)
                    .ok_or(anyhow!("couldnt get record updated_at"))?,
                "updated_at",
            )?;
            let deleted_at = record
                .get(11)
                .ok_or(anyhow!("couldnt get record deleted_at"))?;
            let deleted_at = if deleted_at.is_empty() {
                None
            } else {
                Some(parse_timestamp(deleted_at, "deleted_at")?)
            };

            rows.push(Requirement {
                id,
                project_id,
                document_id,
                requirement_title,
                requirement_content,
                module,
                status,
                coverage,
                is_vectorized,
                created_at,
                updated_at,
                deleted_at,
            });
        }

        log::debug!(
            "took {}ms to read requirements csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(BackendCsv {
            list: Arc::new(RwLock::new(rows)),
            path: path.to_string(),
        })
    }

    fn save_locked(&self, rows: &[Requirement]) -> anyhow::Result<()> {
        let temp_path = format!("{}-tmp", &self.path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for row in rows.iter() {
            csv_wrt.write_record([
                &row.id.to_string(),
                &row.project_id.to_string(),
                &row.document_id.to_string(),
                &row.requirement_title,
                &row.requirement_content,
                &row.module,
                &row.status.to_string(),
                &row.coverage.to_string(),
                &row.is_vectorized.to_string(),
                &row.created_at.to_rfc3339(),
                &row.updated_at.to_rfc3339(),
                &row.deleted_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let rows = self.list.write().unwrap();
        self.save_locked(&rows)
    }
}

impl RequirementStore for BackendCsv {
    fn create(&self, create: RequirementCreate) -> anyhow::Result<Requirement> {
        let mut rows = self.list.write().unwrap();
        let id = rows.iter().map(|r| r.id).max().map(|id| id + 1).unwrap_or(1);

        let now = Utc::now();
        let row = Requirement {
            id,
            project_id: create.project_id,
            document_id: create.document_id,
            requirement_title: create.requirement_title,
            requirement_content: create.requirement_content,
            module: create.module,
            status: AuditStatus::Pending,
            coverage: CoverageStatus::NotStarted,
            is_vectorized: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        rows.push(row.clone());
        self.save_locked(&rows)?;

        Ok(row)
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Requirement>> {
        let rows = self.list.read().unwrap();
        Ok(rows
            .iter()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .cloned())
    }

    fn search(&self, query: RequirementQuery) -> anyhow::Result<Vec<Requirement>> {
        let rows = self.list.read().unwrap();

        let mut output = vec![];
        for row in rows.iter() {
            if row.deleted_at.is_some() {
                continue;
            }

            if let Some(id) = query.id {
                if row.id != id {
                    continue;
                }
            }

            if let Some(ids) = &query.ids {
                if !ids.contains(&row.id) {
                    continue;
                }
            }

            if let Some(project_id) = query.project_id {
                if row.project_id != project_id {
                    continue;
                }
            }

            if let Some(document_id) = query.document_id {
                if row.document_id != document_id {
                    continue;
                }
            }

            if let Some(status) = query.status {
                if row.status != status {
                    continue;
                }
            }

            if let Some(is_vectorized) = query.is_vectorized {
                if row.is_vectorized != is_vectorized {
                    continue;
                }
            }

            output.push(row.clone());

            let limit_reached =
                query.limit.is_some() && output.len() >= query.limit.unwrap_or_default();
            if query.id.is_some() || limit_reached {
                break;
            }
        }

        Ok(output)
    }

    fn update(&self, id: u64, update: RequirementUpdate) -> anyhow::Result<Requirement> {
        let mut rows = self.list.write().unwrap();

        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .ok_or_else(|| anyhow!("requirement {id} not found"))?;

        if let Some(title) = update.requirement_title {
            row.requirement_title = title;
        }
        if let Some(content) = update.requirement_content {
            row.requirement_content = content;
        }
        if let Some(module) = update.module {
            row.module = module;
        }
        row.updated_at = Utc::now();

        let result = row.clone();
        self.save_locked(&rows)?;

        Ok(result)
    }

    fn set_vectorized(&self, id: u64, vectorized: bool) -> anyhow::Result<()> {
        let mut rows = self.list.write().unwrap();

        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .ok_or_else(|| anyhow!("requirement {id} not found"))?;

        row.is_vectorized = vectorized;
        row.updated_at = Utc::now();

        self.save_locked(&rows)?;

        Ok(())
    }

    fn transition_all(
        &self,
        ids: &[u64],
        from: AuditStatus,
        to: AuditStatus,
    ) -> Result<(), TransitionError> {
        let mut rows = self.list.write().unwrap();

        // check every precondition before mutating anything
        for id in ids {
            let row = rows
                .iter()
                .find(|r| r.id == *id && r.deleted_at.is_none())
                .ok_or(TransitionError::NotFound(*id))?;

            if row.status != from {
                return Err(TransitionError::WrongStatus {
                    id: *id,
                    actual: row.status,
                    expected: from,
                });
            }
        }

        let now = Utc::now();
        for row in rows.iter_mut() {
            if ids.contains(&row.id) && row.deleted_at.is_none() {
                row.status = to;
                row.updated_at = now;
            }
        }

        self.save_locked(&rows).map_err(TransitionError::Store)?;

        Ok(())
    }

    fn transition_each(
        &self,
        ids: &[u64],
        from: AuditStatus,
        to: AuditStatus,
    ) -> anyhow::Result<Vec<u64>> {
        let mut rows = self.list.write().unwrap();

        let now = Utc::now();
        let mut flipped = vec![];
        for row in rows.iter_mut() {
            if ids.contains(&row.id) && row.deleted_at.is_none() && row.status == from {
                row.status = to;
                row.updated_at = now;
                flipped.push(row.id);
            }
        }

        if !flipped.is_empty() {
            self.save_locked(&rows)?;
        }

        Ok(flipped)
    }

    fn delete(&self, id: u64) -> anyhow::Result<()> {
        let mut rows = self.list.write().unwrap();

        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .ok_or_else(|| anyhow!("requirement {id} not found"))?;

        row.deleted_at = Some(Utc::now());

        self.save_locked(&rows)?;

        Ok(())
    }
}

#[cfg(test)]
impl BackendCsv {
    pub fn list(&self) -> Arc<RwLock<Vec<Requirement>>> {
        self.list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (BackendCsv, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("requirements.csv");
        let store = BackendCsv::load(path.to_str().unwrap()).unwrap();
        (store, tmp)
    }

    fn sample_create(title: &str) -> RequirementCreate {
        RequirementCreate {
            project_id: 1,
            document_id: 1,
            requirement_title: title.to_string(),
            requirement_content: format!("{title} content"),
            module: "auth".to_string(),
        }
    }

    #[test]
    fn test_create_and_get() {
        let (store, _tmp) = temp_store();

        let row = store.create(sample_create("login")).unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.status, AuditStatus::Pending);
        assert_eq!(row.coverage, CoverageStatus::NotStarted);
        assert!(!row.is_vectorized);

        let fetched = store.get(row.id).unwrap().unwrap();
        assert_eq!(fetched.requirement_title, "login");
    }

    #[test]
    fn test_csv_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("requirements.csv");
        let path = path.to_str().unwrap();

        {
            let store = BackendCsv::load(path).unwrap();
            let row = store.create(sample_create("persisted")).unwrap();
            store.set_vectorized(row.id, true).unwrap();
            store
                .transition_all(&[row.id], AuditStatus::Pending, AuditStatus::InFlight)
                .unwrap();
        }

        let reloaded = BackendCsv::load(path).unwrap();
        let row = reloaded.get(1).unwrap().unwrap();
        assert_eq!(row.requirement_title, "persisted");
        assert_eq!(row.status, AuditStatus::InFlight);
        assert!(row.is_vectorized);
    }

    #[test]
    fn test_soft_delete_hides_row() {
        let (store, _tmp) = temp_store();

        let row = store.create(sample_create("gone")).unwrap();
        store.delete(row.id).unwrap();

        assert!(store.get(row.id).unwrap().is_none());
        assert!(store.search(RequirementQuery::default()).unwrap().is_empty());

        // raw list still holds the soft-deleted row
        assert_eq!(store.list().read().unwrap().len(), 1);
    }

    #[test]
    fn test_transition_all_is_all_or_nothing() {
        let (store, _tmp) = temp_store();

        let a = store.create(sample_create("a")).unwrap();
        let b = store.create(sample_create("b")).unwrap();
        store
            .transition_all(&[b.id], AuditStatus::Pending, AuditStatus::InFlight)
            .unwrap();

        // b is no longer Pending, so the whole batch must fail
        let result =
            store.transition_all(&[a.id, b.id], AuditStatus::Pending, AuditStatus::InFlight);
        assert!(matches!(
            result,
            Err(TransitionError::WrongStatus { id, .. }) if id == b.id
        ));

        // a was left untouched
        assert_eq!(store.get(a.id).unwrap().unwrap().status, AuditStatus::Pending);
    }

    #[test]
    fn test_transition_all_rejects_missing_id() {
        let (store, _tmp) = temp_store();

        let a = store.create(sample_create("a")).unwrap();
        let result =
            store.transition_all(&[a.id, 999], AuditStatus::Pending, AuditStatus::InFlight);
        assert!(matches!(result, Err(TransitionError::NotFound(999))));
        assert_eq!(store.get(a.id).unwrap().unwrap().status, AuditStatus::Pending);
    }

    #[test]
    fn test_transition_each_skips_non_matching() {
        let (store, _tmp) = temp_store();

        let a = store.create(sample_create("a")).unwrap();
        let b = store.create(sample_create("b")).unwrap();
        store
            .transition_all(&[a.id], AuditStatus::Pending, AuditStatus::InFlight)
            .unwrap();

        let flipped = store
            .transition_each(&[a.id, b.id], AuditStatus::InFlight, AuditStatus::Confirmed)
            .unwrap();

        assert_eq!(flipped, vec![a.id]);
        assert_eq!(
            store.get(a.id).unwrap().unwrap().status,
            AuditStatus::Confirmed
        );
        assert_eq!(store.get(b.id).unwrap().unwrap().status, AuditStatus::Pending);
    }

    #[test]
    fn test_transitions_leave_coverage_untouched() {
        let (store, _tmp) = temp_store();

        let a = store.create(sample_create("a")).unwrap();
        store
            .transition_all(&[a.id], AuditStatus::Pending, AuditStatus::InFlight)
            .unwrap();
        store
            .transition_each(&[a.id], AuditStatus::InFlight, AuditStatus::Confirmed)
            .unwrap();

        assert_eq!(
            store.get(a.id).unwrap().unwrap().coverage,
            CoverageStatus::NotStarted
        );
    }

    #[test]
    fn test_search_filters() {
        let (store, _tmp) = temp_store();

        let a = store.create(sample_create("a")).unwrap();
        let mut create_b = sample_create("b");
        create_b.document_id = 2;
        let b = store.create(create_b).unwrap();
        store.set_vectorized(b.id, true).unwrap();

        let by_doc = store
            .search(RequirementQuery {
                document_id: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_doc.len(), 1);
        assert_eq!(by_doc[0].id, b.id);

        let unvectorized = store
            .search(RequirementQuery {
                is_vectorized: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(unvectorized.len(), 1);
        assert_eq!(unvectorized[0].id, a.id);

        let by_ids = store
            .search(RequirementQuery {
                ids: Some(vec![a.id, b.id]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_ids.len(), 2);
    }
}
