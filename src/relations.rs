use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::Display,
    io::ErrorKind,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMethod {
    Vector,
    Manual,
}

impl Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchMethod::Vector => "vector",
            MatchMethod::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MatchMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(MatchMethod::Vector),
            "manual" => Ok(MatchMethod::Manual),
            other => Err(anyhow!("unknown match method: {other}")),
        }
    }
}

/// A directed, similarity-scored edge between two requirements. Vector
/// matches always create both directions together, so the relation is
/// logically symmetric even though stored as two rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementRelation {
    pub id: u64,
    pub source_requirement_id: u64,
    pub target_requirement_id: u64,
    pub similarity_score: f32,
    pub match_method: MatchMethod,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationCreate {
    pub source_requirement_id: u64,
    pub target_requirement_id: u64,
    pub similarity_score: f32,
    pub match_method: MatchMethod,
}

pub trait RelationStore: Send + Sync {
    /// True when a live row exists for the directed (source, target) pair.
    fn exists(&self, source: u64, target: u64) -> anyhow::Result<bool>;

    /// Create rows for pairs that do not already have a live row,
    /// deduplicating within the batch; one write for the whole call.
    /// Returns the rows actually created.
    fn bulk_create(&self, creates: Vec<RelationCreate>)
        -> anyhow::Result<Vec<RequirementRelation>>;

    /// Live rows touching the id in either direction.
    fn list_for(&self, requirement_id: u64) -> anyhow::Result<Vec<RequirementRelation>>;

    /// Soft-delete every live row touching the id in either direction.
    /// Returns the number of rows deleted.
    fn delete_for_requirement(&self, requirement_id: u64) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendCsv {
    list: Arc<RwLock<Vec<RequirementRelation>>>,
    path: String,
}

const CSV_HEADERS: [&str; 8] = [
    "id",
    "source_requirement_id",
    "target_requirement_id",
    "similarity_score",
    "match_method",
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
                    log::info!("creating new relation database at {path}");
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
            let source_requirement_id = record
                .get(1)
                .ok_or(anyhow!("couldnt get record source_requirement_id"))?
                .parse::<u64>()?;
            let target_requirement_id = record
                .get(2)
                .ok_or(anyhow!("couldnt get record target_requirement_id"))?
                .parse::<u64>()?;
            let similarity_score = record
                .get(3)
                .ok_or(anyhow!("couldnt get record similarity_score"))?
                .parse::<f32>()?;
            let match_method = record
                .get(4)
                .ok_or(anyhow!("couldnt get record match_method"))?
                .parse::<MatchMethod>()?;
            let created_at = parse_timestamp(
                record.get(5).ok_or(anyhow!("couldnt get record created_at"))?,
                "created_at",
            )?;
            let updated_at = parse_timestamp(
                record.get(6).ok_or(anyhow!("couldnt get record updated_at"))?,
                "updated_at",
            )?;
            let deleted_at = record
                .get(7)
                .ok_or(anyhow!("couldnt get record deleted_at"))?;
            let deleted_at = if deleted_at.is_empty() {
                None
            } else {
                Some(parse_timestamp(deleted_at, "deleted_at")?)
            };

            rows.push(RequirementRelation {
                id,
                source_requirement_id,
                target_requirement_id,
                similarity_score,
                match_method,
                created_at,
                updated_at,
                deleted_at,
            });
        }

        log::debug!(
            "took {}ms to read relations csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(BackendCsv {
            list: Arc::new(RwLock::new(rows)),
            path: path.to_string(),
        })
    }

    fn save_locked(&self, rows: &[RequirementRelation]) -> anyhow::Result<()> {
        let temp_path = format!("{}-tmp", &self.path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for row in rows.iter() {
            csv_wrt.write_record([
                &row.id.to_string(),
                &row.source_requirement_id.to_string(),
                &row.target_requirement_id.to_string(),
                &row.similarity_score.to_string(),
                &row.match_method.to_string(),
                &row.created_at.to_rfc3339(),
                &row.updated_at.to_rfc3339(),
                &row.deleted_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

impl RelationStore for BackendCsv {
    fn exists(&self, source: u64, target: u64) -> anyhow::Result<bool> {
        let rows = self.list.read().unwrap();
        Ok(rows.iter().any(|r| {
            r.source_requirement_id == source
                && r.target_requirement_id == target
                && r.deleted_at.is_none()
        }))
    }

    fn bulk_create(
        &self,
        creates: Vec<RelationCreate>,
    ) -> anyhow::Result<Vec<RequirementRelation>> {
        let mut rows = self.list.write().unwrap();
        let mut next_id = rows.iter().map(|r| r.id).max().map(|id| id + 1).unwrap_or(1);

        let mut seen: HashSet<(u64, u64)> = HashSet::new();
        let mut created = vec![];
        let now = Utc::now();

        for create in creates {
            let pair = (create.source_requirement_id, create.target_requirement_id);

            // intra-batch dedup
            if !seen.insert(pair) {
                continue;
            }

            // ignore-on-conflict against live rows
            if rows.iter().any(|r| {
                r.source_requirement_id == pair.0
                    && r.target_requirement_id == pair.1
                    && r.deleted_at.is_none()
            }) {
                continue;
            }

            let row = RequirementRelation {
                id: next_id,
                source_requirement_id: create.source_requirement_id,
                target_requirement_id: create.target_requirement_id,
                similarity_score: create.similarity_score,
                match_method: create.match_method,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            next_id += 1;

            rows.push(row.clone());
            created.push(row);
        }

        if !created.is_empty() {
            self.save_locked(&rows)?;
        }

        Ok(created)
    }

    fn list_for(&self, requirement_id: u64) -> anyhow::Result<Vec<RequirementRelation>> {
        let rows = self.list.read().unwrap();
        Ok(rows
            .iter()
            .filter(|r| {
                r.deleted_at.is_none()
                    && (r.source_requirement_id == requirement_id
                        || r.target_requirement_id == requirement_id)
            })
            .cloned()
            .collect())
    }

    fn delete_for_requirement(&self, requirement_id: u64) -> anyhow::Result<usize> {
        let mut rows = self.list.write().unwrap();

        let now = Utc::now();
        let mut count = 0;
        for row in rows.iter_mut() {
            if row.deleted_at.is_none()
                && (row.source_requirement_id == requirement_id
                    || row.target_requirement_id == requirement_id)
            {
                row.deleted_at = Some(now);
                count += 1;
            }
        }

        if count > 0 {
            self.save_locked(&rows)?;
        }

        Ok(count)
    }
}
