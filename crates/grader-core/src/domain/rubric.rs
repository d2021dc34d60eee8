//! Rubrics: scoring criteria per artifact.

use std::collections::BTreeMap;
use std::path::Path;

use grader_state::{StoredCriterion, StoredRubric};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::digest::compute_digest;
use crate::domain::error::{GraderError, Result};

/// One scoring criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub points: u32,
    pub description: String,
}

/// Validated rubric for one artifact.
///
/// `total_points` is always the sum of criterion points. Construction goes
/// through [`Rubric::new`] (or `TryFrom<StoredRubric>`) so an invalid rubric
/// never reaches the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rubric {
    name: String,
    criteria: BTreeMap<String, Criterion>,
    total_points: u32,
}

impl Rubric {
    /// Validate and build a rubric.
    ///
    /// Rejects an empty criteria map, zero-point criteria, and criteria with
    /// a blank description.
    pub fn new(name: impl Into<String>, criteria: BTreeMap<String, Criterion>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| GraderError::InvalidRubric {
            name: name.clone(),
            reason,
        };

        if criteria.is_empty() {
            return Err(invalid("rubric has no criteria".to_string()));
        }
        let mut total: u32 = 0;
        for (key, criterion) in &criteria {
            if criterion.points == 0 {
                return Err(invalid(format!("criterion '{key}' must award at least one point")));
            }
            if criterion.description.trim().is_empty() {
                return Err(invalid(format!("criterion '{key}' has no description")));
            }
            total = total
                .checked_add(criterion.points)
                .ok_or_else(|| invalid("total points overflow".to_string()))?;
        }

        Ok(Self {
            name,
            criteria,
            total_points: total,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn criteria(&self) -> &BTreeMap<String, Criterion> {
        &self.criteria
    }

    /// Sum of criterion points.
    pub fn total_points(&self) -> u32 {
        self.total_points
    }
}

impl TryFrom<StoredRubric> for Rubric {
    type Error = GraderError;

    fn try_from(stored: StoredRubric) -> Result<Self> {
        let criteria = stored
            .criteria
            .into_iter()
            .map(|(k, c)| {
                (
                    k,
                    Criterion {
                        points: c.points,
                        description: c.description,
                    },
                )
            })
            .collect();
        let rubric = Rubric::new(stored.filename, criteria)?;

        if let Some(declared) = stored.total_points {
            if declared != rubric.total_points {
                warn!(
                    rubric = %rubric.name,
                    declared,
                    computed = rubric.total_points,
                    "declared total_points disagrees with criteria sum; using criteria sum"
                );
            }
        }
        Ok(rubric)
    }
}

impl From<&Rubric> for StoredRubric {
    fn from(rubric: &Rubric) -> Self {
        StoredRubric {
            filename: rubric.name.clone(),
            total_points: Some(rubric.total_points),
            criteria: rubric
                .criteria
                .iter()
                .map(|(k, c)| {
                    (
                        k.clone(),
                        StoredCriterion {
                            points: c.points,
                            description: c.description.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct RubricFileEntry {
    #[serde(default)]
    total_points: Option<u32>,
    criteria: BTreeMap<String, StoredCriterion>,
}

/// All rubrics for a batch, keyed by artifact name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RubricSet {
    rubrics: BTreeMap<String, Rubric>,
}

impl RubricSet {
    /// Parse a `rubrics.json` document: `{ "<artifact>": { "total_points"?, "criteria": {..} } }`.
    ///
    /// Every rubric is validated; the first invalid one fails the whole set.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: BTreeMap<String, RubricFileEntry> = serde_json::from_str(json)?;
        let rubrics = entries
            .into_iter()
            .map(|(name, entry)| {
                let stored = StoredRubric {
                    filename: name.clone(),
                    total_points: entry.total_points,
                    criteria: entry.criteria,
                };
                Rubric::try_from(stored).map(|r| (name, r))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { rubrics })
    }

    /// Read and validate a rubrics file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let set = Self::from_json_str(&content)?;
        info!(path = %path.display(), rubrics = set.len(), "loaded rubrics");
        Ok(set)
    }

    pub fn insert(&mut self, rubric: Rubric) {
        self.rubrics.insert(rubric.name.clone(), rubric);
    }

    pub fn get(&self, name: &str) -> Option<&Rubric> {
        self.rubrics.get(name)
    }

    pub fn len(&self) -> usize {
        self.rubrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rubrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Rubric)> {
        self.rubrics.iter()
    }

    pub fn into_map(self) -> BTreeMap<String, Rubric> {
        self.rubrics
    }

    pub fn as_map(&self) -> &BTreeMap<String, Rubric> {
        &self.rubrics
    }

    /// Content digest of the whole set, stable across key order.
    pub fn digest(&self) -> Result<String> {
        compute_digest(&serde_json::to_value(&self.rubrics)?)
    }
}

impl FromIterator<Rubric> for RubricSet {
    fn from_iter<I: IntoIterator<Item = Rubric>>(iter: I) -> Self {
        Self {
            rubrics: iter.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }
}
