use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::index::{CatalogError, IndexCatalog, IndexId, PostgresIndex};
use crate::ledger::{ActionLedger, LedgerStoreError};

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Size and bloat floors a candidate must clear after its fresh fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionThresholds {
    pub min_ondisk_size_bytes: u64,
    pub max_ondisk_size_bytes: Option<u64>,
    pub min_relative_bloat: f64,
    pub min_absolute_bloat_bytes: u64,
}

impl SelectionThresholds {
    pub fn disabled() -> Self {
        Self {
            min_ondisk_size_bytes: 0,
            max_ondisk_size_bytes: None,
            min_relative_bloat: 0.0,
            min_absolute_bloat_bytes: 0,
        }
    }

    pub fn accepts(&self, index: &PostgresIndex) -> bool {
        index.ondisk_size_bytes >= self.min_ondisk_size_bytes
            && self
                .max_ondisk_size_bytes
                .is_none_or(|max| index.ondisk_size_bytes <= max)
            && index.relative_bloat() >= self.min_relative_bloat
            && index.bloat_estimate_bytes >= self.min_absolute_bloat_bytes
    }
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        Self {
            min_ondisk_size_bytes: 1024 * 1024 * 1024,
            max_ondisk_size_bytes: Some(100 * 1024 * 1024 * 1024),
            min_relative_bloat: 0.2,
            min_absolute_bloat_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Candidates in descending bloat order, ties broken by identifier.
///
/// The ranking is a snapshot. Selecting again over the same pool reproduces it from the
/// ledger and catalog, so a crashed run needs no saved cursor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RankedCandidates {
    ranked: Vec<PostgresIndex>,
}

impl RankedCandidates {
    pub fn from_ranked(ranked: Vec<PostgresIndex>) -> Self {
        Self { ranked }
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PostgresIndex> {
        self.ranked.iter()
    }

    pub fn ids(&self) -> Vec<IndexId> {
        self.ranked.iter().map(|index| index.id.clone()).collect()
    }

    pub fn truncate(&mut self, len: usize) {
        self.ranked.truncate(len);
    }
}

impl IntoIterator for RankedCandidates {
    type Item = PostgresIndex;
    type IntoIter = std::vec::IntoIter<PostgresIndex>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranked.into_iter()
    }
}

pub struct CandidateSelector {
    catalog: IndexCatalog,
    ledger: ActionLedger,
    thresholds: SelectionThresholds,
}

impl CandidateSelector {
    pub fn new(catalog: IndexCatalog, ledger: ActionLedger, thresholds: SelectionThresholds) -> Self {
        Self {
            catalog,
            ledger,
            thresholds,
        }
    }

    pub async fn select(
        &self,
        candidates: &BTreeSet<IndexId>,
    ) -> Result<RankedCandidates, SelectionError> {
        let pool: Vec<IndexId> = candidates.iter().cloned().collect();
        let recent = self.ledger.recent_among(&pool).await?;

        let mut ranked = Vec::new();
        for id in pool {
            if recent.contains(&id) {
                debug!(index = %id, "skipping recently rebuilt index");
                continue;
            }
            // One fetch per candidate; the bloat estimate is too costly to batch.
            let index = match self.catalog.fetch(&id).await {
                Ok(index) => index,
                Err(CatalogError::NotFound(_)) => {
                    warn!(index = %id, "candidate index no longer exists");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            if !self.thresholds.accepts(&index) {
                debug!(
                    index = %id,
                    ondisk_size_bytes = index.ondisk_size_bytes,
                    bloat_estimate_bytes = index.bloat_estimate_bytes,
                    "candidate below selection thresholds"
                );
                continue;
            }
            ranked.push(index);
        }

        ranked.sort_by(|a, b| {
            b.bloat_estimate_bytes
                .cmp(&a.bloat_estimate_bytes)
                .then_with(|| a.id.cmp(&b.id))
        });
        info!(
            pool = candidates.len(),
            recent = recent.len(),
            selected = ranked.len(),
            "ranked reindex candidates"
        );
        Ok(RankedCandidates::from_ranked(ranked))
    }
}
