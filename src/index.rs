//! Per-tenant in-memory vector index.
//!
//! Each tenant owns a partition mapping embedding ids to unit vectors.
//! Similarity is the inner product (cosine-equivalent on unit vectors) and
//! search is exact top-k. Partitions never share vectors, so a search on one
//! tenant can never observe another tenant's embeddings.
//!
//! The metadata store holds the durable shadow of every partition. On first
//! access after process start a partition rebuilds itself lazily from the
//! store; rebuilds are per-partition and do not block other tenants, and
//! their progress is observable through [`VectorIndex::rebuild_progress`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::embedding::vector;
use crate::errors::ServiceError;
use crate::store::MetadataStore;
use crate::tenant::TenantId;

/// One search result: an embedding id and its inner-product score.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredEmbedding {
    pub id: String,
    pub score: f32,
}

struct Partition {
    vectors: RwLock<FxHashMap<String, Vec<f32>>>,
    rebuild: OnceCell<()>,
    rebuild_loaded: AtomicUsize,
}

impl Partition {
    fn new() -> Self {
        Self {
            vectors: RwLock::new(FxHashMap::default()),
            rebuild: OnceCell::new(),
            rebuild_loaded: AtomicUsize::new(0),
        }
    }
}

/// Process-wide vector index, key-partitioned by tenant.
pub struct VectorIndex {
    config: IndexConfig,
    store: Arc<dyn MetadataStore>,
    partitions: RwLock<FxHashMap<String, Arc<Partition>>>,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn MetadataStore>, config: IndexConfig) -> Self {
        Self {
            config,
            store,
            partitions: RwLock::new(FxHashMap::default()),
        }
    }

    /// Insert or overwrite a batch of vectors in the tenant's partition.
    ///
    /// The whole batch lands under one write lock, so readers observe either
    /// none or all of it. Duplicate ids are overwritten (last write wins),
    /// which makes re-ingestion idempotent. Vectors are re-normalised
    /// defensively before insertion.
    pub async fn add_batch(
        &self,
        tenant: &TenantId,
        entries: Vec<(String, Vec<f32>)>,
    ) -> Result<(), ServiceError> {
        if entries.is_empty() {
            return Ok(());
        }
        let partition = self.partition(tenant).await?;

        let mut prepared = Vec::with_capacity(entries.len());
        for (id, mut v) in entries {
            if v.len() != self.config.dimension {
                return Err(ServiceError::Internal(format!(
                    "index add for tenant '{tenant}': vector dimension {} != {}",
                    v.len(),
                    self.config.dimension
                )));
            }
            vector::normalize(&mut v)?;
            prepared.push((id, v));
        }

        let mut vectors = partition.vectors.write();
        for (id, v) in prepared {
            vectors.insert(id, v);
        }
        Ok(())
    }

    /// Remove ids from the tenant's partition; absent ids are a no-op.
    pub async fn remove(&self, tenant: &TenantId, ids: &[String]) -> Result<(), ServiceError> {
        let partition = self.partition(tenant).await?;
        let mut vectors = partition.vectors.write();
        for id in ids {
            vectors.remove(id);
        }
        Ok(())
    }

    /// Drop the tenant's entire partition. The next access rebuilds from the
    /// metadata store, so callers clearing for re-ingest or deletion must
    /// update the store first.
    pub fn clear(&self, tenant: &TenantId) {
        self.partitions.write().remove(tenant.as_str());
        debug!(tenant = %tenant, "vector index partition cleared");
    }

    /// Exact top-k inner-product search within the tenant's partition.
    ///
    /// Returns up to `top_k` results with score ≥ `threshold`, sorted by
    /// score descending with lexicographic id order breaking ties.
    pub async fn search(
        &self,
        tenant: &TenantId,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredEmbedding>, ServiceError> {
        if query.len() != self.config.dimension {
            return Err(ServiceError::Validation(format!(
                "query vector dimension {} != {}",
                query.len(),
                self.config.dimension
            )));
        }
        let mut query = query.to_vec();
        vector::normalize(&mut query)?;

        let partition = self.partition(tenant).await?;
        let vectors = partition.vectors.read();

        let mut hits: Vec<ScoredEmbedding> = vectors
            .iter()
            .map(|(id, v)| ScoredEmbedding {
                id: id.clone(),
                score: vector::inner_product(&query, v),
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Number of vectors currently held for the tenant (0 when the partition
    /// has not been touched yet).
    pub fn partition_len(&self, tenant: &TenantId) -> usize {
        self.partitions
            .read()
            .get(tenant.as_str())
            .map_or(0, |p| p.vectors.read().len())
    }

    /// Embeddings loaded so far by the tenant's lazy rebuild, if one has
    /// started.
    pub fn rebuild_progress(&self, tenant: &TenantId) -> Option<usize> {
        self.partitions
            .read()
            .get(tenant.as_str())
            .map(|p| p.rebuild_loaded.load(Ordering::Relaxed))
    }

    /// Get or create the tenant's partition and make sure its one-time
    /// rebuild from the metadata store has completed.
    async fn partition(&self, tenant: &TenantId) -> Result<Arc<Partition>, ServiceError> {
        let partition = {
            let mut partitions = self.partitions.write();
            partitions
                .entry(tenant.as_str().to_string())
                .or_insert_with(|| Arc::new(Partition::new()))
                .clone()
        };

        partition
            .rebuild
            .get_or_try_init(|| async {
                let records = self.store.embeddings_for_tenant(tenant).await?;
                let total = records.len();
                let mut vectors = partition.vectors.write();
                for record in records {
                    let mut v = record.vector;
                    if v.len() == self.config.dimension && vector::normalize(&mut v).is_ok() {
                        vectors.insert(record.id, v);
                    }
                    partition.rebuild_loaded.fetch_add(1, Ordering::Relaxed);
                }
                drop(vectors);
                if total > 0 {
                    info!(tenant = %tenant, loaded = total, "vector partition rebuilt from metadata store");
                }
                Ok::<(), ServiceError>(())
            })
            .await?;

        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryMetadataStore;

    fn axis(dimension: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[i % dimension] = 1.0;
        v
    }

    fn index() -> VectorIndex {
        let store = Arc::new(InMemoryMetadataStore::new());
        VectorIndex::new(
            store,
            IndexConfig {
                dimension: 8,
                default_top_k: 5,
                default_threshold: 0.8,
            },
        )
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[tokio::test]
    async fn search_orders_by_score_then_id() {
        let idx = index();
        let t = tenant("acme");
        let mut near = axis(8, 0);
        near[1] = 0.2; // slightly off-axis
        idx.add_batch(
            &t,
            vec![
                ("b".into(), axis(8, 0)),
                ("a".into(), axis(8, 0)),
                ("c".into(), near),
                ("far".into(), axis(8, 3)),
            ],
        )
        .await
        .unwrap();

        let hits = idx.search(&t, &axis(8, 0), 10, 0.5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        // Exact matches first with the tie broken lexicographically, then the
        // off-axis vector; the orthogonal one is below threshold.
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].score > 0.999);
    }

    #[tokio::test]
    async fn threshold_filters_and_top_k_truncates() {
        let idx = index();
        let t = tenant("acme");
        let entries = (0..6)
            .map(|i| (format!("e{i}"), axis(8, 0)))
            .collect::<Vec<_>>();
        idx.add_batch(&t, entries).await.unwrap();

        let hits = idx.search(&t, &axis(8, 0), 4, 0.8).await.unwrap();
        assert_eq!(hits.len(), 4);

        let hits = idx.search(&t, &axis(8, 5), 4, 0.8).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let idx = index();
        let a = tenant("tenant-a");
        let b = tenant("tenant-b");
        idx.add_batch(&a, vec![("a1".into(), axis(8, 0))])
            .await
            .unwrap();
        idx.add_batch(&b, vec![("b1".into(), axis(8, 0))])
            .await
            .unwrap();

        let hits = idx.search(&a, &axis(8, 0), 10, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a1");
    }

    #[tokio::test]
    async fn duplicate_ids_last_write_wins() {
        let idx = index();
        let t = tenant("acme");
        idx.add_batch(&t, vec![("x".into(), axis(8, 0))])
            .await
            .unwrap();
        idx.add_batch(&t, vec![("x".into(), axis(8, 2))])
            .await
            .unwrap();

        assert_eq!(idx.partition_len(&t), 1);
        let hits = idx.search(&t, &axis(8, 2), 1, 0.9).await.unwrap();
        assert_eq!(hits[0].id, "x");
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let idx = index();
        let t = tenant("acme");
        let entries = (0..20)
            .map(|i| (format!("e{i:02}"), axis(8, i % 3)))
            .collect::<Vec<_>>();
        idx.add_batch(&t, entries).await.unwrap();

        let first = idx.search(&t, &axis(8, 0), 5, 0.5).await.unwrap();
        let second = idx.search(&t, &axis(8, 0), 5, 0.5).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn clear_drops_partition() {
        let idx = index();
        let t = tenant("acme");
        idx.add_batch(&t, vec![("x".into(), axis(8, 0))])
            .await
            .unwrap();
        assert_eq!(idx.partition_len(&t), 1);
        idx.clear(&t);
        assert_eq!(idx.partition_len(&t), 0);
        let hits = idx.search(&t, &axis(8, 0), 5, 0.5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn remove_is_noop_for_absent_ids() {
        let idx = index();
        let t = tenant("acme");
        idx.add_batch(&t, vec![("x".into(), axis(8, 0))])
            .await
            .unwrap();
        idx.remove(&t, &["x".into(), "ghost".into()]).await.unwrap();
        assert_eq!(idx.partition_len(&t), 0);
    }
}
