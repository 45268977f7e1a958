//! Removal of a dropped namespace's config metadata.

use crate::catalog::{CatalogClient, ConfigCollection};
use crate::error::Result;
use crate::metrics::DdlMetrics;
use crate::routing::CatalogCache;
use crate::types::{Namespace, WriteConcern};
use std::sync::Arc;
use tracing::{debug, warn};

/// Config rows removed for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub chunks: u64,
    pub tags: u64,
    pub collections: u64,
}

/// Deletes chunk, tag and collection rows of a namespace, then invalidates
/// the namespace's routing cache entry whatever the outcome.
#[derive(Debug, Clone)]
pub struct ConfigMetadataCleaner {
    catalog: Arc<dyn CatalogClient>,
    catalog_cache: Arc<CatalogCache>,
    metrics: Arc<DdlMetrics>,
}

impl ConfigMetadataCleaner {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        catalog_cache: Arc<CatalogCache>,
        metrics: Arc<DdlMetrics>,
    ) -> Self {
        Self {
            catalog,
            catalog_cache,
            metrics,
        }
    }

    /// Remove every config row keyed by `ns`.
    ///
    /// Each deletion uses majority write concern and stops the cleanup on
    /// failure. The deletions are independent and idempotent, so rows left
    /// behind by a failed run are removed by the next drop of `ns`.
    pub async fn cleanup_namespace(&self, ns: &Namespace) -> Result<CleanupSummary> {
        self.metrics.cleanup_runs.inc();
        let result = self.remove_rows(ns).await;
        self.catalog_cache.invalidate_collection(ns).await;

        match &result {
            Ok(summary) => debug!(
                %ns,
                chunks = summary.chunks,
                tags = summary.tags,
                collections = summary.collections,
                "Config metadata removed"
            ),
            Err(e) => {
                self.metrics.cleanup_failures.inc();
                warn!(%ns, error = %e, "Config metadata cleanup failed");
            }
        }
        result
    }

    async fn remove_rows(&self, ns: &Namespace) -> Result<CleanupSummary> {
        let chunks = self.remove(ConfigCollection::Chunks, ns).await?;
        let tags = self.remove(ConfigCollection::Tags, ns).await?;
        let collections = self.remove(ConfigCollection::Collections, ns).await?;
        Ok(CleanupSummary {
            chunks,
            tags,
            collections,
        })
    }

    async fn remove(&self, collection: ConfigCollection, ns: &Namespace) -> Result<u64> {
        self.catalog
            .remove_config_documents(collection, ns, WriteConcern::Majority)
            .await
    }
}
