use std::sync::Arc;

use routelens_core::{
    Cluster, ClusterPartition, LoadSeries, Route, RouteAggregate, TreeNode, build_tree,
    cluster_load_series, load_series,
};
use routelens_engine::{AggregationEngine, ClusterController};
use routelens_store::{AggregateStore, ClusterStore, EventStore};

use crate::config::AppConfig;
use crate::error::Result;

/// Both engines wired over one store, exposing the consumer surface for an
/// external API layer. Construction fails fast on invalid configuration.
pub struct AppState {
    config: AppConfig,
    engine: AggregationEngine,
    controller: ClusterController,
}

impl AppState {
    pub fn new<S>(store: Arc<S>, config: AppConfig) -> Result<Self>
    where
        S: EventStore + AggregateStore + ClusterStore + 'static,
    {
        let engine = AggregationEngine::new(store.clone(), store.clone(), config.aggregation())?;
        let controller = ClusterController::new(
            store.clone(),
            store.clone(),
            store,
            config.refresh(),
        )?;
        Ok(Self {
            config,
            engine,
            controller,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start both watchers: per-route aggregation triggers and the periodic
    /// cluster refresh.
    pub fn start(&self) {
        self.engine.start_watching();
        self.controller.start_watching();
    }

    /// Stop watching. Safe to call at any time; in-flight recomputes finish.
    pub fn shutdown(&self) {
        self.engine.stop_watching();
        self.controller.stop_watching();
    }

    pub async fn aggregate_for(&self, route: &Route) -> Result<Option<RouteAggregate>> {
        Ok(self.engine.aggregate_for(route).await?)
    }

    pub async fn all_aggregates(&self) -> Result<Vec<RouteAggregate>> {
        Ok(self.engine.all_aggregates().await?)
    }

    pub async fn distinct_routes(&self) -> Result<Vec<Route>> {
        Ok(self.engine.distinct_routes().await?)
    }

    pub async fn force_all_pending_updates(&self) -> Result<()> {
        Ok(self.engine.force_all_pending_updates().await?)
    }

    pub async fn clusters(&self) -> Result<Option<ClusterPartition>> {
        Ok(self.controller.clusters().await?)
    }

    pub async fn force_cluster_update(&self) -> Result<()> {
        Ok(self.controller.force_update().await?)
    }

    pub fn load_series(&self, aggregate: &RouteAggregate) -> LoadSeries {
        load_series(aggregate, self.config.granularity_minutes())
    }

    pub fn cluster_load_series(&self, aggregates: &[RouteAggregate]) -> Result<LoadSeries> {
        Ok(cluster_load_series(
            aggregates,
            self.config.granularity_minutes(),
        )?)
    }

    pub fn cluster_tree(&self, clusters: &[Cluster]) -> TreeNode {
        build_tree(clusters)
    }
}
