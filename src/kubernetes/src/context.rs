use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use rosterd_trace::metrics::Metrics;

use crate::store::Datastore;

// Context shared by the reconciler loop and the web server
#[derive(Clone)]
pub struct Context {
    // Shared datastore handle
    pub store: Arc<dyn Datastore>,
    // Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    // Prometheus metrics
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub registry: prometheus::Registry,
}

impl State {
    pub fn new(component: &str) -> State {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(component.to_string()))),
            registry: prometheus::Registry::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, store: Arc<dyn Datastore>) -> Arc<Context> {
        Arc::new(Context {
            store,
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::default().register(&self.registry).unwrap(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub last_sweep: DateTime<Utc>,
    pub component: String,
}

impl Diagnostics {
    pub fn new(component: String) -> Self {
        Self {
            last_sweep: Utc::now(),
            component,
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::new("rosterd".to_string())
    }
}
