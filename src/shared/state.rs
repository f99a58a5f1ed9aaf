use std::sync::Arc;

use crate::bus::CommandBus;
use crate::config::AppConfig;
use crate::lifecycle::LifecycleCoordinator;
use crate::orchestrator::ContainerOrchestrator;
use crate::shared::utils::DbPool;
use crate::store::MeetingStore;

/// Process-wide resources, constructor-injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: Arc<AppConfig>,
    pub store: MeetingStore,
    pub bus: CommandBus,
    pub orchestrator: Arc<dyn ContainerOrchestrator>,
    pub lifecycle: LifecycleCoordinator,
}

impl AppState {
    pub fn new(
        conn: DbPool,
        config: Arc<AppConfig>,
        bus: CommandBus,
        orchestrator: Arc<dyn ContainerOrchestrator>,
    ) -> Self {
        let store = MeetingStore::new(conn.clone());
        let lifecycle = LifecycleCoordinator::new(
            store.clone(),
            bus.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&config),
        );
        AppState {
            conn,
            config,
            store,
            bus,
            orchestrator,
            lifecycle,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("config", &self.config)
            .field("store", &"MeetingStore")
            .field("bus", &"CommandBus")
            .field("orchestrator", &"Arc<dyn ContainerOrchestrator>")
            .finish_non_exhaustive()
    }
}
