pub mod admission;
pub mod bus;
pub mod callback;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod platform;
pub mod reaper;
pub mod shared;
pub mod store;

pub use bus::{BotCommand, CommandBus};
pub use config::AppConfig;
pub use lifecycle::LifecycleCoordinator;
pub use orchestrator::{build_orchestrator, ContainerOrchestrator};
pub use platform::Platform;
pub use reaper::Reaper;
pub use shared::error::ManagerError;
pub use shared::models::{Meeting, MeetingConfig, MeetingSession, MeetingStatus, User};
pub use shared::state::AppState;
pub use store::MeetingStore;
