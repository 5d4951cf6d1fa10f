pub mod config;
pub mod error;
pub mod install_manager;
pub mod k8s_manager;
pub mod manifests;
pub mod monitoring_manager;
pub mod olm_manager;

pub use config::{CompletionPolicy, InstallerConfig};
pub use error::{InstallError, Stage};
pub use install_manager::{ApprovalEngine, BatchReport, InstallCoordinator, InstallManager};
pub use k8s_manager::{memory::MemoryGateway, KubeClient, KubeGateway};
