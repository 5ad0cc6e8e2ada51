//! Photo-to-3D orchestration: view generation, provider adapters and the
//! pipeline operations built on them.

pub mod config;
mod http;
pub mod image_client;
pub mod mesh;
pub mod providers;
pub mod records;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod workspace;

pub use config::EngineConfig;
pub use registry::{ProviderRegistry, ProviderSummary};
pub use resolver::DownloadResolver;
pub use scheduler::{MultiViewOutput, MultiViewPlan, MultiViewScheduler, ProgressEvent};
pub use service::{
    GenerationService, StartOutcome, StartRequest, StatusOutcome, ViewsOutcome, ViewsRequest,
};
pub use workspace::LocalWorkspace;
