pub mod changes;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod prober;
pub mod report;
pub mod service;
pub mod task;

pub use changes::{post_and_wait, AsyncChangeClient, Change, ChangeStatus};
pub use config::{load_config, ServiceConfig};
pub use controller::{ProbeController, ProbeOutcome, ProbeScope, ProbeStatus};
pub use error::ServiceError;
pub use events::{channel, ChannelEventSource, DeviceEvent, DeviceEventSource, EventSender};
pub use prober::{FileProber, Prober};
pub use report::{ErrorReport, ErrorReportKind, ErrorReportRef};
pub use service::{GuidedTargetsResponse, StorageService};
pub use task::{RestartPolicy, SingleInstanceTask};
