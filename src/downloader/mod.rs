pub mod error;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod task;
pub mod transport;

pub use error::{DownloadError, Result};
pub use events::{DownloadEvent, EventBroadcaster, Subscription};
pub use orchestrator::{ControlAck, DownloadOrchestrator, OrchestratorBuilder};
pub use task::{Task, TaskId, TaskState};
pub use transport::{
    TransferHandle, TransferRequest, Transport, TransportCapabilities, TransportEvent,
};
