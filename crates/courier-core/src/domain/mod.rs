//! Domain model (IDs, envelope, queues, errors, decisions).

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod queue;
pub mod task_type;

pub use decision::{Decision, Disposition};
pub use envelope::{NewEnvelope, TaskEnvelope};
pub use errors::{CourierError, FailureKind, HandlerError};
pub use ids::{CorrelationId, TaskId};
pub use queue::{QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_LOW, QueueSpec, QueueSpecParseError};
pub use task_type::TaskType;
