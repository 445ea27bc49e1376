//! Task trait - 型付き payload と task type 文字列の対応

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload type bound to exactly one task type string.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct PingTask {
///     message: String,
/// }
///
/// impl Task for PingTask {
///     const TYPE: &'static str = "worker:ping";
/// }
/// ```
///
/// Payloads travel as JSON inside the envelope, so the type must round-trip
/// through serde.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
