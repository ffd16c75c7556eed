//! TaskPayload trait - ties a payload type to its task name.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A serializable payload that names the handler which executes it.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendWelcomeEmail {
///     user_id: u64,
/// }
///
/// // task name defaults to the qualified type name
/// impl TaskPayload for SendWelcomeEmail {}
///
/// #[derive(Serialize, Deserialize)]
/// struct Charge { cents: u64 }
///
/// impl TaskPayload for Charge {
///     fn task_name() -> &'static str { "billing.charge.v1" }
/// }
/// ```
///
/// # Trait bounds
/// - `Serialize`: the producer stores it as JSON bytes
/// - `DeserializeOwned`: the typed handler decodes owned values from bytes
/// - `Send + Sync + 'static`: handlers live behind `Arc` across tasks
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used for routing to a handler.
    ///
    /// Renaming or moving the type changes the default, so pin it
    /// explicitly for payloads that may sit in storage across deploys.
    fn task_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
