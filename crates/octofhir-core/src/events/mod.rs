//! Resource write feed.
//!
//! The storage layer publishes one [`ResourceEvent`] per committed write on an
//! [`EventBroadcaster`]. A [`HookDispatcher`] drains that channel and hands
//! each event to the [`ResourceHook`]s in a [`HookRegistry`].
//!
//! Hooks for a single event run concurrently; the dispatcher waits for all of
//! them before taking the next event, so every hook sees writes in commit
//! order. The channel is bounded and a dispatcher that falls behind loses the
//! oldest events, with the gap logged.
//!
//! ```ignore
//! use octofhir_core::events::{EventBroadcaster, HookSystemBuilder, ResourceEvent};
//!
//! let broadcaster = EventBroadcaster::new_shared();
//! let (_registry, task) = HookSystemBuilder::new()
//!     .register(my_hook)
//!     .await
//!     .start(broadcaster.subscribe());
//!
//! broadcaster.send(ResourceEvent::created("Patient", "123", json!({})));
//! ```

pub mod broadcaster;
pub mod hooks;
pub mod registry;
pub mod types;

pub use broadcaster::EventBroadcaster;
pub use hooks::{HookError, ResourceHook};
pub use registry::{DispatchSummary, HookDispatcher, HookOutcome, HookRegistry, HookSystemBuilder};
pub use types::{ResourceEvent, ResourceEventType};
