//! Conversation store and its event channel.

pub mod conversation_store;
pub mod events;

pub use conversation_store::ConversationStore;
pub use events::{EventBus, EventKind, Listener, StoreEvent, Subscription};
