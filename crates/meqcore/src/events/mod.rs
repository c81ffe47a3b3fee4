mod base;

pub use base::{EventBus, EventEmitter, ForestEvent, MessageLevel, SessionId};
