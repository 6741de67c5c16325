/// Listener layer
///
/// Observer registrations and the event sinks run events are delivered through.

pub mod events;
pub mod registry;

pub use events::{BroadcastNotifier, ChannelNotifier, FlowEvent, FlowEventKind, FlowNotifier, NoopNotifier};
pub use registry::{ListenerRegistry, Registration};
