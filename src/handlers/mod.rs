pub mod definition;
pub mod events;
pub mod service;
pub mod state_machine;

pub use definition::{CommandService, LaunchCommand, ServiceDefinition};
pub use events::HandlerEvent;
pub use service::ServiceHandler;
pub use state_machine::{HandlerStateMachine, InvalidTransition, LifecycleEvent};
