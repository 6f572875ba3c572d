//! Bridge between a UI and the native engine
//!
//! Command flow: UI → [`CommandDispatcher`] → [`RetrySupervisor`] →
//! engine client. Event flow: engine → [`EventRelay`] → UI, with link loss
//! and fatal errors routed back through the supervisor.

pub mod dispatcher;
pub mod relay;
pub mod session;
pub mod state;
pub mod supervisor;

pub use dispatcher::{CancelToken, CommandDispatcher, CommandResult, Intent, PendingCommandInfo, RequestHandle};
pub use relay::{BridgeEvent, EventRelay};
pub use session::BridgeSession;
pub use state::{next_state, ConnectionStateMachine, Trigger};
pub use supervisor::{Fault, Outcome, PolicyValidationError, RetryPolicy, RetrySupervisor};
