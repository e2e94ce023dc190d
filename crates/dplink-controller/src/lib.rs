//! dplink-controller library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/` and
//! the `dplink-sim` binary share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::connection::{
    Connection, ConnectionError, ConnectionOptions, ConnectionStatus, HpdHighOutcome, HpdStatus,
    StreamRequest,
};
pub use application::dispatcher::{
    AttentionRoute, ControllerStatus, DispatchError, HotplugDispatcher, SimulatedEvent,
};
pub use application::hardware::Hardware;
pub use application::notification::NotifyOutcome;
pub use application::registry::ConnectionRegistry;
pub use application::timing::TimingConfig;
