//! Receivers shipped with the bridge.
//!
//! Small, platform-independent facades that exercise the bridge end to end:
//! plain request/response calls, the session event queue, and background
//! producers that post events while the session runs.

pub mod events;
pub mod system;
pub mod timer;

use crate::rpc::ReceiverType;

pub use events::EventFacade;
pub use system::SystemFacade;
pub use timer::TimerFacade;

/// Every built-in receiver type, in registration order.
pub fn all() -> Vec<ReceiverType> {
    vec![
        system::receiver_type(),
        events::receiver_type(),
        timer::receiver_type(),
    ]
}
