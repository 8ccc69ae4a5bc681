//! Session lifecycle: the controller that owns a portal's sign-in state,
//! the events it publishes, and the debounced activity listener that keeps
//! an in-use session alive.

pub mod activity;
pub mod controller;
pub mod state;

pub use activity::{ActivityHandle, ActivityMonitor, ActivitySignal};
pub use controller::SessionController;
pub use state::{AuthError, AuthSnapshot, AuthState, LoginRequest, Notice, SessionEvent};
