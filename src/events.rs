//! Events emitted to the application shell.
//!
//! The client never navigates or restarts anything itself. When the session
//! changes it emits an [`Event`], and the shell decides what that means:
//! returning to a sign-in screen, clearing its own state, or exiting.
//!
//! # Example
//!
//! ```rust
//! use joyful::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::SessionTerminated(info) => println!("signed out: {}", info.message),
//!         Event::LoggedIn => println!("welcome back"),
//!         _ => {}
//!     }
//! }
//! ```

use crate::session::LogoutInfo;

/// Session lifecycle events.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A login stored fresh credentials.
    LoggedIn,

    /// The user logged out and credentials were cleared.
    LoggedOut,

    /// The bearer token was exchanged for a new one.
    TokenRefreshed,

    /// The server rejected the session beyond repair.
    ///
    /// Credentials have already been cleared and the reason persisted when
    /// this is received.
    SessionTerminated(LogoutInfo),
}
