//! Core transport, retry policy, and dispatcher for a provider-side Apple
//! Push Notification service (APNs) client: two long-lived HTTP/2 sessions
//! (`push` and `manage`), a fan-out dispatcher over them, and a provider
//! token manager that refreshes on demand.
//!
//! [`Dispatcher`] is the entry point for a single logical client;
//! [`MultiDispatcher`] round-robins a pool of them for load spreading.
//! Concrete notification payloads are left to callers via the
//! [`Notification`] trait.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod multi;
pub mod notification;
pub mod requester;
pub mod retry;
pub mod session;
pub mod token;

pub use clock::{Clock, SystemClock};
pub use config::{ClientConfig, Credentials, MultiDispatcherConfig, ResolvedConfig};
pub use dispatcher::{BatchResult, ChannelAction, Dispatcher};
pub use error::{ConfigError, DispatchError, Failure, PublicFailure, SessionError};
pub use multi::MultiDispatcher;
pub use notification::{BuiltNotification, Notification, SimpleNotification};
pub use requester::{Echoes, Requester, Success};
pub use session::{H2Session, SessionKind, SessionManager};
pub use token::{JwtTokenMinter, TokenError, TokenMinter, TokenSource};
