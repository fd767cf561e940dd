//! fleet-netd privileged helper
//!
//! The root-owned side of the daemon/helper boundary. It listens on a Unix
//! socket, authorizes mutating requests by peer credentials and applies
//! interface configuration through an [`InterfaceConfigurator`].

pub mod authorization;
pub mod configurator;
pub mod error;
pub mod server;

pub use authorization::{AuthorizationPolicy, PeerCredentials};
pub use configurator::{InterfaceConfigurator, IpCommandConfigurator};
pub use error::{HelperError, Result};
pub use server::HelperService;
