//! Protocol library for fleet-netd
//!
//! This crate defines the request/response protocol spoken between the
//! unprivileged network daemon and the privileged helper that actually
//! configures interfaces. It provides the wire entities, the versioned
//! message envelope, and postcard serialization with length-prefixed framing.
//!
//! # Example
//!
//! ```
//! use protocol::{CURRENT_VERSION, Message, NetworkRequest};
//! use protocol::{decode_framed, encode_framed};
//!
//! let msg = Message::request(NetworkRequest::Handshake);
//!
//! let framed = encode_framed(&msg).unwrap();
//! let decoded = decode_framed(&framed).unwrap();
//! assert_eq!(decoded.version, CURRENT_VERSION);
//! assert_eq!(decoded.into_request().unwrap(), NetworkRequest::Handshake);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod service;
pub mod types;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message, read_framed,
    validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    AUTHORIZATION_DENIED, Message, MessagePayload, NetworkRequest, NetworkResponse, ResponseData,
};
pub use service::{CONFIGURE_RIGHT, HELPER_SOCKET_PATH};
pub use types::{IpConfigurationInfo, NetworkInterfaceInfo};
pub use version::{CURRENT_VERSION, ProtocolVersion};
