//! Protocol message definitions
//!
//! Every exchange between the daemon and the privileged helper is a single
//! request followed by a single response:
//! - Read-only queries (handshake, configuration check, version)
//! - Mutating requests (configure, cleanup) which require [`CONFIGURE_RIGHT`]
//!
//! [`CONFIGURE_RIGHT`]: crate::CONFIGURE_RIGHT

use crate::types::{IpConfigurationInfo, NetworkInterfaceInfo};
use crate::error::{ProtocolError, Result};
use crate::version::{CURRENT_VERSION, ProtocolVersion};
use serde::{Deserialize, Serialize};

/// Prefix of the `error` text the helper uses when a caller lacks the
/// authorization right for a mutating request.
pub const AUTHORIZATION_DENIED: &str = "authorization denied";

/// Top-level message envelope
///
/// All protocol messages are wrapped in this envelope which includes
/// the protocol version for compatibility checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: MessagePayload,
}

impl Message {
    /// Wrap a request in an envelope stamped with [`CURRENT_VERSION`]
    pub fn request(request: NetworkRequest) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload: MessagePayload::Request(request),
        }
    }

    /// Wrap a response in an envelope stamped with [`CURRENT_VERSION`]
    pub fn response(response: NetworkResponse) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload: MessagePayload::Response(response),
        }
    }

    pub fn into_request(self) -> Result<NetworkRequest> {
        match self.payload {
            MessagePayload::Request(request) => Ok(request),
            MessagePayload::Response(_) => {
                Err(ProtocolError::UnexpectedMessage { expected: "request" })
            }
        }
    }

    pub fn into_response(self) -> Result<NetworkResponse> {
        match self.payload {
            MessagePayload::Response(response) => Ok(response),
            MessagePayload::Request(_) => {
                Err(ProtocolError::UnexpectedMessage { expected: "response" })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Daemon -> helper
    Request(NetworkRequest),
    /// Helper -> daemon
    Response(NetworkResponse),
}

/// Requests understood by the privileged helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkRequest {
    /// Liveness and version check
    Handshake,

    /// Ask whether the interface already carries a configuration
    IsInterfaceConfigured { interface: NetworkInterfaceInfo },

    /// Apply an IP configuration to the interface
    ConfigureInterface {
        interface: NetworkInterfaceInfo,
        config: IpConfigurationInfo,
    },

    /// Remove any configuration previously applied to the interface
    CleanupInterface { interface: NetworkInterfaceInfo },

    /// Query the helper's software version
    GetVersion,
}

impl NetworkRequest {
    /// Whether the request changes host network state
    ///
    /// Mutating requests require the caller to hold the configure right.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            NetworkRequest::ConfigureInterface { .. } | NetworkRequest::CleanupInterface { .. }
        )
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkRequest::Handshake => "handshake",
            NetworkRequest::IsInterfaceConfigured { .. } => "isInterfaceConfigured",
            NetworkRequest::ConfigureInterface { .. } => "configureInterface",
            NetworkRequest::CleanupInterface { .. } => "cleanupInterface",
            NetworkRequest::GetVersion => "getVersion",
        }
    }
}

/// Payload carried by a successful response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseData {
    Empty,
    Boolean(bool),
    String(String),
}

/// Response envelope
///
/// `error` is populated iff `success` is false; `data` only when
/// `success` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<ResponseData>,
}

impl NetworkResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn ok_empty() -> Self {
        Self::ok(ResponseData::Empty)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Failure returned when the caller does not hold `right`
    pub fn unauthorized(right: &str) -> Self {
        Self::failure(format!("{}: missing right {}", AUTHORIZATION_DENIED, right))
    }

    pub fn is_authorization_failure(&self) -> bool {
        !self.success
            && self
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with(AUTHORIZATION_DENIED))
    }

    /// Check the envelope invariant
    pub fn is_well_formed(&self) -> bool {
        if self.success {
            self.error.is_none()
        } else {
            self.error.is_some() && self.data.is_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_requests() {
        let interface = NetworkInterfaceInfo::new("USB Ethernet", "usb0", "1-2");
        assert!(!NetworkRequest::Handshake.is_mutating());
        assert!(!NetworkRequest::GetVersion.is_mutating());
        assert!(
            !NetworkRequest::IsInterfaceConfigured {
                interface: interface.clone()
            }
            .is_mutating()
        );
        assert!(
            NetworkRequest::CleanupInterface {
                interface: interface.clone()
            }
            .is_mutating()
        );
    }

    #[test]
    fn test_response_envelope() {
        assert!(NetworkResponse::ok_empty().is_well_formed());
        assert!(NetworkResponse::ok(ResponseData::Boolean(true)).is_well_formed());
        assert!(NetworkResponse::failure("boom").is_well_formed());

        let bad = NetworkResponse {
            success: false,
            error: None,
            data: None,
        };
        assert!(!bad.is_well_formed());

        let unauthorized = NetworkResponse::unauthorized("io.fleet.netd.configure-interface");
        assert!(unauthorized.is_authorization_failure());
        assert!(!NetworkResponse::failure("ip: command failed").is_authorization_failure());
    }
}
