//! Unix-socket client for the privileged helper
//!
//! Each call opens a fresh connection, sends one framed request and reads
//! one framed response. Keeping no connection state means a helper restart
//! is invisible to the daemon beyond the calls that were in flight.

use super::{PrivilegedNetwork, Result};
use crate::error::NetworkClientError;
use async_trait::async_trait;
use protocol::{
    IpConfigurationInfo, Message, NetworkInterfaceInfo, NetworkRequest, NetworkResponse,
    ProtocolError, ProtocolVersion, ResponseData, read_framed_async, validate_version, write_framed_async,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Default bound on one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PrivilegedNetworkClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl PrivilegedNetworkClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Perform one exchange and return the response envelope plus the
    /// version the helper stamped on it
    async fn exchange(
        &self,
        request: NetworkRequest,
    ) -> Result<(ProtocolVersion, NetworkResponse)> {
        let kind = request.kind();
        debug!(request = kind, "Sending request to privileged helper");

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| self.connect_error(e))?;

            write_framed_async(&mut stream, &Message::request(request))
                .await
                .map_err(|e| transport_error(kind, e))?;
            let reply = read_framed_async(&mut stream)
                .await
                .map_err(|e| transport_error(kind, e))?;
            Ok::<_, NetworkClientError>(reply)
        };

        let reply = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                NetworkClientError::ConnectionFailed(format!(
                    "{} timed out after {:?}",
                    kind, self.request_timeout
                ))
            })??;

        validate_version(&reply.version)?;
        let version = reply.version;
        let response = reply.into_response()?;

        if !response.is_well_formed() {
            return Err(NetworkClientError::InvalidResponse(format!(
                "malformed {} response envelope",
                kind
            )));
        }

        Ok((version, response))
    }

    fn connect_error(&self, e: std::io::Error) -> NetworkClientError {
        let target = self.socket_path.display();
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                NetworkClientError::DaemonNotRunning(format!("{}: {}", target, e))
            }
            ErrorKind::PermissionDenied => {
                NetworkClientError::AuthorizationInvalid(format!("{}: {}", target, e))
            }
            _ => NetworkClientError::ConnectionFailed(format!("{}: {}", target, e)),
        }
    }

    /// Send a request and unwrap the data of a successful response
    async fn call(&self, request: NetworkRequest) -> Result<ResponseData> {
        let kind = request.kind();
        let (_, response) = self.exchange(request).await?;

        if response.success {
            return Ok(response.data.unwrap_or(ResponseData::Empty));
        }

        let message = response.error.clone().unwrap_or_default();
        if response.is_authorization_failure() {
            warn!(request = kind, "Privileged helper denied request: {}", message);
            Err(NetworkClientError::AuthorizationInvalid(message))
        } else {
            Err(NetworkClientError::NetworkConfigurationFailed(message))
        }
    }
}

/// A dropped or reset connection is a transport failure; anything else
/// the codec reports stays a protocol error
fn transport_error(kind: &str, e: ProtocolError) -> NetworkClientError {
    match e {
        ProtocolError::Io(e) => NetworkClientError::ConnectionFailed(format!("{}: {}", kind, e)),
        other => NetworkClientError::Protocol(other),
    }
}

fn unexpected(kind: &str, data: &ResponseData) -> NetworkClientError {
    NetworkClientError::InvalidResponse(format!("unexpected {} payload: {:?}", kind, data))
}

#[async_trait]
impl PrivilegedNetwork for PrivilegedNetworkClient {
    async fn handshake(&self) -> Result<ProtocolVersion> {
        let (version, response) = self.exchange(NetworkRequest::Handshake).await?;
        if response.success {
            Ok(version)
        } else {
            Err(NetworkClientError::ConnectionFailed(
                response.error.unwrap_or_else(|| "handshake rejected".to_string()),
            ))
        }
    }

    async fn is_interface_configured(&self, interface: &NetworkInterfaceInfo) -> Result<bool> {
        let data = self
            .call(NetworkRequest::IsInterfaceConfigured {
                interface: interface.clone(),
            })
            .await
            .map_err(|e| match e {
                NetworkClientError::DaemonNotRunning(detail) => {
                    NetworkClientError::ConnectionFailed(detail)
                }
                other => other,
            })?;
        match data {
            ResponseData::Boolean(configured) => Ok(configured),
            other => Err(unexpected("isInterfaceConfigured", &other)),
        }
    }

    async fn configure_interface(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> Result<()> {
        self.call(NetworkRequest::ConfigureInterface {
            interface: interface.clone(),
            config: *config,
        })
        .await
        .map(|_| ())
    }

    async fn cleanup_interface(&self, interface: &NetworkInterfaceInfo) -> Result<()> {
        self.call(NetworkRequest::CleanupInterface {
            interface: interface.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn get_version(&self) -> Result<String> {
        match self.call(NetworkRequest::GetVersion).await? {
            ResponseData::String(version) => Ok(version),
            other => Err(unexpected("getVersion", &other)),
        }
    }
}
