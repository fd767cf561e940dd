//! Privileged helper service
//!
//! Accepts connections on a Unix socket and answers exactly one framed
//! request per connection. Read-only requests are served to any peer;
//! configure and cleanup require the peer to satisfy the
//! [`AuthorizationPolicy`].

use crate::authorization::{AuthorizationPolicy, PeerCredentials};
use crate::configurator::InterfaceConfigurator;
use crate::error::HelperError;
use protocol::{
    CONFIGURE_RIGHT, IpConfigurationInfo, Message, NetworkInterfaceInfo, NetworkRequest,
    NetworkResponse, ProtocolError, ResponseData, read_framed_async, validate_version,
    write_framed_async,
};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long a client may take to send its request
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HelperService {
    configurator: Arc<dyn InterfaceConfigurator>,
    policy: AuthorizationPolicy,
    /// Serializes configure and cleanup
    mutation: Mutex<()>,
}

impl HelperService {
    pub fn new(configurator: Arc<dyn InterfaceConfigurator>, policy: AuthorizationPolicy) -> Self {
        Self {
            configurator,
            policy,
            mutation: Mutex::new(()),
        }
    }

    /// Answer one request from `peer`
    pub async fn handle(&self, request: NetworkRequest, peer: &PeerCredentials) -> NetworkResponse {
        let kind = request.kind();

        if request.is_mutating() && !self.authorize(peer).await {
            warn!(
                request = kind,
                uid = peer.uid,
                pid = ?peer.pid,
                "Rejected request from unauthorized peer"
            );
            return NetworkResponse::unauthorized(CONFIGURE_RIGHT);
        }

        let result = match request {
            NetworkRequest::Handshake => Ok(ResponseData::Empty),
            NetworkRequest::GetVersion => {
                Ok(ResponseData::String(env!("CARGO_PKG_VERSION").to_string()))
            }
            NetworkRequest::IsInterfaceConfigured { interface } => {
                match validate_interface(&interface) {
                    Ok(()) => self
                        .configurator
                        .is_configured(&interface)
                        .await
                        .map(ResponseData::Boolean),
                    Err(e) => Err(e),
                }
            }
            NetworkRequest::ConfigureInterface { interface, config } => {
                self.configure(&interface, &config).await
            }
            NetworkRequest::CleanupInterface { interface } => self.cleanup(&interface).await,
        };

        match result {
            Ok(data) => NetworkResponse::ok(data),
            Err(e) => {
                warn!(request = kind, "Request failed: {}", e);
                NetworkResponse::failure(e.to_string())
            }
        }
    }

    /// Group membership lookups go through NSS and may block
    async fn authorize(&self, peer: &PeerCredentials) -> bool {
        let policy = self.policy.clone();
        let peer = *peer;
        match tokio::task::spawn_blocking(move || policy.is_authorized(&peer)).await {
            Ok(authorized) => authorized,
            Err(e) => {
                error!(uid = peer.uid, "Authorization check failed: {}", e);
                false
            }
        }
    }

    async fn configure(
        &self,
        interface: &NetworkInterfaceInfo,
        config: &IpConfigurationInfo,
    ) -> Result<ResponseData, HelperError> {
        validate_interface(interface)?;
        validate_config(config)?;

        let _guard = self.mutation.lock().await;
        self.configurator.configure(interface, config).await?;
        Ok(ResponseData::Empty)
    }

    async fn cleanup(&self, interface: &NetworkInterfaceInfo) -> Result<ResponseData, HelperError> {
        validate_interface(interface)?;

        let _guard = self.mutation.lock().await;
        self.configurator.cleanup(interface).await?;
        Ok(ResponseData::Empty)
    }

    async fn serve_connection(&self, mut stream: UnixStream) -> Result<(), ProtocolError> {
        let peer = PeerCredentials::from(stream.peer_cred()?);

        let message = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_framed_async(&mut stream))
            .await
        {
            Ok(message) => message?,
            Err(_) => {
                debug!(uid = peer.uid, "Client sent no request in time");
                return Ok(());
            }
        };

        let response = match validate_version(&message.version).and_then(|()| message.into_request())
        {
            Ok(request) => {
                debug!(request = request.kind(), uid = peer.uid, "Handling request");
                self.handle(request, &peer).await
            }
            Err(e) => NetworkResponse::failure(e.to_string()),
        };

        write_framed_async(&mut stream, &Message::response(response)).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self: Arc<Self>, listener: UnixListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Privileged helper accepting requests");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.serve_connection(stream).await {
                                debug!("Connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Privileged helper stopped accepting requests");
    }
}

fn validate_interface(interface: &NetworkInterfaceInfo) -> Result<(), HelperError> {
    if interface.has_valid_system_name() {
        Ok(())
    } else {
        Err(HelperError::InvalidInterface(interface.bsd_name.clone()))
    }
}

fn validate_config(config: &IpConfigurationInfo) -> Result<(), HelperError> {
    let invalid = |reason: String| Err(HelperError::InvalidConfiguration(reason));

    let Some(prefix) = config.prefix_len() else {
        return invalid(format!("non-contiguous subnet mask {}", config.subnet_mask));
    };
    if prefix == 0 {
        return invalid("empty subnet mask".to_string());
    }

    let address = config.ip_address;
    if address.is_unspecified()
        || address.is_loopback()
        || address.is_multicast()
        || address == Ipv4Addr::BROADCAST
    {
        return invalid(format!("address {} cannot be assigned", address));
    }

    if let Some(gateway) = config.gateway {
        let mask = u32::from(config.subnet_mask);
        if u32::from(gateway) & mask != u32::from(address) & mask {
            return invalid(format!("gateway {} is outside {}", gateway, config));
        }
    }

    Ok(())
}
