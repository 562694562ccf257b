//! Admission control for tunnel-open requests.
//!
//! An interceptor sees every parsed request before the relay binds
//! anything. It can wave the request through, rewrite it (the rewritten
//! form is what gets bound and echoed back to the client), or reject it
//! with a reason that becomes the failure response. This is also the seam
//! where a deployment would hang authentication.

use async_trait::async_trait;
use tracing::debug;

use culvert_proto::TunnelRequest;

use crate::error::RelayError;
use crate::port_range::PortRanges;

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn proceed(&self, request: TunnelRequest) -> Result<TunnelRequest, RelayError>;
}

/// Admits every request unchanged.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl RequestInterceptor for AllowAll {
    async fn proceed(&self, request: TunnelRequest) -> Result<TunnelRequest, RelayError> {
        Ok(request)
    }
}

/// Restricts TCP tunnels to configured port ranges and picks a concrete
/// port when the request asks for 0. HTTP requests pass through.
#[derive(Debug)]
pub struct PortPolicy {
    ranges: PortRanges,
}

/// Bind-probe attempts before giving up on finding a free port.
const PICK_ATTEMPTS: usize = 64;

impl PortPolicy {
    pub fn new(ranges: PortRanges) -> Self {
        Self { ranges }
    }

    /// Probe random candidates from the ranges until one binds.
    ///
    /// The probe listener is dropped again, so another process can still
    /// steal the port before the tunnel binds it for real; that narrow
    /// race surfaces as a bind failure on the open path.
    async fn pick_free_port(&self) -> Result<u16, RelayError> {
        for _ in 0..PICK_ATTEMPTS {
            let candidate = self.ranges.pick();
            match tokio::net::TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(_) => return Ok(candidate),
                Err(e) => debug!(port = candidate, error = %e, "Port candidate unavailable"),
            }
        }
        Err(RelayError::Rejected(format!(
            "no free port available in the allowed ranges ({})",
            self.ranges
        )))
    }
}

#[async_trait]
impl RequestInterceptor for PortPolicy {
    async fn proceed(&self, request: TunnelRequest) -> Result<TunnelRequest, RelayError> {
        match request {
            TunnelRequest::Tcp {
                local_addr,
                local_port,
                remote_port,
            } => {
                let remote_port = if remote_port == 0 {
                    self.pick_free_port().await?
                } else if self.ranges.contains(remote_port) {
                    remote_port
                } else {
                    return Err(RelayError::Rejected(format!(
                        "remote port {remote_port} is outside the allowed ranges ({})",
                        self.ranges
                    )));
                };
                Ok(TunnelRequest::Tcp {
                    local_addr,
                    local_port,
                    remote_port,
                })
            }
            http => Ok(http),
        }
    }
}
