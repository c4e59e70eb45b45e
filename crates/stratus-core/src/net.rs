// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound IP address discovery.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Resolves the address this machine uses for outbound traffic.
#[async_trait]
pub trait OutboundIp: Send + Sync {
    /// Best-effort lookup; callers fall back to loopback on error.
    async fn resolve(&self) -> std::io::Result<IpAddr>;
}

/// Discovers the outbound address by "connecting" a UDP socket to a public
/// address and reading back the local end. No packets are sent.
#[derive(Debug, Clone)]
pub struct UdpOutboundIp {
    probe_addr: SocketAddr,
}

impl Default for UdpOutboundIp {
    fn default() -> Self {
        Self {
            probe_addr: SocketAddr::from(([8, 8, 8, 8], 80)),
        }
    }
}

impl UdpOutboundIp {
    /// Use `probe_addr` instead of the default public resolver address.
    pub fn with_probe_addr(probe_addr: SocketAddr) -> Self {
        Self { probe_addr }
    }
}

#[async_trait]
impl OutboundIp for UdpOutboundIp {
    async fn resolve(&self) -> std::io::Result<IpAddr> {
        let bind_addr: SocketAddr = if self.probe_addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.probe_addr).await?;
        Ok(socket.local_addr()?.ip())
    }
}
