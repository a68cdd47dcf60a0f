// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP RTP/RTCP socket pairs (§4.6): one even/odd ephemeral port pair per
//! stream on the client side, a configurable bound pair with a dispatch
//! loop on the server side. `SO_RCVBUF` is set and then read back, since
//! Linux silently doubles whatever value is requested; a mismatch means the
//! kernel clamped the request below `net.core.rmem_max`.

use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::{wrap, ConnectionContext, Error, ErrorInt};

fn loopback_ctx() -> ConnectionContext {
    ConnectionContext::new("0.0.0.0:0".parse().unwrap(), "0.0.0.0:0".parse().unwrap())
}

/// Binds one socket, requesting `rcvbuf` bytes of receive buffer and
/// verifying the kernel actually granted at least `2 * rcvbuf` (the Linux
/// doubling convention): anything less means `net.core.rmem_max` is
/// clamping it.
pub fn bind_with_rcvbuf(addr: SocketAddr, rcvbuf: Option<usize>) -> Result<std::net::UdpSocket, Error> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None).map_err(Error::from)?;
    socket.set_reuse_address(true).map_err(Error::from)?;
    if let Some(want) = rcvbuf {
        socket.set_recv_buffer_size(want).map_err(Error::from)?;
        let got = socket.recv_buffer_size().map_err(Error::from)?;
        if got < 2 * want {
            bail!(ErrorInt::Transport {
                conn_ctx: loopback_ctx(),
                description: format!(
                    "requested {}-byte UDP receive buffer but kernel granted only {} \
                     (expected >= {}; raise net.core.rmem_max)",
                    want,
                    got,
                    2 * want
                ),
            });
        }
    }
    socket.bind(&addr.into()).map_err(Error::from)?;
    socket.set_nonblocking(true).map_err(Error::from)?;
    Ok(socket.into())
}

use crate::bail;

/// One RTP+RTCP UDP socket pair, bound to adjacent ports (even RTP, odd
/// RTCP) per RFC 3550 §11.
pub struct UdpPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    remote: Option<(SocketAddr, SocketAddr)>,
}

impl UdpPair {
    /// Client-side: picks an ephemeral even/odd port pair by trying
    /// consecutive ports starting from an OS-assigned even one.
    pub async fn bind_client() -> Result<Self, Error> {
        loop {
            let probe = bind_with_rcvbuf("0.0.0.0:0".parse().unwrap(), None)?;
            let probe_port = probe.local_addr().map_err(Error::from)?.port();
            drop(probe);
            let rtp_port = if probe_port % 2 == 0 { probe_port } else { probe_port + 1 };
            let rtp_addr: SocketAddr = format!("0.0.0.0:{}", rtp_port).parse().unwrap();
            let rtcp_addr: SocketAddr = format!("0.0.0.0:{}", rtp_port + 1).parse().unwrap();
            let rtp_std = match bind_with_rcvbuf(rtp_addr, None) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let rtcp_std = match bind_with_rcvbuf(rtcp_addr, None) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let rtp = UdpSocket::from_std(rtp_std).map_err(Error::from)?;
            let rtcp = UdpSocket::from_std(rtcp_std).map_err(Error::from)?;
            return Ok(Self { rtp, rtcp, remote: None });
        }
    }

    /// Server-side: binds the configured pair directly, applying
    /// `udp_read_buffer_size` to both sockets.
    pub async fn bind_server(rtp_port: u16, rcvbuf: Option<usize>) -> Result<Self, Error> {
        let rtp_addr: SocketAddr = format!("0.0.0.0:{}", rtp_port).parse().unwrap();
        let rtcp_addr: SocketAddr = format!("0.0.0.0:{}", rtp_port + 1).parse().unwrap();
        let rtp = UdpSocket::from_std(bind_with_rcvbuf(rtp_addr, rcvbuf)?).map_err(Error::from)?;
        let rtcp = UdpSocket::from_std(bind_with_rcvbuf(rtcp_addr, rcvbuf)?).map_err(Error::from)?;
        Ok(Self { rtp, rtcp, remote: None })
    }

    pub fn client_ports(&self) -> (u16, u16) {
        (
            self.rtp.local_addr().map(|a| a.port()).unwrap_or(0),
            self.rtcp.local_addr().map(|a| a.port()).unwrap_or(0),
        )
    }

    /// Binds the peer's advertised `server_port` pair as this socket's
    /// connected remote, so `send`/`recv` (rather than `*_from`) can be used
    /// and spoofed datagrams from other hosts are rejected by the kernel.
    pub async fn set_remote(&mut self, peer_ip: IpAddr, server_ports: (u16, u16)) -> Result<(), Error> {
        let rtp_addr = SocketAddr::new(peer_ip, server_ports.0);
        let rtcp_addr = SocketAddr::new(peer_ip, server_ports.1);
        self.rtp.connect(rtp_addr).await.map_err(Error::from)?;
        self.rtcp.connect(rtcp_addr).await.map_err(Error::from)?;
        self.remote = Some((rtp_addr, rtcp_addr));
        Ok(())
    }

    pub async fn recv_rtp(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.rtp.recv(buf).await.map_err(Error::from)
    }

    pub async fn recv_rtcp(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.rtcp.recv(buf).await.map_err(Error::from)
    }

    pub async fn send_rtp(&self, buf: &[u8]) -> Result<usize, Error> {
        self.rtp.send(buf).await.map_err(Error::from)
    }

    pub async fn send_rtcp(&self, buf: &[u8]) -> Result<usize, Error> {
        self.rtcp.send(buf).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_pair_binds_adjacent_even_odd_ports() {
        let pair = UdpPair::bind_client().await.unwrap();
        let (rtp_port, rtcp_port) = pair.client_ports();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
    }
}
