use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// Abstraction of the unreliable datagram transport, introduced to facilitate replacing the
///  actual UDP socket for testing.
///
/// NB: `recv_from` must be cancel-safe, i.e. dropping a pending call must not lose a datagram.
///  The sender races it against the ack timer and drops it when the timer wins.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        let num_sent = UdpSocket::send_to(self, datagram, to).await?;
        if num_sent != datagram.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, format!("sent {} of {} bytes", num_sent, datagram.len())));
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a non-blocking UDP socket, optionally setting its OS level send and receive buffer
///  sizes. Must be called from inside a tokio runtime.
pub fn bind_udp(addr: SocketAddr, buffer_size: Option<usize>) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(buffer_size) = buffer_size {
        apply_buffer_size(&socket, buffer_size);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    debug!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(socket)
}

/// The OS may round or clamp buffer sizes, and failing to set them is not a reason to abort:
///  it affects throughput, not correctness
fn apply_buffer_size(socket: &Socket, buffer_size: usize) {
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("could not set socket receive buffer size to {}: {}", buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!("could not set socket send buffer size to {}: {}", buffer_size, e);
    }
    trace!("socket buffer sizes: recv={:?}, send={:?}", socket.recv_buffer_size(), socket.send_buffer_size());
}
