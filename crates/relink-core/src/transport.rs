use std::{io, net::SocketAddr};

/// A non-blocking datagram socket.
///
/// The peer only ever talks to the network through this trait, which keeps
/// the protocol testable against in-memory implementations. `receive_packet`
/// must return `io::ErrorKind::WouldBlock` when no datagram is waiting so a
/// tick never stalls on the network.
pub trait Socket {
    /// Sends one datagram to the given address. Returns the number of
    /// bytes sent.
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize>;

    /// Receives one datagram into `buffer`, returning the filled slice and
    /// the sender's address.
    fn receive_packet<'a>(
        &mut self,
        buffer: &'a mut [u8],
    ) -> io::Result<(&'a [u8], SocketAddr)>;

    /// The local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
