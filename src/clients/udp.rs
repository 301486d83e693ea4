use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// A UDP DNS client for one-shot exchanges with an upstream resolver.
///
/// Each exchange uses a fresh ephemeral socket connected to the server, so
/// a response can only come from the address the query went to.
///
/// See <https://datatracker.ietf.org/doc/html/rfc1035#section-4.2.1>
pub struct UdpClient {
    read_timeout: Duration,
}

impl Default for UdpClient {
    fn default() -> Self {
        UdpClient {
            read_timeout: Duration::new(5, 0),
        }
    }
}

impl UdpClient {
    /// Sends the encoded query to `server` and returns the raw response.
    ///
    /// The response bytes are returned unparsed: when the proxy has nothing
    /// to rewrite it forwards them to the client untouched.
    pub async fn exchange(&self, query: &[u8], server: SocketAddr) -> io::Result<Vec<u8>> {
        let local: SocketAddr = if server.is_ipv4() {
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
        } else {
            (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        socket.send(query).await?;

        let mut buf = vec![0; 4096];
        let len = match timeout(self.read_timeout, socket.recv(&mut buf)).await {
            Ok(len) => len?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no response from {} within {:?}", server, self.read_timeout),
                ))
            }
        };

        buf.truncate(len);
        Ok(buf)
    }
}
