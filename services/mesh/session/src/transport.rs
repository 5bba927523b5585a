//! TCP transport for mesh connections.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Default accept backlog for listeners
pub const DEFAULT_BACKLOG: u32 = 128;

/// Create a TCP listener bound to the given address with an explicit backlog
pub fn listen_tcp(addr: SocketAddr, backlog: u32) -> tokio::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address, giving up after `timeout`
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> tokio::io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_and_connect() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        let (accepted, connected) = tokio::join!(
            listener.accept(),
            connect_tcp(addr, Duration::from_secs(1))
        );
        let (_, peer) = accepted.unwrap();
        assert_eq!(connected.unwrap().local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect_tcp(addr, Duration::from_secs(1)).await.is_err());
    }
}
