/// Network plumbing: TLS material, cloud CA bundles and socket options
pub mod ca;
pub mod tls;

pub use ca::{init_ca_cert, CaDownloader, HttpCaDownloader};
pub use tls::{load_certificates, load_private_key, TlsMaterial};

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

/// Keep-alive probing interval for accepted client sockets
pub const CLIENT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Enable TCP keep-alive and disable Nagle on an accepted socket
pub fn configure_client_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY.");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(CLIENT_KEEPALIVE)
        .with_interval(CLIENT_KEEPALIVE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keep-alive.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_configure_client_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        configure_client_socket(&accepted);
        assert!(accepted.nodelay().unwrap());
        assert!(SockRef::from(&accepted).keepalive().unwrap());
        drop(client);
    }
}
