use std::io;

use tokio::net::TcpListener;

/// Host the supervised process listens on and the dial address points at.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Obtains an unused ephemeral port on the loopback interface.
///
/// Binds a transient listener on port 0, reads the OS-assigned port and
/// releases the socket again. The port is free with high probability at the
/// moment of return; exclusivity is only guaranteed once the child binds it,
/// which happens almost immediately after spawn.
pub async fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind((LOOPBACK_HOST, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::{allocate_port, LOOPBACK_HOST};

    #[tokio::test]
    async fn allocated_port_is_nonzero() {
        let port = allocate_port().await.expect("failed to allocate port");
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn allocated_port_is_bindable_afterwards() {
        let port = allocate_port().await.expect("failed to allocate port");
        let listener = TcpListener::bind((LOOPBACK_HOST, port))
            .await
            .expect("expected the freshly allocated port to be bindable");
        assert_eq!(
            listener
                .local_addr()
                .expect("listener has no local address")
                .port(),
            port
        );
    }
}
