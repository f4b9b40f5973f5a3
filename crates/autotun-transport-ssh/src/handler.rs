//! russh client callbacks

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::Channel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A forwarded connection: the channel plus a printable originator address
pub(crate) type Forwarded<T> = (T, String);

/// Routes incoming forwarded connections to the listener that asked for them
///
/// Keyed by the remote port the listener was opened on. A listener on port 0 also
/// receives connections for ports nobody registered explicitly.
#[derive(Debug)]
pub(crate) struct ForwardTable<T> {
    routes: Arc<Mutex<HashMap<u16, mpsc::UnboundedSender<Forwarded<T>>>>>,
}

impl<T> Clone for ForwardTable<T> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
        }
    }
}

impl<T> ForwardTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn register(&self, port: u16) -> mpsc::UnboundedReceiver<Forwarded<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(port, tx);
        rx
    }

    pub(crate) fn unregister(&self, port: u16) {
        self.lock().remove(&port);
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Hand `item` to the listener for `port`; gives it back if nobody wants it
    pub(crate) fn route(&self, port: u16, item: Forwarded<T>) -> Result<(), Forwarded<T>> {
        let routes = self.lock();
        let sender = routes.get(&port).or_else(|| routes.get(&0));
        match sender {
            Some(sender) => sender.send(item).map_err(|e| e.0),
            None => Err(item),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, mpsc::UnboundedSender<Forwarded<T>>>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client handler; lives exactly as long as the SSH connection task
pub(crate) struct SshHandler {
    pub(crate) session_id: String,
    pub(crate) forwards: ForwardTable<Channel<Msg>>,
    pub(crate) closed: CancellationToken,
}

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No known_hosts store; the first key presented is trusted
        warn!(
            session_id = %self.session_id,
            key_type = %server_public_key.name(),
            "Host key verification not implemented, accepting key"
        );
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(session_id = %self.session_id, banner = %banner.trim_end(), "SSH banner");
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let originator = format!("{}:{}", originator_address, originator_port);
        debug!(
            session_id = %self.session_id,
            connected = %format!("{}:{}", connected_address, connected_port),
            originator = %originator,
            "Forwarded connection opened by server"
        );

        let port = u16::try_from(connected_port).unwrap_or(0);
        if let Err((channel, _)) = self.forwards.route(port, (channel, originator)) {
            warn!(
                session_id = %self.session_id,
                port = connected_port,
                "No listener for forwarded connection, closing channel"
            );
            let _ = channel.close().await;
        }
        Ok(())
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        debug!(session_id = %self.session_id, "SSH connection task finished");
        self.forwards.clear();
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_registered_port() {
        let table: ForwardTable<u32> = ForwardTable::new();
        let mut rx = table.register(8080);

        table.route(8080, (7, "10.0.0.1:5000".to_string())).unwrap();
        assert_eq!(rx.try_recv().unwrap(), (7, "10.0.0.1:5000".to_string()));
    }

    #[test]
    fn test_route_falls_back_to_port_zero() {
        let table: ForwardTable<u32> = ForwardTable::new();
        let mut wildcard = table.register(0);

        table.route(43210, (1, "peer".to_string())).unwrap();
        assert_eq!(wildcard.try_recv().unwrap().0, 1);
    }

    #[test]
    fn test_route_without_listener_returns_item() {
        let table: ForwardTable<u32> = ForwardTable::new();
        let rx = table.register(9000);
        table.unregister(9000);
        drop(rx);

        let rejected = table.route(9000, (3, "peer".to_string())).unwrap_err();
        assert_eq!(rejected.0, 3);
    }

    #[test]
    fn test_route_to_dropped_receiver_returns_item() {
        let table: ForwardTable<u32> = ForwardTable::new();
        drop(table.register(9000));

        assert!(table.route(9000, (4, "peer".to_string())).is_err());
    }

    #[test]
    fn test_clear_drops_all_routes() {
        let table: ForwardTable<u32> = ForwardTable::new();
        let mut rx = table.register(1);
        table.clone().clear();

        assert!(table.route(1, (5, "peer".to_string())).is_err());
        assert!(rx.try_recv().is_err());
    }
}
