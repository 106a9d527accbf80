//! Connection hub: the registry of live client connections and the delivery
//! path for unsolicited server messages.
//!
//! Every connection owns exactly one writer task draining an mpsc channel;
//! all frames for a connection flow through that channel, so writes are
//! strictly serialised without further locking. A failed write marks the
//! connection once and enqueues it for removal; the remover closes the
//! transport, aborts in-flight handlers and deletes the session-log row.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use bp_domain::login::DeviceKind;
use bp_protocol::{AddressFilter, KickScope, UnsolicitedMessage};

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

pub type ClientSink = mpsc::Sender<OutboundFrame>;

/// A registered client connection.
pub struct ClientConn {
    pub id: Uuid,
    pub address: String,
    pub admin: bool,
    pub device: DeviceKind,
    /// Derived from the request host when the client runs as a PWA.
    pub pwa_module_id: Option<Uuid>,
    /// 0 while unauthenticated.
    pub login_id: i64,
    pub no_auth: bool,
    pub(crate) io_failed: bool,
    pub sink: ClientSink,
    /// Aborting terminates the socket task and with it every in-flight
    /// handler spawned for this connection.
    pub abort: AbortHandle,
}

pub struct Hub {
    conns: RwLock<HashMap<Uuid, ClientConn>>,
    removal_tx: mpsc::UnboundedSender<Uuid>,
    removal_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl Hub {
    pub fn new() -> Self {
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        Self {
            conns: RwLock::new(HashMap::new()),
            removal_tx,
            removal_rx: Mutex::new(Some(removal_rx)),
        }
    }

    /// The remover loop's receiving end; taken exactly once at boot.
    pub fn take_removal_rx(&self) -> mpsc::UnboundedReceiver<Uuid> {
        self.removal_rx
            .lock()
            .take()
            .expect("removal receiver already taken")
    }

    pub fn register(&self, conn: ClientConn) {
        tracing::info!(
            conn_id = %conn.id,
            address = %conn.address,
            device = conn.device.as_str(),
            "client connected"
        );
        self.conns.write().insert(conn.id, conn);
    }

    /// Remove a connection from the registry, returning it for cleanup.
    pub fn remove(&self, id: &Uuid) -> Option<ClientConn> {
        let conn = self.conns.write().remove(id);
        if let Some(conn) = &conn {
            tracing::info!(conn_id = %id, login_id = conn.login_id, "client removed");
        }
        conn
    }

    /// Imprint authentication results onto the connection.
    pub fn set_auth(&self, id: &Uuid, login_id: i64, admin: bool, no_auth: bool) {
        if let Some(conn) = self.conns.write().get_mut(id) {
            conn.login_id = login_id;
            conn.admin = admin;
            conn.no_auth = no_auth;
        }
    }

    pub fn login_id(&self, id: &Uuid) -> Option<i64> {
        self.conns.read().get(id).map(|c| c.login_id)
    }

    pub fn is_admin(&self, id: &Uuid) -> Option<bool> {
        self.conns.read().get(id).map(|c| c.admin)
    }

    pub fn sink(&self, id: &Uuid) -> Option<ClientSink> {
        self.conns.read().get(id).map(|c| c.sink.clone())
    }

    pub fn count(&self) -> usize {
        self.conns.read().len()
    }

    /// Flag an I/O failure and enqueue removal. Only the first failure per
    /// connection does anything; later writes are suppressed by the flag.
    pub fn mark_io_failed(&self, id: &Uuid) {
        let mut conns = self.conns.write();
        if let Some(conn) = conns.get_mut(id) {
            if conn.io_failed {
                return;
            }
            conn.io_failed = true;
            let _ = self.removal_tx.send(*id);
            tracing::warn!(conn_id = %id, "connection write failed, removal enqueued");
        }
    }

    /// Enqueue a connection for removal (used by the kick path).
    pub fn enqueue_removal(&self, id: &Uuid) {
        let _ = self.removal_tx.send(*id);
    }

    /// Deliver an unsolicited message to every connection matching the
    /// filter.
    ///
    /// Addressing: strict fields (address, device, login id) must match.
    /// Among the strict matches, if any connection matches the preferred PWA
    /// module id, only those receive the message; otherwise all matches do.
    /// Single-recipient messages stop after the first delivery. Kick
    /// messages close the connection after the write.
    pub fn publish(&self, msg: &UnsolicitedMessage, filter: &AddressFilter) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(%err, "failed to serialise unsolicited message");
                return;
            }
        };

        struct Target {
            id: Uuid,
            admin: bool,
            pwa_module_id: Option<Uuid>,
            sink: ClientSink,
        }

        let mut targets: Vec<Target> = {
            let conns = self.conns.read();
            conns
                .values()
                .filter(|c| !c.io_failed)
                .filter(|c| filter.matches(&c.address, c.device, c.login_id))
                .map(|c| Target {
                    id: c.id,
                    admin: c.admin,
                    pwa_module_id: c.pwa_module_id,
                    sink: c.sink.clone(),
                })
                .collect()
        };

        if let Some(preferred) = filter.pwa_module_id_preferred {
            if targets.iter().any(|t| t.pwa_module_id == Some(preferred)) {
                targets.retain(|t| t.pwa_module_id == Some(preferred));
            }
        }

        let kick = msg.kicks();
        let single = msg.single_recipient();

        for target in targets {
            if kick == Some(KickScope::NonAdmin) && target.admin {
                continue;
            }

            if target.sink.try_send(OutboundFrame::Text(json.clone())).is_err() {
                self.mark_io_failed(&target.id);
                continue;
            }

            if kick.is_some() {
                let _ = target.sink.try_send(OutboundFrame::Close);
                self.enqueue_removal(&target.id);
            }
            if single {
                return;
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_protocol::{JsFunctionCalled, KeystrokesRequested};

    fn conn(
        hub: &Hub,
        login_id: i64,
        admin: bool,
        device: DeviceKind,
        pwa: Option<Uuid>,
    ) -> (Uuid, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let abort = tokio::spawn(async {}).abort_handle();
        let id = Uuid::new_v4();
        hub.register(ClientConn {
            id,
            address: "10.1.1.1".into(),
            admin,
            device,
            pwa_module_id: pwa,
            login_id,
            no_auth: false,
            io_failed: false,
            sink: tx,
            abort,
        });
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn strict_filter_selects_by_login() {
        let hub = Hub::new();
        let (_, mut rx_a) = conn(&hub, 7, false, DeviceKind::Browser, None);
        let (_, mut rx_b) = conn(&hub, 8, false, DeviceKind::Browser, None);

        hub.publish(&UnsolicitedMessage::Reauthorized, &AddressFilter::login(7));

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn pwa_preference_narrows_but_never_excludes() {
        let hub = Hub::new();
        let pwa_module = Uuid::new_v4();
        let (_, mut rx_pwa) = conn(&hub, 7, false, DeviceKind::Browser, Some(pwa_module));
        let (_, mut rx_plain) = conn(&hub, 7, false, DeviceKind::Browser, None);

        // A PWA connection matches the preference: only it receives.
        let filter = AddressFilter {
            login_id: Some(7),
            pwa_module_id_preferred: Some(pwa_module),
            ..Default::default()
        };
        hub.publish(&UnsolicitedMessage::ConfigChanged, &filter);
        assert_eq!(drain(&mut rx_pwa).len(), 1);
        assert!(drain(&mut rx_plain).is_empty());

        // No connection matches the preferred id: everyone matching the
        // strict filter receives.
        let filter = AddressFilter {
            login_id: Some(7),
            pwa_module_id_preferred: Some(Uuid::new_v4()),
            ..Default::default()
        };
        hub.publish(&UnsolicitedMessage::ConfigChanged, &filter);
        assert_eq!(drain(&mut rx_pwa).len(), 1);
        assert_eq!(drain(&mut rx_plain).len(), 1);
    }

    #[tokio::test]
    async fn single_recipient_stops_after_first_match() {
        let hub = Hub::new();
        let (_, mut rx_a) = conn(&hub, 7, false, DeviceKind::Browser, None);
        let (_, mut rx_b) = conn(&hub, 7, false, DeviceKind::Browser, None);

        let msg = UnsolicitedMessage::JsFunctionCalled(JsFunctionCalled {
            js_function_id: Uuid::new_v4(),
            arguments: vec![],
        });
        hub.publish(&msg, &AddressFilter::login(7));

        let delivered = drain(&mut rx_a).len() + drain(&mut rx_b).len();
        assert_eq!(delivered, 1, "exactly one connection receives");

        let msg = UnsolicitedMessage::KeystrokesRequested(KeystrokesRequested {
            keystrokes: "ctrl+p".into(),
        });
        hub.publish(&msg, &AddressFilter::login(7));
        let delivered = drain(&mut rx_a).len() + drain(&mut rx_b).len();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn kick_non_admin_spares_admins() {
        let hub = Hub::new();
        let (_, mut rx_admin) = conn(&hub, 1, true, DeviceKind::Browser, None);
        let (_, mut rx_user) = conn(&hub, 2, false, DeviceKind::Browser, None);

        hub.publish(&UnsolicitedMessage::KickNonAdmin, &AddressFilter::everyone());

        assert!(drain(&mut rx_admin).is_empty(), "admins are spared");
        let frames = drain(&mut rx_user);
        assert_eq!(frames.len(), 2, "message then close frame");
        assert_eq!(frames[1], OutboundFrame::Close);
    }

    #[tokio::test]
    async fn io_failure_enqueues_removal_exactly_once() {
        let hub = Hub::new();
        let mut removal_rx = hub.take_removal_rx();

        // A zero-capacity-like sink: fill the channel so sends fail.
        let (id, rx) = conn(&hub, 7, false, DeviceKind::Browser, None);
        drop(rx);

        hub.publish(&UnsolicitedMessage::ConfigChanged, &AddressFilter::everyone());
        hub.publish(&UnsolicitedMessage::ConfigChanged, &AddressFilter::everyone());

        assert_eq!(removal_rx.try_recv().ok(), Some(id));
        assert!(
            removal_rx.try_recv().is_err(),
            "second failure must not enqueue again"
        );
    }

    #[tokio::test]
    async fn set_auth_imprints_connection() {
        let hub = Hub::new();
        let (id, mut rx) = conn(&hub, 0, false, DeviceKind::Browser, None);

        // Unauthenticated: not addressed by login filters.
        hub.publish(&UnsolicitedMessage::Reauthorized, &AddressFilter::login(42));
        assert!(drain(&mut rx).is_empty());

        hub.set_auth(&id, 42, false, false);
        hub.publish(&UnsolicitedMessage::Reauthorized, &AddressFilter::login(42));
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
