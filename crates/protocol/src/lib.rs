//! Client transport protocol: the transaction envelope, unsolicited
//! server-originated messages with their addressing filters, and the cluster
//! event vocabulary exchanged between nodes.
//!
//! The transport carries exactly one message family. Client → server is
//! always a [`RequestTransaction`]; server → client is either the matching
//! [`ResponseTransaction`] or an [`UnsolicitedMessage`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bp_domain::login::DeviceKind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transaction envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One request inside a transaction. The `ressource` spelling is part of the
/// wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub ressource: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransaction {
    pub transaction_nr: u64,
    #[serde(default)]
    pub requests: Vec<Request>,
}

impl RequestTransaction {
    /// An authentication transaction is exactly one request against the
    /// `auth` ressource; nothing else may ride in the same message.
    pub fn is_auth(&self) -> bool {
        self.requests.len() == 1 && self.requests[0].ressource == "auth"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTransaction {
    pub transaction_nr: u64,
    pub responses: Vec<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseTransaction {
    pub fn error(transaction_nr: u64, code: String) -> Self {
        Self {
            transaction_nr,
            responses: Vec::new(),
            error: Some(code),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unsolicited server → client messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-originated message pushed outside any transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ressource", content = "payload", rename_all = "camelCase")]
pub enum UnsolicitedMessage {
    ClientEventsChanged,
    CollectionChanged(CollectionChanged),
    ConfigChanged,
    FilesCopied(FilesCopied),
    FileRequested(FileRequested),
    JsFunctionCalled(JsFunctionCalled),
    KeystrokesRequested(KeystrokesRequested),
    /// Sent on credential renewal so the client swaps its bearer token.
    Reauthorized,
    SchemaLoading,
    SchemaLoaded(SchemaLoaded),
    /// Close the connection after delivery.
    Kick,
    /// Close the connection after delivery unless the login is admin.
    KickNonAdmin,
}

impl UnsolicitedMessage {
    /// Messages delivered to at most one matching connection.
    pub fn single_recipient(&self) -> bool {
        matches!(
            self,
            UnsolicitedMessage::JsFunctionCalled(_) | UnsolicitedMessage::KeystrokesRequested(_)
        )
    }

    /// Messages that close the connection after the write.
    pub fn kicks(&self) -> Option<KickScope> {
        match self {
            UnsolicitedMessage::Kick => Some(KickScope::All),
            UnsolicitedMessage::KickNonAdmin => Some(KickScope::NonAdmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickScope {
    All,
    NonAdmin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionChanged {
    pub collection_id: Uuid,
    pub login_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesCopied {
    pub attribute_id: Uuid,
    pub file_ids: Vec<Uuid>,
    pub record_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequested {
    pub attribute_id: Uuid,
    pub file_id: Uuid,
    pub record_id: i64,
    pub choose_app: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsFunctionCalled {
    pub js_function_id: Uuid,
    pub arguments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokesRequested {
    pub keystrokes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaLoaded {
    pub module_ids: Vec<Uuid>,
    pub date_change: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Addressing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Target filter for unsolicited messages. `None` fields match anything.
/// `pwa_module_id_preferred` narrows but never excludes: among the strict
/// matches, if any connection matches the preferred id, only those receive
/// the message; otherwise all strict matches do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressFilter {
    pub address: Option<String>,
    pub device: Option<DeviceKind>,
    pub login_id: Option<i64>,
    pub pwa_module_id_preferred: Option<Uuid>,
}

impl AddressFilter {
    pub fn everyone() -> Self {
        Self::default()
    }

    pub fn login(login_id: i64) -> Self {
        Self {
            login_id: Some(login_id),
            ..Default::default()
        }
    }

    /// Strict part of the match: address, device and login id.
    pub fn matches(
        &self,
        address: &str,
        device: DeviceKind,
        login_id: i64,
    ) -> bool {
        if let Some(want) = &self.address {
            if want != address {
                return false;
            }
        }
        if let Some(want) = self.device {
            if want != device {
                return false;
            }
        }
        if let Some(want) = self.login_id {
            if want != login_id {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cluster events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cross-node signal, persisted as a `node_event` row per recipient node and
/// delivered at-least-once; consumers are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "content", content = "payload", rename_all = "camelCase")]
pub enum ClusterEvent {
    CollectionUpdated(CollectionChanged),
    #[serde(rename_all = "camelCase")]
    ConfigChanged {
        /// Whether the node processing this event should switch maintenance
        /// state (production/builder mode flips kick non-admins).
        switched_off: bool,
    },
    #[serde(rename_all = "camelCase")]
    LoginDisabled {
        login_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    LoginReauthorized {
        login_id: i64,
    },
    LoginReauthorizedAll,
    MasterAssigned {
        state: bool,
    },
    #[serde(rename_all = "camelCase")]
    SchemaChanged {
        module_ids: Vec<Uuid>,
    },
    ShutdownTriggered,
    TasksChanged,
    #[serde(rename_all = "camelCase")]
    TaskTriggered {
        task_name: String,
        pg_function_id: Option<Uuid>,
        pg_function_schedule_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    JsFunctionCalled {
        login_id: i64,
        js_function_id: Uuid,
        arguments: Vec<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    ClientEventsChanged {
        login_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    KeystrokesRequested {
        login_id: i64,
        keystrokes: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRequested {
        login_id: i64,
        attribute_id: Uuid,
        file_id: Uuid,
        record_id: i64,
        choose_app: bool,
    },
    #[serde(rename_all = "camelCase")]
    FilesCopied {
        login_id: i64,
        attribute_id: Uuid,
        file_ids: Vec<Uuid>,
        record_id: i64,
    },
}

impl ClusterEvent {
    /// Stable wire name stored in the `node_event.content` column.
    pub fn content_name(&self) -> &'static str {
        match self {
            ClusterEvent::CollectionUpdated(_) => "collectionUpdated",
            ClusterEvent::ConfigChanged { .. } => "configChanged",
            ClusterEvent::LoginDisabled { .. } => "loginDisabled",
            ClusterEvent::LoginReauthorized { .. } => "loginReauthorized",
            ClusterEvent::LoginReauthorizedAll => "loginReauthorizedAll",
            ClusterEvent::MasterAssigned { .. } => "masterAssigned",
            ClusterEvent::SchemaChanged { .. } => "schemaChanged",
            ClusterEvent::ShutdownTriggered => "shutdownTriggered",
            ClusterEvent::TasksChanged => "tasksChanged",
            ClusterEvent::TaskTriggered { .. } => "taskTriggered",
            ClusterEvent::JsFunctionCalled { .. } => "jsFunctionCalled",
            ClusterEvent::ClientEventsChanged { .. } => "clientEventsChanged",
            ClusterEvent::KeystrokesRequested { .. } => "keystrokesRequested",
            ClusterEvent::FileRequested { .. } => "fileRequested",
            ClusterEvent::FilesCopied { .. } => "filesCopied",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_transaction_detection() {
        let tx = RequestTransaction {
            transaction_nr: 1,
            requests: vec![Request {
                ressource: "auth".into(),
                action: "user".into(),
                payload: serde_json::Value::Null,
            }],
        };
        assert!(tx.is_auth());

        let tx = RequestTransaction {
            transaction_nr: 2,
            requests: vec![
                Request {
                    ressource: "auth".into(),
                    action: "user".into(),
                    payload: serde_json::Value::Null,
                },
                Request {
                    ressource: "data".into(),
                    action: "get".into(),
                    payload: serde_json::Value::Null,
                },
            ],
        };
        assert!(!tx.is_auth(), "auth may not ride with other requests");
    }

    #[test]
    fn envelope_uses_wire_names() {
        let tx = RequestTransaction {
            transaction_nr: 7,
            requests: vec![],
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert!(json.get("transactionNr").is_some());

        let raw = r#"{"transactionNr":9,"requests":[{"ressource":"data","action":"get","payload":{}}]}"#;
        let back: RequestTransaction = serde_json::from_str(raw).unwrap();
        assert_eq!(back.transaction_nr, 9);
        assert_eq!(back.requests[0].ressource, "data");
    }

    #[test]
    fn filter_strict_matching() {
        let filter = AddressFilter {
            login_id: Some(12),
            device: Some(DeviceKind::Browser),
            ..Default::default()
        };
        assert!(filter.matches("10.0.0.1", DeviceKind::Browser, 12));
        assert!(!filter.matches("10.0.0.1", DeviceKind::FatClient, 12));
        assert!(!filter.matches("10.0.0.1", DeviceKind::Browser, 13));

        let all = AddressFilter::everyone();
        assert!(all.matches("anywhere", DeviceKind::FatClient, 0));
    }

    #[test]
    fn single_recipient_messages() {
        let msg = UnsolicitedMessage::JsFunctionCalled(JsFunctionCalled {
            js_function_id: Uuid::new_v4(),
            arguments: vec![],
        });
        assert!(msg.single_recipient());
        assert!(!UnsolicitedMessage::ConfigChanged.single_recipient());
    }

    #[test]
    fn cluster_event_wire_names_are_stable() {
        let ev = ClusterEvent::SchemaChanged {
            module_ids: vec![],
        };
        assert_eq!(ev.content_name(), "schemaChanged");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["content"], "schemaChanged");

        let ev = ClusterEvent::TaskTriggered {
            task_name: "mailSend".into(),
            pg_function_id: None,
            pg_function_schedule_id: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ClusterEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn kick_scopes() {
        assert_eq!(UnsolicitedMessage::Kick.kicks(), Some(KickScope::All));
        assert_eq!(
            UnsolicitedMessage::KickNonAdmin.kicks(),
            Some(KickScope::NonAdmin)
        );
        assert_eq!(UnsolicitedMessage::SchemaLoading.kicks(), None);
    }
}
