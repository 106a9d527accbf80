//! Cluster event queue: durable `node_event` rows fanned out per recipient
//! node, drained FIFO into the in-process channel, and the consumer loop
//! mapping each event to a cache refresh or an unsolicited client message.
//!
//! Delivery is at-least-once per recipient (rows are deleted only after the
//! event reached the channel); every consumer action is idempotent.

use sqlx::Row;
use tokio::sync::mpsc;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::login::DeviceKind;
use bp_protocol::{
    AddressFilter, ClusterEvent, CollectionChanged, FileRequested, FilesCopied,
    JsFunctionCalled, KeystrokesRequested, SchemaLoaded, UnsolicitedMessage,
};
use bp_store::Db;

use crate::state::AppState;

/// An event as drained from this node's queue, with its client targeting.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: ClusterEvent,
    pub target_address: Option<String>,
    pub target_device: Option<DeviceKind>,
    pub target_login_id: Option<i64>,
}

/// Which nodes receive a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    AllNodes,
    MasterOnly,
    Node(Uuid),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Producer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialise the event into its (content, payload) wire columns.
fn wire_parts(event: &ClusterEvent) -> Result<(String, String)> {
    let value = serde_json::to_value(event)?;
    let payload = match value.get("payload") {
        Some(payload) => serde_json::to_string(payload)?,
        None => String::new(),
    };
    Ok((event.content_name().to_string(), payload))
}

/// Rebuild the event from its wire columns.
fn parse_event(content: &str, payload: &str) -> Result<ClusterEvent> {
    let mut envelope = serde_json::Map::new();
    envelope.insert("content".into(), serde_json::Value::String(content.into()));
    if !payload.is_empty() {
        envelope.insert("payload".into(), serde_json::from_str(payload)?);
    }
    serde_json::from_value(serde_json::Value::Object(envelope)).map_err(Error::from)
}

/// Insert one `node_event` row per recipient node.
pub async fn publish(
    db: &Db,
    event: &ClusterEvent,
    target: EventTarget,
    filter: &AddressFilter,
) -> Result<()> {
    let (content, payload) = wire_parts(event)?;
    let device = filter.device.map(|d| d.as_str().to_string());

    match target {
        EventTarget::AllNodes => {
            sqlx::query(
                "INSERT INTO instance_cluster.node_event
                    (node_id, content, payload, target_address, target_device, target_login_id)
                 SELECT id, $1, $2, $3, $4, $5 FROM instance_cluster.node WHERE running",
            )
            .bind(&content)
            .bind(&payload)
            .bind(&filter.address)
            .bind(&device)
            .bind(filter.login_id)
            .execute(db.pool())
            .await
            .map_err(classify_db_error)?;
        }
        EventTarget::MasterOnly => {
            sqlx::query(
                "INSERT INTO instance_cluster.node_event
                    (node_id, content, payload, target_address, target_device, target_login_id)
                 SELECT id, $1, $2, $3, $4, $5 FROM instance_cluster.node
                 WHERE running AND cluster_master",
            )
            .bind(&content)
            .bind(&payload)
            .bind(&filter.address)
            .bind(&device)
            .bind(filter.login_id)
            .execute(db.pool())
            .await
            .map_err(classify_db_error)?;
        }
        EventTarget::Node(node_id) => {
            sqlx::query(
                "INSERT INTO instance_cluster.node_event
                    (node_id, content, payload, target_address, target_device, target_login_id)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(node_id)
            .bind(&content)
            .bind(&payload)
            .bind(&filter.address)
            .bind(&device)
            .bind(filter.login_id)
            .execute(db.pool())
            .await
            .map_err(classify_db_error)?;
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Drain (clusterProcessEvents task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drain this node's rows in insertion order into the in-process channel,
/// deleting each row only after it was handed over.
pub async fn drain(state: &AppState) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT id, content, payload, target_address, target_device, target_login_id
         FROM instance_cluster.node_event WHERE node_id = $1 ORDER BY id",
    )
    .bind(state.node_id)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let mut processed = 0usize;
    for row in rows {
        let row_id: i64 = row.try_get("id").map_err(classify_db_error)?;
        let content: String = row.try_get("content").map_err(classify_db_error)?;
        let payload: String = row.try_get("payload").map_err(classify_db_error)?;

        let event = match parse_event(&content, &payload) {
            Ok(event) => event,
            Err(err) => {
                // Unknown event kinds come from newer nodes during rolling
                // upgrades; drop the row, it cannot ever parse here.
                tracing::warn!(content, %err, "dropping unparseable node event");
                delete_event(&state.db, row_id).await?;
                continue;
            }
        };

        let device: Option<String> = row.try_get("target_device").map_err(classify_db_error)?;
        let envelope = EventEnvelope {
            event,
            target_address: row.try_get("target_address").map_err(classify_db_error)?,
            target_device: device.as_deref().and_then(parse_device),
            target_login_id: row.try_get("target_login_id").map_err(classify_db_error)?,
        };

        state
            .events_tx
            .send(envelope)
            .await
            .map_err(|_| Error::Internal("cluster event channel closed".into()))?;

        delete_event(&state.db, row_id).await?;
        processed += 1;
    }
    Ok(processed)
}

async fn delete_event(db: &Db, row_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM instance_cluster.node_event WHERE id = $1")
        .bind(row_id)
        .execute(db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}

fn parse_device(s: &str) -> Option<DeviceKind> {
    match s {
        "browser" => Some(DeviceKind::Browser),
        "fatClient" => Some(DeviceKind::FatClient),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The in-process consumer loop: maps cluster events to schema/config
/// refreshes and unsolicited client messages.
pub async fn consume(state: AppState, mut rx: mpsc::Receiver<EventEnvelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(err) = handle(&state, &envelope).await {
            tracing::error!(
                content = envelope.event.content_name(),
                %err,
                "cluster event handling failed"
            );
        }
    }
    tracing::info!("cluster event consumer stopped");
}

fn filter_from(envelope: &EventEnvelope, login_id: Option<i64>) -> AddressFilter {
    AddressFilter {
        address: envelope.target_address.clone(),
        device: envelope.target_device,
        login_id: envelope.target_login_id.or(login_id),
        pwa_module_id_preferred: None,
    }
}

async fn handle(state: &AppState, envelope: &EventEnvelope) -> Result<()> {
    match &envelope.event {
        ClusterEvent::CollectionUpdated(changed) => {
            if changed.login_ids.is_empty() {
                state.hub.publish(
                    &UnsolicitedMessage::CollectionChanged(changed.clone()),
                    &filter_from(envelope, None),
                );
            } else {
                for login_id in &changed.login_ids {
                    state.hub.publish(
                        &UnsolicitedMessage::CollectionChanged(CollectionChanged {
                            collection_id: changed.collection_id,
                            login_ids: vec![*login_id],
                        }),
                        &filter_from(envelope, Some(*login_id)),
                    );
                }
            }
        }
        ClusterEvent::ConfigChanged { switched_off } => {
            state.runtime.load(&state.db).await?;
            if *switched_off {
                state
                    .hub
                    .publish(&UnsolicitedMessage::KickNonAdmin, &AddressFilter::everyone());
            } else {
                state
                    .hub
                    .publish(&UnsolicitedMessage::ConfigChanged, &AddressFilter::everyone());
            }
        }
        ClusterEvent::LoginDisabled { login_id } => {
            state
                .hub
                .publish(&UnsolicitedMessage::Kick, &AddressFilter::login(*login_id));
        }
        ClusterEvent::LoginReauthorized { login_id } => {
            state.hub.publish(
                &UnsolicitedMessage::Reauthorized,
                &AddressFilter::login(*login_id),
            );
        }
        ClusterEvent::LoginReauthorizedAll => {
            state
                .hub
                .publish(&UnsolicitedMessage::Reauthorized, &AddressFilter::everyone());
        }
        ClusterEvent::MasterAssigned { state: is_master } => {
            state.cluster.set_master(*is_master);
            tracing::info!(is_master, "master assignment received");
        }
        ClusterEvent::SchemaChanged { module_ids } => {
            state
                .hub
                .publish(&UnsolicitedMessage::SchemaLoading, &AddressFilter::everyone());

            let timestamp = if module_ids.is_empty() {
                bp_schema::load_all(&state.db, &state.schema).await?
            } else {
                bp_schema::reload_meta(&state.db, &state.schema).await?;
                bp_schema::update(&state.db, &state.schema, module_ids, false).await?
            };
            crate::scheduler::ensure_function_schedules(state).await?;

            state.hub.publish(
                &UnsolicitedMessage::SchemaLoaded(SchemaLoaded {
                    module_ids: module_ids.clone(),
                    date_change: timestamp,
                }),
                &AddressFilter::everyone(),
            );
        }
        ClusterEvent::ShutdownTriggered => {
            tracing::warn!("shutdown triggered via cluster event");
            state
                .hub
                .publish(&UnsolicitedMessage::Kick, &AddressFilter::everyone());
            crate::cluster::set_stopped(&state.db, state.node_id).await?;
            std::process::exit(0);
        }
        ClusterEvent::TasksChanged => {
            crate::scheduler::ensure_function_schedules(state).await?;
        }
        ClusterEvent::TaskTriggered {
            task_name,
            pg_function_id: _,
            pg_function_schedule_id,
        } => {
            crate::scheduler::run_triggered(state, task_name, *pg_function_schedule_id).await;
        }
        ClusterEvent::JsFunctionCalled {
            login_id,
            js_function_id,
            arguments,
        } => {
            state.hub.publish(
                &UnsolicitedMessage::JsFunctionCalled(JsFunctionCalled {
                    js_function_id: *js_function_id,
                    arguments: arguments.clone(),
                }),
                &filter_from(envelope, Some(*login_id)),
            );
        }
        ClusterEvent::ClientEventsChanged { login_id } => {
            state.hub.publish(
                &UnsolicitedMessage::ClientEventsChanged,
                &filter_from(envelope, Some(*login_id)),
            );
        }
        ClusterEvent::KeystrokesRequested {
            login_id,
            keystrokes,
        } => {
            state.hub.publish(
                &UnsolicitedMessage::KeystrokesRequested(KeystrokesRequested {
                    keystrokes: keystrokes.clone(),
                }),
                &filter_from(envelope, Some(*login_id)),
            );
        }
        ClusterEvent::FileRequested {
            login_id,
            attribute_id,
            file_id,
            record_id,
            choose_app,
        } => {
            state.hub.publish(
                &UnsolicitedMessage::FileRequested(FileRequested {
                    attribute_id: *attribute_id,
                    file_id: *file_id,
                    record_id: *record_id,
                    choose_app: *choose_app,
                }),
                &filter_from(envelope, Some(*login_id)),
            );
        }
        ClusterEvent::FilesCopied {
            login_id,
            attribute_id,
            file_ids,
            record_id,
        } => {
            state.hub.publish(
                &UnsolicitedMessage::FilesCopied(FilesCopied {
                    attribute_id: *attribute_id,
                    file_ids: file_ids.clone(),
                    record_id: *record_id,
                }),
                &filter_from(envelope, Some(*login_id)),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_parts_round_trip() {
        let event = ClusterEvent::SchemaChanged {
            module_ids: vec![Uuid::new_v4()],
        };
        let (content, payload) = wire_parts(&event).unwrap();
        assert_eq!(content, "schemaChanged");
        let back = parse_event(&content, &payload).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unit_events_have_empty_payload() {
        let (content, payload) = wire_parts(&ClusterEvent::LoginReauthorizedAll).unwrap();
        assert_eq!(content, "loginReauthorizedAll");
        assert!(payload.is_empty());
        let back = parse_event(&content, &payload).unwrap();
        assert_eq!(back, ClusterEvent::LoginReauthorizedAll);
    }

    #[test]
    fn parse_event_matches_sql_produced_payloads() {
        // instance_cluster.run_task builds this payload in SQL.
        let payload = r#"{"taskName":"mailSend","pgFunctionId":null,"pgFunctionScheduleId":null}"#;
        let event = parse_event("taskTriggered", payload).unwrap();
        assert_eq!(
            event,
            ClusterEvent::TaskTriggered {
                task_name: "mailSend".into(),
                pg_function_id: None,
                pg_function_schedule_id: None,
            }
        );

        // instance.update_collection builds this one.
        let id = Uuid::new_v4();
        let payload = format!(r#"{{"collectionId":"{id}","loginIds":[1,2]}}"#);
        let event = parse_event("collectionUpdated", &payload).unwrap();
        let ClusterEvent::CollectionUpdated(changed) = event else {
            panic!("wrong event kind");
        };
        assert_eq!(changed.collection_id, id);
        assert_eq!(changed.login_ids, vec![1, 2]);

        // instance_cluster.master_role_request builds this one.
        let event = parse_event("masterAssigned", r#"{"state":true}"#).unwrap();
        assert_eq!(event, ClusterEvent::MasterAssigned { state: true });
    }

    #[test]
    fn unknown_events_fail_parse() {
        assert!(parse_event("futureEventKind", "").is_err());
    }

    #[test]
    fn device_parsing() {
        assert_eq!(parse_device("browser"), Some(DeviceKind::Browser));
        assert_eq!(parse_device("fatClient"), Some(DeviceKind::FatClient));
        assert_eq!(parse_device("toaster"), None);
    }
}
