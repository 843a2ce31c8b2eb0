//! Hub link: Home Assistant websocket API.
//!
//! Owns the persistent message channel and drives the connect / authenticate
//! / subscribe / ping-pong / reconnect cycle. Inbound `state_changed` events
//! are filtered through a precomputed entity allow-list and echo-suppressed
//! by the bridge's own user id; outbound writes become `call_service`
//! messages addressed to `<domain>.bose_<attribute>_<zone>` entities.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, Sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::bus::{BridgeEvent, SharedBus};
use crate::config::HubConfig;
use crate::links::{LinkError, LinkState, SharedLinkState};
use crate::zone::{Attribute, AttrValue, Observation, Origin, Switch, WriteCommand};

/// Handshake cadence expected by the remote: auth immediately on open, then
/// the subscription request, then the first liveness ping.
const SUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const FIRST_PING_DELAY: Duration = Duration::from_millis(1500);
/// Next ping is scheduled this long after each pong.
const PING_INTERVAL: Duration = Duration::from_secs(4);
/// A ping without a pong within this window kills the link.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Background re-ping check: fires a fresh ping when no pong has been seen
/// for over a window, guarding against a hub that stops responding without
/// closing the socket.
const PONG_STALE_CHECK: Duration = Duration::from_secs(10);

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

/// Normalize a zone display name into its entity-id fragment: lowercased,
/// whitespace stripped.
pub fn normalize_zone(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Synthesize the entity id for one zone attribute.
pub fn entity_id(attribute: Attribute, zone: &str) -> String {
    let clean = normalize_zone(zone);
    match attribute {
        Attribute::Volume => format!("input_number.bose_volume_{clean}"),
        Attribute::Mute => format!("input_boolean.bose_mute_{clean}"),
        Attribute::Source => format!("input_select.bose_source_{clean}"),
    }
}

/// Precomputed allow-list: entity id to (canonical zone, attribute).
///
/// Only events for these entities are considered; the lookup also
/// classifies the attribute and recovers the configured zone name, so no
/// string parsing happens on the hot path.
#[derive(Debug, Clone)]
pub struct EntityMap {
    entries: HashMap<String, (String, Attribute)>,
}

impl EntityMap {
    pub fn build(zones: &[String]) -> Self {
        let mut entries = HashMap::new();
        for zone in zones {
            for attribute in [Attribute::Volume, Attribute::Mute, Attribute::Source] {
                entries.insert(entity_id(attribute, zone), (zone.clone(), attribute));
            }
        }
        Self { entries }
    }

    pub fn get(&self, entity: &str) -> Option<&(String, Attribute)> {
        self.entries.get(entity)
    }
}

/// Inbound websocket message envelope.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    event: Option<StateEvent>,
}

#[derive(Debug, Deserialize)]
pub struct StateEvent {
    pub event_type: String,
    pub data: EventData,
    #[serde(default)]
    pub context: EventContext,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub entity_id: String,
    #[serde(default)]
    pub new_state: Option<NewState>,
}

#[derive(Debug, Deserialize)]
pub struct NewState {
    pub state: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Decode one `state_changed` event into a zone observation.
///
/// Drops: events from the bridge's own user id (echo suppression), entities
/// outside the allow-list, missing `new_state`, unparsable or out-of-range
/// volumes.
pub fn decode_state_event(
    event: &StateEvent,
    entities: &EntityMap,
    own_user_id: Option<&str>,
    volume_range: (f64, f64),
) -> Option<(String, AttrValue)> {
    if event.event_type != "state_changed" {
        return None;
    }

    // A state change caused by our own service call comes back tagged with
    // our user id; re-forwarding it would bounce values between the sides.
    if own_user_id.is_some() && event.context.user_id.as_deref() == own_user_id {
        debug!(entity = %event.data.entity_id, "hub: ignoring our own write echo");
        return None;
    }

    let (zone, attribute) = entities.get(&event.data.entity_id)?;
    let state = state_text(&event.data.new_state.as_ref()?.state)?;

    let value = match attribute {
        Attribute::Volume => {
            let volume: f64 = match state.parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(entity = %event.data.entity_id, state = %state, "hub: unparsable volume");
                    return None;
                }
            };
            let (min, max) = volume_range;
            // NaN slips past a plain range comparison and never compares
            // equal to itself in the store, defeating deduplication.
            if !volume.is_finite() || volume < min || volume > max {
                warn!(
                    entity = %event.data.entity_id,
                    volume,
                    "hub: volume out of range, rejecting"
                );
                return None;
            }
            AttrValue::Volume(volume)
        }
        Attribute::Mute => AttrValue::Mute(Switch::from(state.as_str())),
        Attribute::Source => AttrValue::Source(state.clone()),
    };

    Some((zone.clone(), value))
}

fn state_text(state: &serde_json::Value) -> Option<String> {
    match state {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Render a `call_service` message for one zone attribute write.
pub fn encode_call_service(id: u64, zone: &str, value: &AttrValue) -> serde_json::Value {
    match value {
        AttrValue::Volume(v) => json!({
            "id": id,
            "type": "call_service",
            "domain": "input_number",
            "service": "set_value",
            "service_data": {
                "entity_id": entity_id(Attribute::Volume, zone),
                "value": volume_json(*v),
            },
        }),
        AttrValue::Mute(m) => json!({
            "id": id,
            "type": "call_service",
            "domain": "input_boolean",
            // Service follows the command's own value, not remembered state.
            "service": match m {
                Switch::On => "turn_on",
                Switch::Off => "turn_off",
            },
            "service_data": {
                "entity_id": entity_id(Attribute::Mute, zone),
            },
        }),
        AttrValue::Source(name) => json!({
            "id": id,
            "type": "call_service",
            "domain": "input_select",
            "service": "select_option",
            "service_data": {
                "entity_id": entity_id(Attribute::Source, zone),
                "option": name,
            },
        }),
    }
}

fn volume_json(v: f64) -> serde_json::Value {
    if v.fract() == 0.0 {
        json!(v as i64)
    } else {
        json!(v)
    }
}

/// Hub-side link task.
pub struct HubLink {
    config: HubConfig,
    entities: EntityMap,
    state: SharedLinkState,
    obs_tx: mpsc::Sender<Observation>,
    cmd_rx: mpsc::Receiver<WriteCommand>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl HubLink {
    pub fn new(
        config: HubConfig,
        entities: EntityMap,
        state: SharedLinkState,
        obs_tx: mpsc::Sender<Observation>,
        cmd_rx: mpsc::Receiver<WriteCommand>,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            entities,
            state,
            obs_tx,
            cmd_rx,
            bus,
            shutdown,
        }
    }

    /// Supervisor loop. Transient failures reconnect with backoff; an
    /// `auth_invalid` reply is fatal and propagates out.
    pub async fn run(mut self) -> Result<()> {
        let mut policy = ReconnectPolicy::new();
        let url = format!(
            "ws://{}:{}/api/websocket",
            self.config.host, self.config.port
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            *self.state.write().await = LinkState::Connecting;
            info!(url = %url, "hub: connecting");

            match timeout(self.config.connect_timeout(), connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => {
                    policy.reset();
                    *self.state.write().await = LinkState::AwaitingHandshake;
                    info!("hub: socket open, authenticating");

                    let result = self.serve(ws).await;

                    let was_ready = *self.state.read().await == LinkState::Ready;
                    *self.state.write().await = LinkState::Disconnected;

                    match result {
                        Ok(()) => {}
                        Err(LinkError::Transient(reason)) => {
                            warn!(reason = %reason, "hub: link down");
                            if was_ready {
                                self.bus.publish(BridgeEvent::LinkDisconnected {
                                    link: Origin::Hub,
                                    reason,
                                });
                            }
                        }
                        Err(e @ LinkError::AuthRejected(_)) => {
                            error!(error = %e, "hub: fatal, shutting bridge down");
                            return Err(e.into());
                        }
                    }
                }
                Ok(Err(e)) => {
                    *self.state.write().await = LinkState::Disconnected;
                    warn!(error = %e, "hub: connect failed");
                }
                Err(_) => {
                    *self.state.write().await = LinkState::Disconnected;
                    warn!(
                        timeout_ms = self.config.connect_timeout().as_millis() as u64,
                        "hub: connect timed out"
                    );
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = policy.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = policy.attempts(),
                "hub: reconnect scheduled"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.state.write().await = LinkState::Closing;
        info!("hub: link task stopped");
        Ok(())
    }

    /// One connection's worth of protocol handling.
    ///
    /// `Ok(())` is an orderly shutdown; anything else is a `LinkError` the
    /// supervisor sorts into reconnect-vs-fatal.
    async fn serve(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> std::result::Result<(), LinkError> {
        let (mut writer, mut reader) = ws.split();

        let mut authorized = false;
        let mut next_id: u64 = 1;
        let mut last_pong = Instant::now();

        if let Err(e) = self.send_auth(&mut writer).await {
            return Err(LinkError::Transient(format!("auth send failed: {e}")));
        }

        // Fixed handshake cadence; both timers restart if the server asks
        // for auth again.
        let mut subscribe_timer: Pin<Box<Sleep>> = Box::pin(sleep(SUBSCRIBE_DELAY));
        let mut subscribe_pending = true;
        let mut ping_timer: Pin<Box<Sleep>> = Box::pin(sleep(FIRST_PING_DELAY));
        let mut ping_pending = true;
        let mut pong_deadline: Pin<Box<Sleep>> = Box::pin(sleep(PONG_TIMEOUT));
        let mut pong_armed = false;
        let mut stale_check = interval_at(
            Instant::now() + PONG_STALE_CHECK,
            PONG_STALE_CHECK,
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),

                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ServerMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                debug!(error = %e, "hub: unparsable message, skipping");
                                continue;
                            }
                        };

                        match parsed.kind.as_str() {
                            "auth_required" => {
                                if let Err(e) = self.send_auth(&mut writer).await {
                                    return Err(LinkError::Transient(format!("auth send failed: {e}")));
                                }
                                subscribe_timer.as_mut().reset(Instant::now() + SUBSCRIBE_DELAY);
                                subscribe_pending = true;
                                ping_timer.as_mut().reset(Instant::now() + FIRST_PING_DELAY);
                                ping_pending = true;
                            }
                            "auth_ok" => {
                                info!("hub: authenticated");
                                authorized = true;
                                *self.state.write().await = LinkState::Ready;
                                self.bus.publish(BridgeEvent::LinkConnected {
                                    link: Origin::Hub,
                                });
                            }
                            "auth_invalid" => {
                                let reason = parsed
                                    .message
                                    .unwrap_or_else(|| "invalid access token".to_string());
                                return Err(LinkError::AuthRejected(reason));
                            }
                            "pong" | "ping" => {
                                last_pong = Instant::now();
                                pong_armed = false;
                                ping_timer.as_mut().reset(Instant::now() + PING_INTERVAL);
                                ping_pending = true;
                            }
                            "event" => {
                                if let Some(ref event) = parsed.event {
                                    if let Some((zone, value)) = decode_state_event(
                                        event,
                                        &self.entities,
                                        self.config.user_id.as_deref(),
                                        (self.config.min_volume, self.config.max_volume),
                                    ) {
                                        debug!(zone = %zone, ?value, "hub: decoded update");
                                        let observation = Observation {
                                            zone,
                                            value,
                                            origin: Origin::Hub,
                                        };
                                        if self.obs_tx.send(observation).await.is_err() {
                                            return Err(LinkError::Transient("router gone".to_string()));
                                        }
                                    }
                                }
                            }
                            // Service-call and subscription acks.
                            "result" => {}
                            other => debug!(kind = %other, "hub: unhandled message type"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = writer.send(Message::Pong(data)).await {
                            return Err(LinkError::Transient(format!("pong send failed: {e}")));
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(LinkError::Transient("server closed".to_string()))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(LinkError::Transient(format!("read error: {e}"))),
                    None => return Err(LinkError::Transient("stream ended".to_string())),
                },

                Some(cmd) = self.cmd_rx.recv() => {
                    if !authorized {
                        warn!(zone = %cmd.zone, "hub: dropping write, not authenticated");
                        continue;
                    }
                    let payload = encode_call_service(next_id, &cmd.zone, &cmd.value);
                    next_id += 1;
                    debug!(zone = %cmd.zone, %payload, "hub: call_service");
                    if let Err(e) = send_json(&mut writer, &payload).await {
                        return Err(LinkError::Transient(format!("write error: {e}")));
                    }
                }

                _ = subscribe_timer.as_mut(), if subscribe_pending => {
                    subscribe_pending = false;
                    let payload = json!({
                        "id": next_id,
                        "type": "subscribe_events",
                        "event_type": "state_changed",
                    });
                    next_id += 1;
                    if let Err(e) = send_json(&mut writer, &payload).await {
                        return Err(LinkError::Transient(format!("subscribe send failed: {e}")));
                    }
                }

                _ = ping_timer.as_mut(), if ping_pending => {
                    ping_pending = false;
                    let payload = json!({ "id": next_id, "type": "ping" });
                    next_id += 1;
                    if let Err(e) = send_json(&mut writer, &payload).await {
                        return Err(LinkError::Transient(format!("ping send failed: {e}")));
                    }
                    pong_deadline.as_mut().reset(Instant::now() + PONG_TIMEOUT);
                    pong_armed = true;
                }

                _ = pong_deadline.as_mut(), if pong_armed => {
                    return Err(LinkError::Transient("no pong within deadline".to_string()));
                }

                _ = stale_check.tick() => {
                    if last_pong.elapsed() > PONG_STALE_CHECK && !pong_armed {
                        let payload = json!({ "id": next_id, "type": "ping" });
                        next_id += 1;
                        if let Err(e) = send_json(&mut writer, &payload).await {
                            return Err(LinkError::Transient(format!("ping send failed: {e}")));
                        }
                        pong_deadline.as_mut().reset(Instant::now() + PONG_TIMEOUT);
                        pong_armed = true;
                    }
                }
            }
        }
    }

    async fn send_auth(&self, writer: &mut WsSink) -> Result<()> {
        let payload = json!({
            "type": "auth",
            "access_token": self.config.access_token,
        });
        send_json(writer, &payload).await
    }
}

async fn send_json(writer: &mut WsSink, payload: &serde_json::Value) -> Result<()> {
    writer
        .send(Message::Text(payload.to_string()))
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOLUME_RANGE: (f64, f64) = (-60.0, 12.0);

    fn entities() -> EntityMap {
        EntityMap::build(&[
            "DiningRoom".to_string(),
            "Foyer".to_string(),
            "Lounge".to_string(),
        ])
    }

    fn event(entity_id: &str, state: serde_json::Value, user_id: Option<&str>) -> StateEvent {
        serde_json::from_value(json!({
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "new_state": { "state": state },
            },
            "context": { "user_id": user_id },
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_zone() {
        assert_eq!(normalize_zone("Dining Room"), "diningroom");
        assert_eq!(normalize_zone("Foyer"), "foyer");
    }

    #[test]
    fn test_entity_id_synthesis() {
        assert_eq!(
            entity_id(Attribute::Volume, "Lounge"),
            "input_number.bose_volume_lounge"
        );
        assert_eq!(
            entity_id(Attribute::Mute, "Foyer"),
            "input_boolean.bose_mute_foyer"
        );
        assert_eq!(
            entity_id(Attribute::Source, "Dining Room"),
            "input_select.bose_source_diningroom"
        );
    }

    #[test]
    fn test_entity_map_classifies_and_canonicalizes() {
        let map = entities();
        assert_eq!(
            map.get("input_boolean.bose_mute_foyer"),
            Some(&("Foyer".to_string(), Attribute::Mute))
        );
        assert_eq!(map.get("input_number.bose_volume_garage"), None);
        assert_eq!(map.get("light.kitchen"), None);
    }

    #[test]
    fn test_decode_volume_event() {
        let ev = event("input_number.bose_volume_lounge", json!("5"), Some("alice"));
        let decoded = decode_state_event(&ev, &entities(), Some("bridge-user"), VOLUME_RANGE);
        assert_eq!(decoded, Some(("Lounge".to_string(), AttrValue::Volume(5.0))));
    }

    #[test]
    fn test_decode_mute_event() {
        let ev = event("input_boolean.bose_mute_foyer", json!("on"), None);
        let decoded = decode_state_event(&ev, &entities(), Some("bridge-user"), VOLUME_RANGE);
        assert_eq!(
            decoded,
            Some(("Foyer".to_string(), AttrValue::Mute(Switch::On)))
        );
    }

    #[test]
    fn test_decode_source_event() {
        let ev = event("input_select.bose_source_diningroom", json!("sonos"), None);
        let decoded = decode_state_event(&ev, &entities(), None, VOLUME_RANGE);
        assert_eq!(
            decoded,
            Some((
                "DiningRoom".to_string(),
                AttrValue::Source("sonos".to_string())
            ))
        );
    }

    #[test]
    fn test_echo_suppression_by_user_id() {
        let ev = event(
            "input_number.bose_volume_lounge",
            json!("5"),
            Some("bridge-user"),
        );
        let decoded = decode_state_event(&ev, &entities(), Some("bridge-user"), VOLUME_RANGE);
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_volume_out_of_range_rejected() {
        let ev = event("input_number.bose_volume_lounge", json!("20"), None);
        assert_eq!(
            decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
            None
        );
        let ev = event("input_number.bose_volume_lounge", json!("-61"), None);
        assert_eq!(
            decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
            None
        );
    }

    #[test]
    fn test_non_finite_volume_rejected() {
        for state in ["NaN", "inf", "-inf", "infinity"] {
            let ev = event("input_number.bose_volume_lounge", json!(state), None);
            assert_eq!(
                decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
                None,
                "state {state:?} must not decode"
            );
        }
    }

    #[test]
    fn test_entity_outside_allow_list_ignored() {
        let ev = event("input_number.pool_temperature", json!("5"), None);
        assert_eq!(
            decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
            None
        );
    }

    #[test]
    fn test_missing_new_state_ignored() {
        let ev: StateEvent = serde_json::from_value(json!({
            "event_type": "state_changed",
            "data": { "entity_id": "input_number.bose_volume_lounge" },
            "context": {},
        }))
        .unwrap();
        assert_eq!(
            decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
            None
        );
    }

    #[test]
    fn test_non_state_changed_event_ignored() {
        let ev: StateEvent = serde_json::from_value(json!({
            "event_type": "call_service",
            "data": { "entity_id": "input_number.bose_volume_lounge" },
            "context": {},
        }))
        .unwrap();
        assert_eq!(
            decode_state_event(&ev, &entities(), None, VOLUME_RANGE),
            None
        );
    }

    #[test]
    fn test_encode_volume_call() {
        let payload = encode_call_service(7, "Lounge", &AttrValue::Volume(5.0));
        assert_eq!(
            payload,
            json!({
                "id": 7,
                "type": "call_service",
                "domain": "input_number",
                "service": "set_value",
                "service_data": {
                    "entity_id": "input_number.bose_volume_lounge",
                    "value": 5,
                },
            })
        );
    }

    #[test]
    fn test_encode_mute_call_follows_command_value() {
        let on = encode_call_service(1, "Foyer", &AttrValue::Mute(Switch::On));
        assert_eq!(on["service"], "turn_on");
        assert_eq!(
            on["service_data"]["entity_id"],
            "input_boolean.bose_mute_foyer"
        );

        let off = encode_call_service(2, "Foyer", &AttrValue::Mute(Switch::Off));
        assert_eq!(off["service"], "turn_off");
    }

    #[test]
    fn test_encode_source_call() {
        let payload = encode_call_service(3, "DiningRoom", &AttrValue::Source("mix".to_string()));
        assert_eq!(payload["domain"], "input_select");
        assert_eq!(payload["service"], "select_option");
        assert_eq!(
            payload["service_data"]["entity_id"],
            "input_select.bose_source_diningroom"
        );
        assert_eq!(payload["service_data"]["option"], "mix");
    }
}
