//! Bridge assembly.
//!
//! Wires the two links, the router, and the event bus together and exposes
//! the embedding API: inject writes, request refreshes, subscribe to
//! committed changes, and run everything until shutdown.

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{create_bus, BridgeEvent, SharedBus};
use crate::config::Config;
use crate::links::amp::AmpLink;
use crate::links::hub::{EntityMap, HubLink};
use crate::links::{new_link_state, RefreshRequest, SharedLinkState};
use crate::router::Router;
use crate::store::ZoneStore;
use crate::zone::{resolve_zone, AttrValue, SourceList, WriteCommand};

/// Depth of the per-link write queues. The router drops rather than
/// queues when a link falls behind, so this stays small.
const WRITE_QUEUE: usize = 32;
/// Depth of the shared observation queue into the router.
const OBSERVATION_QUEUE: usize = 128;
const REFRESH_QUEUE: usize = 8;

/// Cloneable control handle, usable while the bridge runs.
#[derive(Clone)]
pub struct BridgeHandle {
    zones: std::sync::Arc<Vec<String>>,
    sources: SourceList,
    amp_tx: mpsc::Sender<WriteCommand>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl BridgeHandle {
    /// Inject a write as if it came from the hub: the value goes to the
    /// amplifier and, once the amplifier reports it back, propagates
    /// everywhere else through the normal path.
    ///
    /// Fails without touching the transport when the zone is not configured
    /// or a source name is not in the configured list.
    pub async fn write(&self, command: WriteCommand) -> Result<()> {
        let Some(zone) = resolve_zone(self.zones.iter().map(String::as_str), &command.zone)
        else {
            anyhow::bail!("unknown zone: {}", command.zone);
        };
        if let AttrValue::Source(ref name) = command.value {
            if self.sources.index_of(name).is_none() {
                anyhow::bail!("source not in configured list: {name}");
            }
        }

        let command = WriteCommand {
            zone: zone.to_string(),
            value: command.value,
        };
        self.amp_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("bridge is shut down"))
    }

    /// Ask the amplifier link to re-query current values.
    ///
    /// A zone filter is canonicalized the same way `write` canonicalizes
    /// its target; an unknown zone fails instead of matching nothing.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<()> {
        let request = match request.zone {
            Some(raw) => {
                let Some(zone) = resolve_zone(self.zones.iter().map(String::as_str), &raw)
                else {
                    anyhow::bail!("unknown zone: {raw}");
                };
                RefreshRequest {
                    zone: Some(zone.to_string()),
                    attribute: request.attribute,
                }
            }
            None => request,
        };
        self.refresh_tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("bridge is shut down"))
    }

    /// Subscribe to committed value changes and link lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bus.subscribe()
    }

    /// Request an orderly stop of all bridge tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Bridge {
    amp: AmpLink,
    hub: HubLink,
    router: Router,
    handle: BridgeHandle,
    amp_state: SharedLinkState,
    hub_state: SharedLinkState,
    shutdown: CancellationToken,
}

impl Bridge {
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let bus = create_bus();
        let amp_state = new_link_state();
        let hub_state = new_link_state();

        let (obs_tx, obs_rx) = mpsc::channel(OBSERVATION_QUEUE);
        let (amp_tx, amp_rx) = mpsc::channel(WRITE_QUEUE);
        let (hub_tx, hub_rx) = mpsc::channel(WRITE_QUEUE);
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE);

        let zones = std::sync::Arc::new(config.zones.clone());
        let sources = SourceList::new(config.sources.clone());
        let entities = EntityMap::build(&config.zones);
        let store = ZoneStore::new(config.zones.iter().cloned());

        let amp = AmpLink::new(
            config.amp,
            config.zones.clone(),
            sources.clone(),
            amp_state.clone(),
            obs_tx.clone(),
            amp_rx,
            refresh_rx,
            bus.clone(),
            shutdown.clone(),
        );

        let hub = HubLink::new(
            config.hub,
            entities,
            hub_state.clone(),
            obs_tx,
            hub_rx,
            bus.clone(),
            shutdown.clone(),
        );

        let router = Router::new(
            store,
            obs_rx,
            amp_tx.clone(),
            amp_state.clone(),
            hub_tx,
            hub_state.clone(),
            bus.clone(),
            shutdown.clone(),
        );

        let handle = BridgeHandle {
            zones,
            sources,
            amp_tx,
            refresh_tx,
            bus,
            shutdown: shutdown.clone(),
        };

        Self {
            amp,
            hub,
            router,
            handle,
            amp_state,
            hub_state,
            shutdown,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Current lifecycle states, mostly for startup logging.
    pub fn link_states(&self) -> (SharedLinkState, SharedLinkState) {
        (self.amp_state.clone(), self.hub_state.clone())
    }

    /// Run all bridge tasks until shutdown is requested or a fatal link
    /// error occurs. A fatal error cancels the token so the other tasks
    /// wind down before this returns.
    pub async fn run(self) -> Result<()> {
        info!("bridge: starting");

        let router = tokio::spawn(self.router.run());
        let amp = tokio::spawn(self.amp.run());
        let hub = tokio::spawn(self.hub.run());

        let result = match hub.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shutdown.cancel();
                Err(e)
            }
            Err(e) => {
                self.shutdown.cancel();
                Err(anyhow::anyhow!("hub task panicked: {e}"))
            }
        };

        match amp.await {
            Ok(Ok(())) => info!("bridge: amplifier link stopped"),
            Ok(Err(e)) => warn!(error = %e, "bridge: amplifier link failed"),
            Err(e) => warn!(error = %e, "bridge: amplifier task join failed"),
        }
        if let Err(e) = router.await {
            warn!(error = %e, "bridge: router task join failed");
        }

        info!("bridge: stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AmpConfig, HubConfig};

    fn test_config() -> Config {
        Config {
            amp: AmpConfig {
                host: "127.0.0.1".to_string(),
                port: 10055,
                connect_timeout_ms: 100,
                activity_timeout_ms: 5000,
            },
            hub: HubConfig {
                host: "127.0.0.1".to_string(),
                port: 8123,
                access_token: "tok".to_string(),
                user_id: None,
                connect_timeout_ms: 100,
                min_volume: -60.0,
                max_volume: 12.0,
            },
            zones: vec!["Lounge".to_string()],
            sources: vec!["sonos".to_string()],
        }
    }

    #[tokio::test]
    async fn test_handle_outlives_setup_and_shutdown_stops_run() {
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(test_config(), shutdown.clone());
        let handle = bridge.handle();
        let mut events = handle.subscribe();

        let task = tokio::spawn(bridge.run());
        shutdown.cancel();
        task.await.unwrap().unwrap();

        // No link ever connected, so nothing was published.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_validation_rejects_without_sending() {
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(test_config(), shutdown.clone());
        let handle = bridge.handle();

        let unknown_source = WriteCommand {
            zone: "Lounge".to_string(),
            value: AttrValue::Source("vinyl".to_string()),
        };
        assert!(handle.write(unknown_source).await.is_err());

        let unknown_zone = WriteCommand {
            zone: "Garage".to_string(),
            value: AttrValue::Volume(0.0),
        };
        assert!(handle.write(unknown_zone).await.is_err());

        shutdown.cancel();
        bridge.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_zone_filter_canonicalized() {
        let (amp_tx, _amp_rx) = mpsc::channel(4);
        let (refresh_tx, mut refresh_rx) = mpsc::channel(4);
        let handle = BridgeHandle {
            zones: std::sync::Arc::new(vec!["Foyer".to_string()]),
            sources: SourceList::default(),
            amp_tx,
            refresh_tx,
            bus: create_bus(),
            shutdown: CancellationToken::new(),
        };

        // Lowercased spelling resolves to the configured name before the
        // filter reaches the amplifier link.
        handle
            .refresh(RefreshRequest {
                zone: Some("foyer".to_string()),
                attribute: None,
            })
            .await
            .unwrap();
        let sent = refresh_rx.recv().await.unwrap();
        assert_eq!(sent.zone.as_deref(), Some("Foyer"));

        // Unknown zones fail instead of matching nothing.
        let unknown = handle
            .refresh(RefreshRequest {
                zone: Some("Garage".to_string()),
                attribute: None,
            })
            .await;
        assert!(unknown.is_err());
        assert!(refresh_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(test_config(), shutdown.clone());
        let handle = bridge.handle();

        shutdown.cancel();
        bridge.run().await.unwrap();

        // The amplifier link dropped its receiver, so writes bounce.
        let cmd = WriteCommand {
            zone: "Lounge".to_string(),
            value: crate::zone::AttrValue::Volume(0.0),
        };
        assert!(handle.write(cmd).await.is_err());
    }
}
