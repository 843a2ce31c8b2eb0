//! Observation router.
//!
//! Single consumer of observations from both links. Every observation is
//! compared against the canonical store; only genuine changes are committed,
//! forwarded to the opposite link, and announced on the bus. Duplicate
//! values die here, which is what keeps the two sides from ping-ponging
//! updates at each other.

use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BridgeEvent, SharedBus};
use crate::links::{is_ready, SharedLinkState};
use crate::store::{Applied, ZoneRecord, ZoneStore};
use crate::zone::{resolve_zone, Observation, Origin, WriteCommand};

/// Cadence of the periodic full push of the store to the hub. Recovers
/// from change notifications the hub missed while degraded.
const DUMP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Router {
    store: ZoneStore,
    obs_rx: mpsc::Receiver<Observation>,
    amp_tx: mpsc::Sender<WriteCommand>,
    amp_state: SharedLinkState,
    hub_tx: mpsc::Sender<WriteCommand>,
    hub_state: SharedLinkState,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ZoneStore,
        obs_rx: mpsc::Receiver<Observation>,
        amp_tx: mpsc::Sender<WriteCommand>,
        amp_state: SharedLinkState,
        hub_tx: mpsc::Sender<WriteCommand>,
        hub_state: SharedLinkState,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            obs_rx,
            amp_tx,
            amp_state,
            hub_tx,
            hub_state,
            bus,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut dump = interval_at(Instant::now() + DUMP_INTERVAL, DUMP_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                observation = self.obs_rx.recv() => match observation {
                    Some(obs) => self.handle(obs).await,
                    None => {
                        warn!("router: all observation senders gone, stopping");
                        break;
                    }
                },

                _ = dump.tick() => self.push_full_state().await,
            }
        }

        info!("router: stopped");
    }

    /// Reconcile one observation against the store and, when it is a
    /// genuine change, mirror it to the side that did not report it.
    async fn handle(&mut self, obs: Observation) {
        // Wire zone names may differ in case or carry a foreign prefix;
        // everything downstream uses the configured spelling.
        let zone = if self.store.get(&obs.zone).is_some() {
            obs.zone.clone()
        } else {
            match resolve_zone(self.store.zone_names(), &obs.zone) {
                Some(canonical) => canonical.to_string(),
                None => {
                    warn!(zone = %obs.zone, "router: observation for unconfigured zone");
                    return;
                }
            }
        };

        match self.store.apply(&zone, &obs.value) {
            Applied::UnknownZone => {
                warn!(zone = %zone, "router: observation for unconfigured zone");
            }
            Applied::Unchanged => {
                debug!(zone = %zone, value = ?obs.value, origin = %obs.origin,
                    "router: duplicate value, not forwarding");
            }
            Applied::Changed => {
                info!(zone = %zone, value = ?obs.value, origin = %obs.origin,
                    "router: committed change");

                self.bus.publish(BridgeEvent::ValueChanged {
                    zone: zone.clone(),
                    value: obs.value.clone(),
                    origin: obs.origin,
                });

                let target = obs.origin.opposite();
                let command = WriteCommand {
                    zone,
                    value: obs.value,
                };
                self.forward(target, command).await;
            }
        }
    }

    /// Hand a write to the target link, dropping it when the link is not
    /// ready or its queue is full. Links resynchronize on reconnect, so a
    /// dropped write is recovered by the next poll cycle.
    async fn forward(&self, target: Origin, command: WriteCommand) {
        let (tx, state) = match target {
            Origin::Amplifier => (&self.amp_tx, &self.amp_state),
            Origin::Hub => (&self.hub_tx, &self.hub_state),
        };

        if !is_ready(state).await {
            debug!(zone = %command.zone, link = %target, "router: link not ready, dropping write");
            return;
        }

        if let Err(e) = tx.try_send(command) {
            warn!(link = %target, error = %e, "router: write dropped");
        }
    }

    /// Send every known value to the hub, changed or not.
    async fn push_full_state(&self) {
        if !is_ready(&self.hub_state).await {
            debug!("router: hub not ready, skipping full push");
            return;
        }

        for (zone, record) in self.store.iter() {
            debug!(zone = %zone, state = %format_record(record), "router: zone state");
            for value in record.known_values() {
                let command = WriteCommand {
                    zone: zone.to_string(),
                    value,
                };
                if let Err(e) = self.hub_tx.try_send(command) {
                    warn!(zone = %zone, error = %e, "router: full push write dropped");
                }
            }
        }
    }
}

fn format_record(record: &ZoneRecord) -> String {
    let volume = record
        .volume
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mute = record
        .mute
        .map(|m| m.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let source = record.source.as_deref().unwrap_or("unknown");
    format!("volume={volume} mute={mute} source={source}")
}
