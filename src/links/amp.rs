//! Amplifier link: Bose ControlSpace serial-over-TCP protocol.
//!
//! Owns the raw socket and drives the connect / settle / poll / reconnect
//! cycle. The device speaks a line protocol: `GA "<Zone> <Attr>">idx \r`
//! queries are answered with `GA "<Zone> <Attr>">idx =value` records, and
//! `SA ...` writes set values. There is no protocol-level ping; liveness is
//! inferred from receive activity, which the 1s volume poll keeps flowing.

use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::bus::{BridgeEvent, SharedBus};
use crate::config::AmpConfig;
use crate::framing::RecordExtractor;
use crate::links::{LinkState, RefreshRequest, SharedLinkState};
use crate::zone::{Attribute, AttrValue, Observation, Origin, SourceList, Switch, WriteCommand};

/// Delay between transport connect and the first full-state pull, giving the
/// device time to settle.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Volume is polled fast; it doubles as the keepalive traffic source.
const VOLUME_POLL: Duration = Duration::from_secs(1);
/// Mute and source change rarely; polled on a slow cycle.
const META_POLL: Duration = Duration::from_secs(15);
/// How often receive activity is checked against the activity timeout.
const ACTIVITY_CHECK: Duration = Duration::from_secs(5);

/// Decode one amplifier record into a zone observation.
///
/// Records without the `GA` marker are not data updates (command echoes,
/// prompts) and yield `None` silently. Malformed values inside a `GA` record
/// also yield `None`; the caller has nothing useful to do with them.
pub fn decode_record(record: &str, sources: &SourceList) -> Option<(String, AttrValue)> {
    if !record.contains("GA") {
        return None;
    }

    let zone = extract_zone_name(record)?;

    if record.contains("Gain") {
        if let Some(rest) = record.split(">1 =").nth(1) {
            let volume: f64 = rest.trim().parse().ok().filter(|v: &f64| v.is_finite())?;
            Some((zone, AttrValue::Volume(volume)))
        } else if let Some(rest) = record.split(">2 =").nth(1) {
            let mute = if rest.trim() == "O" {
                Switch::On
            } else {
                Switch::Off
            };
            Some((zone, AttrValue::Mute(mute)))
        } else {
            None
        }
    } else if record.contains("Selector") {
        let index: usize = record.split(">1 =").nth(1)?.trim().parse().ok()?;
        let name = sources.name_for_index(index)?;
        Some((zone, AttrValue::Source(name.to_string())))
    } else {
        None
    }
}

/// Pull the zone name out of `GA "<Zone> <Attr>">...`.
fn extract_zone_name(record: &str) -> Option<String> {
    let marker = if record.contains("Gain") {
        " Gain"
    } else {
        " Selector"
    };
    let before_attr = record.split(marker).next()?;
    let zone = before_attr.split("GA \"").nth(1)?;
    if zone.is_empty() {
        None
    } else {
        Some(zone.to_string())
    }
}

/// Render an `SA` set record for one zone attribute.
///
/// Returns `None` when a source name is not in the configured list; the
/// write is dropped, never sent with a guessed index.
pub fn encode_set(zone: &str, value: &AttrValue, sources: &SourceList) -> Option<String> {
    match value {
        AttrValue::Volume(v) => Some(format!("SA \"{zone} Gain\">1={} \r", format_volume(*v))),
        AttrValue::Mute(m) => Some(format!("SA \"{zone} Gain\">2={} \r", m.amp_code())),
        AttrValue::Source(name) => {
            let index = sources.index_of(name)?;
            Some(format!("SA \"{zone} Selector\">1={index} \r"))
        }
    }
}

/// Render a `GA` query record for one zone attribute.
pub fn encode_query(zone: &str, attribute: Attribute) -> String {
    match attribute {
        Attribute::Volume => format!("GA \"{zone} Gain\">1 \r"),
        Attribute::Mute => format!("GA \"{zone} Gain\">2 \r"),
        Attribute::Source => format!("GA \"{zone} Selector\">1 \r"),
    }
}

/// Integral volumes print without a trailing `.0`; the device echoes what
/// it was sent.
fn format_volume(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Amplifier-side link task.
pub struct AmpLink {
    config: AmpConfig,
    zones: Vec<String>,
    sources: SourceList,
    state: SharedLinkState,
    obs_tx: mpsc::Sender<Observation>,
    cmd_rx: mpsc::Receiver<WriteCommand>,
    refresh_rx: mpsc::Receiver<RefreshRequest>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl AmpLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AmpConfig,
        zones: Vec<String>,
        sources: SourceList,
        state: SharedLinkState,
        obs_tx: mpsc::Sender<Observation>,
        cmd_rx: mpsc::Receiver<WriteCommand>,
        refresh_rx: mpsc::Receiver<RefreshRequest>,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            zones,
            sources,
            state,
            obs_tx,
            cmd_rx,
            refresh_rx,
            bus,
            shutdown,
        }
    }

    /// Supervisor loop: connect, serve until the link dies, back off, retry.
    pub async fn run(mut self) -> Result<()> {
        let mut policy = ReconnectPolicy::new();
        let addr = format!("{}:{}", self.config.host, self.config.port);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            *self.state.write().await = LinkState::Connecting;
            info!(addr = %addr, "amplifier: connecting");

            match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    policy.reset();
                    *self.state.write().await = LinkState::Ready;
                    info!(addr = %addr, "amplifier: connected");
                    self.bus.publish(BridgeEvent::LinkConnected {
                        link: Origin::Amplifier,
                    });

                    let reason = self.serve(stream).await;

                    *self.state.write().await = LinkState::Disconnected;
                    warn!(reason = %reason, "amplifier: link down");
                    self.bus.publish(BridgeEvent::LinkDisconnected {
                        link: Origin::Amplifier,
                        reason: reason.clone(),
                    });
                }
                Ok(Err(e)) => {
                    *self.state.write().await = LinkState::Disconnected;
                    warn!(error = %e, "amplifier: connect failed");
                }
                Err(_) => {
                    *self.state.write().await = LinkState::Disconnected;
                    warn!(
                        timeout_ms = self.config.connect_timeout().as_millis() as u64,
                        "amplifier: connect timed out"
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
                "amplifier: reconnect scheduled"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.state.write().await = LinkState::Closing;
        info!("amplifier: link task stopped");
        Ok(())
    }

    /// One connection's worth of protocol handling. Returns the teardown
    /// reason; the supervisor decides what happens next.
    async fn serve(&mut self, stream: TcpStream) -> String {
        let (mut reader, mut writer) = stream.into_split();
        let mut extractor = RecordExtractor::new(b'\r');
        let mut buf = vec![0u8; 4096];
        let mut last_activity = Instant::now();

        // Independent poll timers; first ticks land after the settle delay,
        // which makes the first volume+mute+source round the initial full
        // pull. They may overlap, matching the device's tolerance.
        let settle = Instant::now() + SETTLE_DELAY;
        let mut volume_poll = interval_at(settle, VOLUME_POLL);
        let mut meta_poll = interval_at(settle, META_POLL);
        let mut activity_check = interval_at(Instant::now() + ACTIVITY_CHECK, ACTIVITY_CHECK);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return "shutdown".to_string(),

                result = reader.read(&mut buf) => match result {
                    Ok(0) => return "peer closed connection".to_string(),
                    Ok(n) => {
                        last_activity = Instant::now();
                        extractor.push(&buf[..n]);
                        while let Some(record) = extractor.next_record() {
                            if let Some((zone, value)) = decode_record(&record, &self.sources) {
                                debug!(zone = %zone, ?value, "amplifier: decoded update");
                                let observation = Observation {
                                    zone,
                                    value,
                                    origin: Origin::Amplifier,
                                };
                                if self.obs_tx.send(observation).await.is_err() {
                                    return "router gone".to_string();
                                }
                            }
                        }
                    }
                    Err(e) => return format!("read error: {e}"),
                },

                Some(cmd) = self.cmd_rx.recv() => {
                    match encode_set(&cmd.zone, &cmd.value, &self.sources) {
                        Some(line) => {
                            debug!(zone = %cmd.zone, line = %line.trim_end(), "amplifier: write");
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                return format!("write error: {e}");
                            }
                        }
                        None => {
                            warn!(
                                zone = %cmd.zone,
                                value = ?cmd.value,
                                "amplifier: dropping write, source not in configured list"
                            );
                        }
                    }
                }

                Some(request) = self.refresh_rx.recv() => {
                    if let Err(e) = write_queries(&mut writer, &self.zones, &request).await {
                        return format!("write error: {e}");
                    }
                }

                _ = volume_poll.tick() => {
                    let request = RefreshRequest {
                        zone: None,
                        attribute: Some(Attribute::Volume),
                    };
                    if let Err(e) = write_queries(&mut writer, &self.zones, &request).await {
                        return format!("write error: {e}");
                    }
                }

                _ = meta_poll.tick() => {
                    for attribute in [Attribute::Mute, Attribute::Source] {
                        let request = RefreshRequest {
                            zone: None,
                            attribute: Some(attribute),
                        };
                        if let Err(e) = write_queries(&mut writer, &self.zones, &request).await {
                            return format!("write error: {e}");
                        }
                    }
                }

                _ = activity_check.tick() => {
                    if last_activity.elapsed() > self.config.activity_timeout() {
                        return "no receive activity".to_string();
                    }
                }
            }
        }
    }
}

/// Send `GA` queries for every zone/attribute matching the request filter.
async fn write_queries(
    writer: &mut OwnedWriteHalf,
    zones: &[String],
    request: &RefreshRequest,
) -> std::io::Result<()> {
    for zone in zones {
        if let Some(ref wanted) = request.zone {
            if wanted != zone {
                continue;
            }
        }
        for attribute in [Attribute::Volume, Attribute::Mute, Attribute::Source] {
            if let Some(wanted) = request.attribute {
                if wanted != attribute {
                    continue;
                }
            }
            writer
                .write_all(encode_query(zone, attribute).as_bytes())
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> SourceList {
        SourceList::new(vec![
            "wireless mic".to_string(),
            "sonos".to_string(),
            "aux cable".to_string(),
            "mix".to_string(),
        ])
    }

    #[test]
    fn test_decode_volume_record() {
        let decoded = decode_record("GA \"Lounge Gain\">1 =5", &sources());
        assert_eq!(decoded, Some(("Lounge".to_string(), AttrValue::Volume(5.0))));
    }

    #[test]
    fn test_decode_negative_volume() {
        let decoded = decode_record("GA \"DiningRoom Gain\">1 =-23.5", &sources());
        assert_eq!(
            decoded,
            Some(("DiningRoom".to_string(), AttrValue::Volume(-23.5)))
        );
    }

    #[test]
    fn test_decode_mute_record() {
        assert_eq!(
            decode_record("GA \"Foyer Gain\">2 =O", &sources()),
            Some(("Foyer".to_string(), AttrValue::Mute(Switch::On)))
        );
        assert_eq!(
            decode_record("GA \"Foyer Gain\">2 =F", &sources()),
            Some(("Foyer".to_string(), AttrValue::Mute(Switch::Off)))
        );
    }

    #[test]
    fn test_decode_source_record() {
        let decoded = decode_record("GA \"Lounge Selector\">1 =2", &sources());
        assert_eq!(
            decoded,
            Some(("Lounge".to_string(), AttrValue::Source("sonos".to_string())))
        );
    }

    #[test]
    fn test_decode_source_index_out_of_range_ignored() {
        assert_eq!(decode_record("GA \"Lounge Selector\">1 =0", &sources()), None);
        assert_eq!(decode_record("GA \"Lounge Selector\">1 =5", &sources()), None);
    }

    #[test]
    fn test_decode_record_without_marker_ignored() {
        assert_eq!(decode_record("SA \"Lounge Gain\">1=5", &sources()), None);
        assert_eq!(decode_record("", &sources()), None);
        assert_eq!(decode_record("ready>", &sources()), None);
    }

    #[test]
    fn test_decode_unparsable_volume_ignored() {
        assert_eq!(decode_record("GA \"Lounge Gain\">1 =zz", &sources()), None);
    }

    #[test]
    fn test_decode_non_finite_volume_ignored() {
        assert_eq!(decode_record("GA \"Lounge Gain\">1 =NaN", &sources()), None);
        assert_eq!(decode_record("GA \"Lounge Gain\">1 =inf", &sources()), None);
    }

    #[test]
    fn test_encode_volume_set() {
        let line = encode_set("Lounge", &AttrValue::Volume(5.0), &sources());
        assert_eq!(line.as_deref(), Some("SA \"Lounge Gain\">1=5 \r"));
    }

    #[test]
    fn test_encode_fractional_volume_set() {
        let line = encode_set("Lounge", &AttrValue::Volume(-7.5), &sources());
        assert_eq!(line.as_deref(), Some("SA \"Lounge Gain\">1=-7.5 \r"));
    }

    #[test]
    fn test_encode_mute_set() {
        let line = encode_set("Foyer", &AttrValue::Mute(Switch::On), &sources());
        assert_eq!(line.as_deref(), Some("SA \"Foyer Gain\">2=O \r"));
        let line = encode_set("Foyer", &AttrValue::Mute(Switch::Off), &sources());
        assert_eq!(line.as_deref(), Some("SA \"Foyer Gain\">2=F \r"));
    }

    #[test]
    fn test_encode_source_set_uses_one_based_index() {
        let line = encode_set(
            "Lounge",
            &AttrValue::Source("wireless mic".to_string()),
            &sources(),
        );
        assert_eq!(line.as_deref(), Some("SA \"Lounge Selector\">1=1 \r"));
    }

    #[test]
    fn test_encode_unknown_source_dropped() {
        let line = encode_set(
            "Lounge",
            &AttrValue::Source("vinyl".to_string()),
            &sources(),
        );
        assert_eq!(line, None);
    }

    #[test]
    fn test_encode_queries() {
        assert_eq!(encode_query("Lounge", Attribute::Volume), "GA \"Lounge Gain\">1 \r");
        assert_eq!(encode_query("Lounge", Attribute::Mute), "GA \"Lounge Gain\">2 \r");
        assert_eq!(
            encode_query("Lounge", Attribute::Source),
            "GA \"Lounge Selector\">1 \r"
        );
    }

    #[test]
    fn test_format_volume() {
        assert_eq!(format_volume(5.0), "5");
        assert_eq!(format_volume(-60.0), "-60");
        assert_eq!(format_volume(1.25), "1.25");
    }
}
