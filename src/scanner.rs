//! Scan ownership and restart policy.
//!
//! The engine runs one scan at a time: starting a discovery scan stops an
//! active autoconnect scan first, and vice versa. Each active scan is a
//! spawned pump task that forwards sightings, restarts the hardware scan
//! every three minutes to dodge stack-side throttling, and shuts the scan
//! down when told to. The manager consumes the engine's events and
//! applies policy (dedup, direct-connecting to autoconnect targets).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::models::{Advertisement, DeviceAddress, ScanFailure, ScanMode};
use crate::radio::{RadioStack, ScanConfig, ScanEvent};

/// Restart the hardware scan after this long to evade scan throttling.
const SCAN_RESTART_INTERVAL: Duration = Duration::from_secs(180);

/// Cooldown between stopping a scan and starting its replacement.
const SCAN_RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Events the engine reports to its owner.
#[derive(Debug, Clone)]
pub(crate) enum ScanEngineEvent {
    /// A discovery-scan sighting that passed the name filter.
    Discovered(Advertisement),
    /// An autoconnect target was sighted; the autoconnect scan has been
    /// stopped so the owner can direct-connect.
    AutoConnectSighting(DeviceAddress),
    /// The scan failed to start or died; its state has been cleared.
    ScanFailed(ScanFailure),
}

pub(crate) struct ScanEngine {
    radio: Arc<dyn RadioStack>,
    events: mpsc::UnboundedSender<ScanEngineEvent>,
    discovery: Option<oneshot::Sender<()>>,
    autoconnect: Option<oneshot::Sender<()>>,
}

impl ScanEngine {
    pub fn new(
        radio: Arc<dyn RadioStack>,
        events: mpsc::UnboundedSender<ScanEngineEvent>,
    ) -> Self {
        Self {
            radio,
            events,
            discovery: None,
            autoconnect: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.discovery.is_some()
    }

    /// Start a discovery scan. Any running scan of either kind is stopped
    /// first.
    pub fn start_discovery(&mut self, mut config: ScanConfig, mode: ScanMode) {
        self.stop_all();
        config.mode = Some(mode);
        info!(?config, "starting discovery scan");
        self.discovery = Some(self.spawn_pump(config, None));
    }

    pub fn stop_discovery(&mut self) {
        if let Some(stop) = self.discovery.take() {
            debug!("stopping discovery scan");
            // The pump stops the hardware scan on its way out; never
            // abort the task or the radio scan leaks.
            let _ = stop.send(());
        }
    }

    /// Start a low-power background scan for the given addresses. Any
    /// running scan of either kind is stopped first.
    pub fn start_autoconnect(&mut self, addresses: Vec<DeviceAddress>) {
        self.stop_autoconnect();
        if addresses.is_empty() {
            return;
        }
        self.stop_discovery();
        info!(count = addresses.len(), "starting autoconnect scan");
        let config = ScanConfig {
            filters: addresses
                .iter()
                .cloned()
                .map(crate::radio::ScanFilter::Address)
                .collect(),
            name_substrings: Vec::new(),
            mode: Some(ScanMode::LowPower),
        };
        let targets: HashSet<DeviceAddress> = addresses.into_iter().collect();
        self.autoconnect = Some(self.spawn_pump(config, Some(targets)));
    }

    pub fn stop_autoconnect(&mut self) {
        if let Some(stop) = self.autoconnect.take() {
            debug!("stopping autoconnect scan");
            let _ = stop.send(());
        }
    }

    pub fn stop_all(&mut self) {
        self.stop_discovery();
        self.stop_autoconnect();
    }

    /// Spawn the pump that owns one hardware scan and its restart timer.
    /// `targets` selects autoconnect behavior: stop on the first sighting
    /// of a target and report it. The pump exits through the returned stop
    /// channel, stopping the hardware scan before it goes.
    fn spawn_pump(
        &self,
        config: ScanConfig,
        targets: Option<HashSet<DeviceAddress>>,
    ) -> oneshot::Sender<()> {
        let radio = Arc::clone(&self.radio);
        let events = self.events.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
                let handle = match radio.start_scan(config.clone(), scan_tx) {
                    Ok(handle) => handle,
                    Err(failure) => {
                        warn!(?failure, "scan failed to start");
                        let _ = events.send(ScanEngineEvent::ScanFailed(failure));
                        return;
                    }
                };

                let restart = tokio::time::sleep(SCAN_RESTART_INTERVAL);
                tokio::pin!(restart);

                let outcome = loop {
                    tokio::select! {
                        event = scan_rx.recv() => match event {
                            Some(ScanEvent::Sighting(adv)) => {
                                if let Some(targets) = &targets {
                                    if targets.contains(&adv.address) {
                                        break PumpOutcome::TargetSighted(adv.address.clone());
                                    }
                                } else if name_filter_matches(&config, &adv) {
                                    let _ = events.send(ScanEngineEvent::Discovered(adv));
                                }
                            }
                            Some(ScanEvent::Failed(failure)) => {
                                break PumpOutcome::Failed(failure);
                            }
                            None => break PumpOutcome::Failed(ScanFailure::InternalError),
                        },
                        _ = &mut restart => break PumpOutcome::Restart,
                        _ = &mut stop_rx => break PumpOutcome::Stopped,
                    }
                };

                radio.stop_scan(handle);

                match outcome {
                    PumpOutcome::Restart => {
                        debug!("restarting scan to avoid throttling");
                        tokio::time::sleep(SCAN_RESTART_COOLDOWN).await;
                    }
                    PumpOutcome::TargetSighted(address) => {
                        info!(%address, "autoconnect target sighted");
                        let _ = events.send(ScanEngineEvent::AutoConnectSighting(address));
                        return;
                    }
                    PumpOutcome::Failed(failure) => {
                        warn!(?failure, "scan failed");
                        let _ = events.send(ScanEngineEvent::ScanFailed(failure));
                        return;
                    }
                    PumpOutcome::Stopped => return,
                }
            }
        });

        stop_tx
    }
}

enum PumpOutcome {
    Restart,
    TargetSighted(DeviceAddress),
    Failed(ScanFailure),
    Stopped,
}

fn name_filter_matches(config: &ScanConfig, adv: &Advertisement) -> bool {
    if config.name_substrings.is_empty() {
        return true;
    }
    match &adv.local_name {
        Some(name) => config
            .name_substrings
            .iter()
            .any(|needle| name.contains(needle.as_str())),
        None => false,
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
