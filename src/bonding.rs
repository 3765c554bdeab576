//! Bond-state bookkeeping for one connection.
//!
//! The coordinator turns raw bond-state transitions into a list of
//! actions for the session to carry out. It owns the flags that
//! distinguish a bond we requested, a bond the peripheral initiated
//! mid-session, and a bond the remote silently dropped.

use tracing::{debug, warn};

use crate::models::BondState;

/// What the session must do in response to a bond-state transition.
/// Actions are emitted in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BondAction {
    NotifyStarted,
    NotifySucceeded,
    NotifyFailed,
    NotifyLost,
    /// Bonding finished before services were discovered; start discovery
    /// now.
    StartDiscovery,
    /// A command failed on an encryption error and was parked; re-issue it
    /// after the grace delay.
    RetryBlockedCommand,
    /// The queued `create_bond` command is done; complete it.
    CompleteManualBond,
    /// The peripheral bonded us mid-queue; kick the queue again.
    ResumeQueue,
    /// The remote dropped the bond; tear the connection down.
    Disconnect,
}

/// Session-side context the coordinator needs to pick actions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BondContext {
    pub connected: bool,
    pub services_discovered: bool,
    pub discovery_in_progress: bool,
    /// A command is parked waiting for bonding to finish.
    pub command_blocked_for_bonding: bool,
}

pub(crate) struct BondCoordinator {
    bond_lost: bool,
    manually_bonding: bool,
    peripheral_initiated_bonding: bool,
}

impl BondCoordinator {
    pub fn new() -> Self {
        Self {
            bond_lost: false,
            manually_bonding: false,
            peripheral_initiated_bonding: false,
        }
    }

    pub fn bond_lost(&self) -> bool {
        self.bond_lost
    }

    pub fn clear_bond_lost(&mut self) {
        self.bond_lost = false;
    }

    /// Mark that a `create_bond` command is about to run.
    pub fn begin_manual_bond(&mut self) {
        self.manually_bonding = true;
    }

    /// Reset per-connection flags; bond state itself survives the link.
    pub fn reset_connection_flags(&mut self) {
        self.manually_bonding = false;
        self.peripheral_initiated_bonding = false;
    }

    pub fn handle_transition(
        &mut self,
        new_state: BondState,
        previous: BondState,
        ctx: BondContext,
    ) -> Vec<BondAction> {
        let mut actions = Vec::new();
        match new_state {
            BondState::Bonding => {
                debug!("bonding started");
                if !self.manually_bonding {
                    self.peripheral_initiated_bonding = true;
                }
                actions.push(BondAction::NotifyStarted);
            }
            BondState::Bonded => {
                debug!("bonded");
                actions.push(BondAction::NotifySucceeded);

                if ctx.connected && !ctx.services_discovered && !ctx.discovery_in_progress {
                    actions.push(BondAction::StartDiscovery);
                }
                if ctx.command_blocked_for_bonding && !self.manually_bonding {
                    actions.push(BondAction::RetryBlockedCommand);
                }
                if self.manually_bonding {
                    self.manually_bonding = false;
                    actions.push(BondAction::CompleteManualBond);
                }
                if self.peripheral_initiated_bonding {
                    self.peripheral_initiated_bonding = false;
                    actions.push(BondAction::ResumeQueue);
                }
            }
            BondState::None => {
                if previous == BondState::Bonding {
                    warn!("bonding failed");
                    self.manually_bonding = false;
                    self.peripheral_initiated_bonding = false;
                    actions.push(BondAction::NotifyFailed);
                } else {
                    warn!("bond lost");
                    self.bond_lost = true;
                    actions.push(BondAction::NotifyLost);
                    if ctx.connected {
                        actions.push(BondAction::Disconnect);
                    }
                }
            }
        }

        actions
    }
}
