//! Heartbeat-driven maintenance.

use super::{Effects, NodeState, Phase};
use lace_proto::Body;
use std::net::SocketAddr;
use tracing::{debug, info};

impl NodeState {
    /// One heartbeat.
    ///
    /// - joining: re-send `hello`
    /// - member: expire silent peers and ping the rest; when peerless,
    ///   announce ourselves to recently seen and bootstrap addresses;
    ///   otherwise shed peers outside our row and column
    pub fn tick(&mut self, fx: &mut Effects) {
        match self.phase {
            Phase::Unjoined => {}
            Phase::Joining => {
                debug!(node = %self.id.short(), "re-sending hello");
                self.send_hellos(fx);
            }
            Phase::Member => self.tick_member(fx),
        }
    }

    fn tick_member(&mut self, fx: &mut Effects) {
        for id in self.peers.sweep(self.settings.max_missed_pings) {
            if self.remove_peer(&id, fx) {
                info!(peer = %id.short(), "peer timed out");
            }
        }

        if self.peers.is_empty() {
            self.seek_peers(fx);
            return;
        }

        let ping = self.originate(Body::Ping);
        self.flood(&ping, None, fx);
        self.shed_incompatible(fx);
    }

    /// Announce our coordinate to everyone we might still reach.
    fn seek_peers(&mut self, fx: &mut Effects) {
        let mut targets: Vec<SocketAddr> = self.recent.snapshot();
        for addr in &self.settings.bootstrap {
            if !targets.contains(addr) {
                targets.push(*addr);
            }
        }
        if let Some(own) = self.settings.advertise {
            targets.retain(|addr| *addr != own);
        }
        if targets.is_empty() {
            return;
        }
        debug!(node = %self.id.short(), targets = targets.len(), "peerless, announcing");
        let env = self.originate(Body::NeedPeer);
        for target in targets {
            fx.sends.push((target, env.clone()));
        }
    }
}
