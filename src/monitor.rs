use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use crate::supervisor::Shared;

/// Spawns the idle monitor for one running episode.
///
/// The monitor polls at the configured interval and stops the process once
/// activity has been absent longer than the idle timeout. It is bound to the
/// episode it was spawned for: as soon as the supervisor's epoch moves past
/// `epoch` the loop exits without acting, so a stale monitor can never stop
/// a process that was started again in the interim. Every exit path is
/// guaranteed, which keeps repeated restarts from accumulating live tasks.
pub(crate) fn spawn_idle_monitor(shared: Arc<Shared>, epoch: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let startup_grace = shared.config.startup_grace;
        if !startup_grace.is_zero() {
            sleep(startup_grace).await;
        }

        let mut tick = interval(shared.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shared.epoch.load(Ordering::SeqCst) != epoch {
                debug!(
                    site = %shared.config.location,
                    epoch,
                    "idle monitor superseded by a newer episode"
                );
                return;
            }

            if shared.activity.idle_for() < shared.config.idle_timeout {
                continue;
            }

            info!(
                site = %shared.config.location,
                idle_for = ?shared.activity.idle_for(),
                "idle timeout reached, stopping upstream process"
            );
            // Re-checked against the epoch under the lifecycle lock.
            shared.stop_epoch(epoch).await;
            return;
        }
    })
}
