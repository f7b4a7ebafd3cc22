//! Watching a freshly started instance until its agent reports `running`.

use std::time::Duration;

use fleet_cloud::{AgentClient, AgentJobState};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// Delay between two state polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `agent_id` until it reports `running` or `watch_time` runs out.
///
/// An unreachable agent counts as not running yet: a VM that just booted
/// may take a while to answer.
pub async fn watch_until_running(
    agents: &dyn AgentClient,
    instance: &str,
    agent_id: &str,
    watch_time: Duration,
) -> RolloutResult<()> {
    let started = Instant::now();
    let deadline = started + watch_time;
    let mut last_state = "unknown".to_string();
    loop {
        match agents.get_state(agent_id).await {
            Ok(AgentJobState::Running) => {
                debug!(%instance, waited_ms = started.elapsed().as_millis() as u64, "instance running");
                return Ok(());
            }
            Ok(state) => last_state = format!("{state:?}").to_lowercase(),
            Err(e) => last_state = e.to_string(),
        }
        if Instant::now() >= deadline {
            return Err(RolloutError::Unhealthy {
                instance: instance.to_string(),
                waited_ms: watch_time.as_millis() as u64,
                last_state,
            });
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}
