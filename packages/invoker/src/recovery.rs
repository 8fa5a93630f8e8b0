// ABOUTME: Startup crash recovery: sweep sandboxes a previous run of this invoker left behind

use std::collections::HashMap;

use tracing::warn;

use penguinwhisk_sandbox::{Substrate, SubstrateError};

/// Remove every sandbox carrying this invoker's labels. An invoker that
/// crashed mid-activation leaves containers on the daemon; they must be
/// gone before new work is accepted.
pub async fn remove_leftover_sandboxes(substrate: &dyn Substrate) -> Result<(), SubstrateError> {
    let leftovers = substrate.list_sandboxes(&HashMap::new()).await?;
    if leftovers.is_empty() {
        return Ok(());
    }

    warn!(
        count = leftovers.len(),
        "removing sandboxes left over from a previous run"
    );
    for sandbox in leftovers {
        if let Err(e) = substrate.remove(&sandbox.id, true).await {
            warn!(sandbox_id = %sandbox.id, error = %e, "failed to remove leftover sandbox");
        }
    }
    Ok(())
}
