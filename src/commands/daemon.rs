use anyhow::Result;

use crate::commands::init_tracing;
use crate::config::ConfigSource;
use crate::runtime::AgentRuntime;

pub fn run(source: ConfigSource) -> Result<()> {
    let config = source.load()?;
    init_tracing(config.effective_log_level(), true);

    // Identity is checked before any task or runtime thread starts.
    let agent = AgentRuntime::new(source)?;

    // main stays synchronous; the runtime lives only as long as the daemon
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(agent.run())
}
