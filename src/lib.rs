//! Function-level execution tracing organized into experiment runs.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::collections::BTreeMap;
//! use traced::prelude::*;
//!
//! traced::init_logging();
//! let tracer = traced::tracer_from_env().await?;
//! tracer.spawn_background()?;
//! let run = tracer.start_run("baseline", BTreeMap::new());
//! let square = tracer.instrument("square", |x: i64| x * x);
//! assert_eq!(square.call(7), 49);
//! tracer.end_run(run, RunStatus::Completed).await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;

pub use traced_core as core;
pub use traced_proto as proto;
pub use traced_server as server;

pub mod prelude {
    pub use traced_core::trace::{Json, Opaque};
    pub use traced_core::{
        QueryService, RunComparator, RunOptions, TraceStore, Tracer, TracerConfig, WrapOptions,
    };
    pub use traced_proto::prelude::*;
}

use traced_core::config::ConfigStore;
use traced_core::{Tracer, TracerConfig};
use traced_server::AppState;

const ENV_TRACED_LOGLEVEL: &str = "TRACED_LOGLEVEL";
const ENV_TRACED_ADDR: &str = "TRACED_ADDR";

/// Initializes `env_logger` from `TRACED_LOGLEVEL`. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::try_init_from_env(env_logger::Env::new().filter(ENV_TRACED_LOGLEVEL));
}

/// Tracer configuration from `TRACED_*` environment variables.
pub fn config_from_env() -> Result<TracerConfig> {
    let store = ConfigStore::new();
    let loaded = store.load_env();
    log::debug!("loaded {loaded} settings from the environment");
    Ok(TracerConfig::from_store(&store)?)
}

/// Tracer configured from the environment, with its stores opened.
pub async fn tracer_from_env() -> Result<Tracer> {
    let config = config_from_env()?;
    Ok(Tracer::connect(config).await?)
}

/// Starts the flusher and, when `TRACED_ADDR` is set, serves the query and
/// live API on that address in the background.
pub async fn launch(tracer: &Tracer) -> Result<Option<tokio::task::JoinHandle<()>>> {
    tracer.spawn_background()?;
    let Ok(addr) = std::env::var(ENV_TRACED_ADDR) else {
        return Ok(None);
    };
    let state = AppState::from_tracer(tracer)?;
    let handle = tokio::spawn(async move {
        if let Err(e) = traced_server::serve(&addr, state).await {
            log::error!("traced server stopped: {e:#}");
        }
    });
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::prelude::*;

    #[tokio::test]
    async fn test_launch_without_address_only_starts_flusher() -> anyhow::Result<()> {
        super::init_logging();
        super::init_logging();
        std::env::remove_var(super::ENV_TRACED_ADDR);

        let dir = TempDir::new()?;
        let config = TracerConfig {
            store_url: Some(dir.path().join("traces").display().to_string()),
            ..TracerConfig::default()
        };
        let tracer = Tracer::connect(config).await?;
        assert!(super::launch(&tracer).await?.is_none());

        let run = tracer.start_run("facade", BTreeMap::new());
        let double = tracer.instrument("double", |x: i64| x * 2);
        assert_eq!(double.call(21), 42);
        let run = tracer.end_run(run, RunStatus::Completed).await?;
        tracer.shutdown().await;

        let store = tracer.store().expect("configured store");
        assert_eq!(store.read_spans(&run.id).await?.len(), 1);
        Ok(())
    }
}
