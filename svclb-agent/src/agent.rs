use std::time::Duration;

use svclb_common::{BPF_MAP_BACKENDS_V4, BPF_MAP_SERVICES_V4};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bpf::loader;
use crate::bpf::service::ServiceBackendState;
use crate::bpf::{BackendMapV4, ServiceMapV4};
use crate::config::AgentArgs;
use crate::metrics::SyncMetrics;
use crate::sync::{self, Syncer};
use crate::{Error, Result};

/// Loads and attaches the connect4 program, then keeps its maps in sync with
/// the services file until `cancel` fires. The program stays attached for as
/// long as this future runs.
pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let loader = loader::State::try_new(&args)?;

    let service_map: ServiceMapV4 = loader
        .take_map(BPF_MAP_SERVICES_V4)
        .await
        .ok_or_else(|| Error::MapNotFound {
            name: BPF_MAP_SERVICES_V4.into(),
        })?
        .try_into()?;
    let backend_map: BackendMapV4 = loader
        .take_map(BPF_MAP_BACKENDS_V4)
        .await
        .ok_or_else(|| Error::MapNotFound {
            name: BPF_MAP_BACKENDS_V4.into(),
        })?
        .try_into()?;
    info!("loaded service and backend maps");

    let state = ServiceBackendState::try_new(service_map, backend_map)?;
    let metrics = SyncMetrics::default().register_global()?;
    let syncer = Syncer::new(state, metrics);

    info!(
        path = %args.services_file.display(),
        interval = args.sync_interval,
        "starting service sync"
    );
    let result = sync::run(
        syncer,
        args.services_file.clone(),
        Duration::from_secs(args.sync_interval.max(1)),
        ready,
        cancel,
    )
    .await;

    drop(loader);
    info!("detached connect4 program");
    result
}
