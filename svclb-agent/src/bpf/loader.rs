use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;

use aya::maps::Map;
use aya::programs::cgroup_sock_addr::CgroupSockAddrLinkId;
use aya::programs::{CgroupAttachMode, CgroupSockAddr};
use aya::{Ebpf, EbpfLoader};
use svclb_common::BPF_PROGRAM_CONNECT4;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AgentArgs;
use crate::{Error, Result};

/// The loaded connect4 object. Dropping the last clone detaches the program;
/// the pinned maps stay behind for the next run and for the inspect commands.
#[derive(Clone)]
pub struct State {
    pub ebpf: Arc<Mutex<Ebpf>>,
    _cgroup_addr_link_id: Arc<CgroupSockAddrLinkId>,
}

impl State {
    pub fn try_new(args: &AgentArgs) -> Result<State> {
        let pin_path = args.maps.pin_path();
        std::fs::create_dir_all(&pin_path)?;
        let mut ebpf = load(&args.bpf_object, &pin_path)?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }

        let cgroup = File::open(&args.cgroup_fs)?;
        let _cgroup_addr_link_id = Arc::new(attach_cgroup_connect_bpf_program(
            &mut ebpf,
            cgroup,
            BPF_PROGRAM_CONNECT4,
            CgroupAttachMode::Single,
        )?);
        info!(
            cgroup = %args.cgroup_fs.display(),
            program = BPF_PROGRAM_CONNECT4,
            "attached connect4 program"
        );
        Ok(Self {
            ebpf: Arc::new(Mutex::new(ebpf)),
            _cgroup_addr_link_id,
        })
    }

    pub async fn take_map(&self, name: &str) -> Option<Map> {
        let mut ebpf = self.ebpf.lock().await;
        ebpf.take_map(name)
    }
}

fn load(object: &Path, pin_path: &Path) -> Result<Ebpf> {
    info!(
        object = %object.display(),
        pin_path = %pin_path.display(),
        "loading bpf object"
    );
    Ok(EbpfLoader::new().map_pin_path(pin_path).load_file(object)?)
}

fn attach_cgroup_connect_bpf_program<F: AsFd>(
    ebpf: &mut Ebpf,
    cgroup: F,
    name: &str,
    attach_mode: CgroupAttachMode,
) -> Result<CgroupSockAddrLinkId> {
    let program: &mut CgroupSockAddr = ebpf
        .program_mut(name)
        .ok_or_else(|| Error::EbpfProgramError(format!("failed to load program {name}")))?
        .try_into()?;
    if let Err(e) = program.load()
        && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
    {
        return Err(e.into());
    };
    Ok(program.attach(cgroup, attach_mode)?)
}
