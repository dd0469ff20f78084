//! Shared mocks and knobs for unit tests.

use std::sync::Mutex;

use crate::boundary::{PeriphOps, SimInfo, SimPort, SimRequest};
use crate::cmd::{CmdRef, CmdSnapshot, CmdStatus, IoSpec};
use crate::topology::{BusId, Topology};

pub fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
}

fn is_ci() -> bool {
    std::env::var_os("CI").is_some()
}

pub fn proptest_cases(default: u32) -> u32 {
    if let Some(value) = env_u32("PROPTEST_CASES") {
        return value.max(1);
    }
    if is_ci() {
        return default.max(1);
    }
    default.clamp(1, 4)
}

/// A controller port with fixed limits that records everything handed to
/// it and never completes anything on its own.
pub struct StaticSim {
    name: String,
    device_openings: u32,
    executed: Mutex<Vec<CmdSnapshot>>,
    aborts: Mutex<Vec<CmdRef>>,
    resets: Mutex<Vec<BusId>>,
}

impl StaticSim {
    pub fn new(name: &str, device_openings: u32) -> Self {
        Self {
            name: name.to_owned(),
            device_openings,
            executed: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<CmdSnapshot> {
        self.executed.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<CmdRef> {
        self.aborts.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<BusId> {
        self.resets.lock().unwrap().clone()
    }
}

impl SimPort for StaticSim {
    fn info(&self) -> SimInfo {
        SimInfo {
            sim_name: self.name.clone(),
            unit: 0,
            max_target: 15,
            max_lun: 7,
            controller_openings: 4,
            device_openings: self.device_openings,
        }
    }

    fn submit(&self, _xpt: &Topology, request: SimRequest) {
        match request {
            SimRequest::Execute(snapshot) => self.executed.lock().unwrap().push(snapshot),
            SimRequest::Abort { cmd } => self.aborts.lock().unwrap().push(cmd),
            SimRequest::ResetBus { bus } => self.resets.lock().unwrap().push(bus),
        }
    }
}

/// A peripheral that holds granted blocks for the test body to submit.
pub struct HoldPeriph {
    started: Mutex<Vec<CmdRef>>,
    finished: Mutex<Vec<(CmdRef, CmdStatus)>>,
}

impl HoldPeriph {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> Vec<CmdRef> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<(CmdRef, CmdStatus)> {
        self.finished.lock().unwrap().clone()
    }
}

impl PeriphOps for HoldPeriph {
    fn start(&self, _xpt: &Topology, cmd: CmdRef) {
        self.started.lock().unwrap().push(cmd);
    }

    fn done(&self, _xpt: &Topology, cmd: CmdRef, status: CmdStatus) {
        self.finished.lock().unwrap().push((cmd, status));
    }
}

/// A peripheral that submits plain device I/O as soon as a block is
/// granted and releases it on completion.
pub struct AutoPeriph {
    finished: Mutex<Vec<(CmdRef, CmdStatus)>>,
}

impl AutoPeriph {
    pub fn new() -> Self {
        Self {
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn finished(&self) -> Vec<(CmdRef, CmdStatus)> {
        self.finished.lock().unwrap().clone()
    }
}

impl PeriphOps for AutoPeriph {
    fn start(&self, xpt: &Topology, cmd: CmdRef) {
        xpt.submit_io(cmd, IoSpec::device_io()).unwrap();
    }

    fn done(&self, xpt: &Topology, cmd: CmdRef, status: CmdStatus) {
        self.finished.lock().unwrap().push((cmd, status));
        xpt.release_cmd(cmd).unwrap();
    }
}
