//! Enumeration: paginated, pattern-matched topology walks.
//!
//! `match_query` walks Bus → Target → Device → Peripheral depth-first,
//! copying nodes that match the caller's patterns into a bounded record
//! buffer. When the buffer fills, the walk stops and returns a
//! [`PositionCookie`] naming the first *unemitted* node plus the generation
//! counter of every list on the path to it; resuming with the cookie
//! re-matches exactly that node first, so concatenated pages equal one
//! unbounded call. If any stored generation no longer matches the live
//! list, the reply is `ListChanged` and the caller restarts from scratch.
//!
//! Patterns are OR'd within a type; a type with no patterns copies nothing
//! of that type but still descends when deeper pattern types exist. Zero
//! patterns overall copies everything to peripheral depth.

use serde::{Deserialize, Serialize};

use crate::boundary::SimInfo;
use crate::topology::{BusId, DeviceIdent, LunId, PathSpec, TargetId, Topology};
use crate::trace::TraceEvent;

/// Selects buses. Unset fields match anything; wildcard ids too.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusPattern {
    pub path_id: Option<BusId>,
    pub sim_name: Option<String>,
    pub unit: Option<u32>,
}

/// Selects devices. `vendor`/`product` are shell-style globs (`*`, `?`)
/// applied to the announced identity; a device still provisional cannot
/// match a pattern that constrains identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePattern {
    pub path_id: Option<BusId>,
    pub target_id: Option<TargetId>,
    pub lun: Option<LunId>,
    pub vendor: Option<String>,
    pub product: Option<String>,
}

/// Selects peripherals by name/unit and/or the address they sit at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriphPattern {
    pub name: Option<String>,
    pub unit: Option<u32>,
    pub path_id: Option<BusId>,
    pub target_id: Option<TargetId>,
    pub lun: Option<LunId>,
}

/// The full pattern set for one query. Patterns within a list are OR'd.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPatterns {
    pub buses: Vec<BusPattern>,
    pub devices: Vec<DevicePattern>,
    pub periphs: Vec<PeriphPattern>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRecord {
    pub bus: BusId,
    pub sim_name: String,
    pub unit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub addr: PathSpec,
    pub ident: Option<DeviceIdent>,
    /// Created by path compilation but never announced.
    pub provisional: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriphRecord {
    pub addr: PathSpec,
    pub name: String,
    pub unit: u32,
}

/// One emitted row, in traversal order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchRecord {
    Bus(BusRecord),
    Device(DeviceRecord),
    Periph(PeriphRecord),
}

/// One level of a resume position: the node's id, its arena slot, and the
/// generation of the list it was found in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CookieLevel {
    id: u32,
    slot: (u32, u32),
    generation: u64,
}

/// Resumable cursor for `match_query`. Opaque to callers but serializable
/// so management tools can hold it across requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCookie {
    bus: Option<CookieLevel>,
    target: Option<CookieLevel>,
    device: Option<CookieLevel>,
    periph: Option<CookieLevel>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// Buffer filled; resume with the cookie.
    More,
    /// Traversal completed.
    Last,
    /// A list on the resume path mutated since the cookie was written; the
    /// caller restarts the enumeration.
    ListChanged,
}

#[derive(Clone, Debug)]
pub struct MatchReply {
    pub records: Vec<MatchRecord>,
    pub cookie: Option<PositionCookie>,
    pub status: MatchStatus,
}

impl Topology {
    /// Enumerate up to `capacity` matching records, resuming from `cookie`
    /// if given. See the module docs for the traversal contract.
    pub fn match_query(
        &self,
        patterns: &MatchPatterns,
        cookie: Option<&PositionCookie>,
        capacity: usize,
    ) -> MatchReply {
        let wide_open =
            patterns.buses.is_empty() && patterns.devices.is_empty() && patterns.periphs.is_empty();
        let copy_buses = wide_open || !patterns.buses.is_empty();
        let copy_devices = wide_open || !patterns.devices.is_empty();
        let copy_periphs = wide_open || !patterns.periphs.is_empty();
        let visit_devices = copy_devices || copy_periphs;

        let dir_gen = self.directory_generation();
        let mut resume = cookie.cloned().unwrap_or_default();
        if let Some(b) = &resume.bus {
            if b.generation != dir_gen {
                return list_changed();
            }
        }

        let mut records: Vec<MatchRecord> = Vec::new();
        let buses = self.buses_snapshot();
        let start_bus = resume.bus.as_ref().map(|b| BusId(b.id));
        for bus in &buses {
            if let Some(start) = start_bus {
                if bus.id < start {
                    continue;
                }
            }
            // Deeper resume levels apply only to the cookie's own bus.
            let here = start_bus == Some(bus.id);
            let (r_target, r_device, r_periph) = if here {
                (resume.target.take(), resume.device.take(), resume.periph.take())
            } else {
                (None, None, None)
            };
            let descended_past =
                r_target.is_some() || r_device.is_some() || r_periph.is_some();

            if copy_buses && !descended_past && bus_matches(&patterns.buses, bus.id, &bus.info) {
                if records.len() == capacity {
                    return self.more(
                        records,
                        PositionCookie {
                            bus: Some(CookieLevel {
                                id: bus.id.0,
                                slot: (0, 0),
                                generation: dir_gen,
                            }),
                            ..PositionCookie::default()
                        },
                    );
                }
                records.push(MatchRecord::Bus(BusRecord {
                    bus: bus.id,
                    sim_name: bus.info.sim_name.clone(),
                    unit: bus.info.unit,
                }));
            }
            if !visit_devices {
                continue;
            }

            let core = bus.lock();
            let bus_level = CookieLevel {
                id: bus.id.0,
                slot: (0, 0),
                generation: dir_gen,
            };
            let t_start = match &r_target {
                Some(level) => {
                    if core.target_list_gen != level.generation {
                        return list_changed();
                    }
                    match core
                        .target_list
                        .iter()
                        .position(|(_, th)| th.raw() == level.slot)
                    {
                        Some(pos) => pos,
                        None => return list_changed(),
                    }
                }
                None => 0,
            };
            for ti in t_start..core.target_list.len() {
                let (tid, th) = core.target_list[ti];
                let first_target = ti == t_start && r_target.is_some();
                let (r_device, r_periph) = if first_target {
                    (r_device.clone(), r_periph.clone())
                } else {
                    (None, None)
                };
                let target = core
                    .targets
                    .get(th)
                    .unwrap_or_else(|| unreachable!());
                let target_level = CookieLevel {
                    id: tid.0,
                    slot: th.raw(),
                    generation: core.target_list_gen,
                };
                let d_start = match &r_device {
                    Some(level) => {
                        if target.device_list_gen != level.generation {
                            return list_changed();
                        }
                        match target
                            .devices
                            .iter()
                            .position(|(_, dh)| dh.raw() == level.slot)
                        {
                            Some(pos) => pos,
                            None => return list_changed(),
                        }
                    }
                    None => 0,
                };
                for di in d_start..target.devices.len() {
                    let (lun, dh) = target.devices[di];
                    let first_device = first_target && di == d_start && r_device.is_some();
                    let r_periph = if first_device { r_periph.clone() } else { None };
                    let dev = core.devices.get(dh).unwrap_or_else(|| unreachable!());
                    let device_level = CookieLevel {
                        id: lun.0,
                        slot: dh.raw(),
                        generation: target.device_list_gen,
                    };

                    if copy_devices
                        && r_periph.is_none()
                        && device_matches(&patterns.devices, dev.addr, dev.ident.as_ref())
                    {
                        if records.len() == capacity {
                            return self.more(
                                records,
                                PositionCookie {
                                    bus: Some(bus_level),
                                    target: Some(target_level),
                                    device: Some(device_level),
                                    periph: None,
                                },
                            );
                        }
                        records.push(MatchRecord::Device(DeviceRecord {
                            addr: dev.addr,
                            ident: dev.ident.clone(),
                            provisional: dev.ident.is_none(),
                        }));
                    }
                    if !copy_periphs {
                        continue;
                    }
                    let p_start = match &r_periph {
                        Some(level) => {
                            if dev.periph_list_gen != level.generation {
                                return list_changed();
                            }
                            match dev.periphs.iter().position(|ph| ph.raw() == level.slot) {
                                Some(pos) => pos,
                                None => return list_changed(),
                            }
                        }
                        None => 0,
                    };
                    for pi in p_start..dev.periphs.len() {
                        let ph = dev.periphs[pi];
                        let periph = core.periphs.get(ph).unwrap_or_else(|| unreachable!());
                        if !periph_matches(&patterns.periphs, &periph.name, periph.unit, dev.addr)
                        {
                            continue;
                        }
                        if records.len() == capacity {
                            return self.more(
                                records,
                                PositionCookie {
                                    bus: Some(bus_level),
                                    target: Some(target_level),
                                    device: Some(device_level),
                                    periph: Some(CookieLevel {
                                        id: periph.unit,
                                        slot: ph.raw(),
                                        generation: dev.periph_list_gen,
                                    }),
                                },
                            );
                        }
                        records.push(MatchRecord::Periph(PeriphRecord {
                            addr: dev.addr,
                            name: periph.name.clone(),
                            unit: periph.unit,
                        }));
                    }
                }
            }
        }
        self.trace.record(TraceEvent::MatchPage {
            copied: records.len() as u32,
            more: false,
        });
        MatchReply {
            records,
            cookie: None,
            status: MatchStatus::Last,
        }
    }

    fn more(&self, records: Vec<MatchRecord>, cookie: PositionCookie) -> MatchReply {
        self.trace.record(TraceEvent::MatchPage {
            copied: records.len() as u32,
            more: true,
        });
        MatchReply {
            records,
            cookie: Some(cookie),
            status: MatchStatus::More,
        }
    }
}

fn list_changed() -> MatchReply {
    MatchReply {
        records: Vec::new(),
        cookie: None,
        status: MatchStatus::ListChanged,
    }
}

fn id_matches(pattern: Option<u32>, value: u32) -> bool {
    match pattern {
        None => true,
        Some(id) if id == u32::MAX => true,
        Some(id) => id == value,
    }
}

fn bus_matches(patterns: &[BusPattern], id: BusId, info: &SimInfo) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|p| {
            id_matches(p.path_id.map(|b| b.0), id.0)
                && p.sim_name.as_deref().is_none_or(|n| n == info.sim_name)
                && p.unit.is_none_or(|u| u == info.unit)
        })
}

fn device_matches(patterns: &[DevicePattern], addr: PathSpec, ident: Option<&DeviceIdent>) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|p| {
            id_matches(p.path_id.map(|b| b.0), addr.bus.0)
                && id_matches(p.target_id.map(|t| t.0), addr.target.0)
                && id_matches(p.lun.map(|l| l.0), addr.lun.0)
                && p.vendor.as_deref().is_none_or(|glob| {
                    ident.is_some_and(|i| glob_match(glob, &i.vendor))
                })
                && p.product.as_deref().is_none_or(|glob| {
                    ident.is_some_and(|i| glob_match(glob, &i.product))
                })
        })
}

fn periph_matches(patterns: &[PeriphPattern], name: &str, unit: u32, addr: PathSpec) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|p| {
            p.name.as_deref().is_none_or(|n| n == name)
                && p.unit.is_none_or(|u| u == unit)
                && id_matches(p.path_id.map(|b| b.0), addr.bus.0)
                && id_matches(p.target_id.map(|t| t.0), addr.target.0)
                && id_matches(p.lun.map(|l| l.0), addr.lun.0)
        })
}

/// Shell-style glob: `*` matches any run, `?` any one character. Iterative
/// backtracking over the last `*`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            // Let the last `*` swallow one more character and retry.
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
