// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Host interrupt fabric.
//!
//! Host interrupt controllers register as domains; every hardware line of
//! a domain gets a host IRQ number and a descriptor. A host IRQ either runs
//! the handlers requested on it or is routed to a guest, in which case it
//! stays masked from delivery until the guest signals end of interrupt on
//! the virtual line.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;
use hypervisor::CpuMask;
use vm_device::IrqRouter;

use crate::error::{Error, Result};

bitflags! {
    /// Passthrough state of a routed host IRQ.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RoutedState: u32 {
        const PENDING = 1 << 0;
        const ACTIVE = 1 << 1;
        const MASKED = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IrqType {
    EdgeRising,
    EdgeFalling,
    #[default]
    LevelHigh,
    LevelLow,
}

impl IrqType {
    pub fn is_level(self) -> bool {
        matches!(self, IrqType::LevelHigh | IrqType::LevelLow)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

/// A host interrupt controller.
pub trait HostIrqChip: Send + Sync {
    fn mask(&self, hwirq: u32);
    fn unmask(&self, hwirq: u32);
    fn eoi(&self, _hwirq: u32) {}
    fn set_type(&self, _hwirq: u32, _ty: IrqType) -> Result<()> {
        Ok(())
    }
    fn set_affinity(&self, _hwirq: u32, _cpus: CpuMask) -> Result<()> {
        Ok(())
    }
    /// Mirror of the passthrough state, for chips that keep it in hardware.
    fn set_routed_state(&self, _hwirq: u32, _state: RoutedState) {}
    /// Pending inputs of a cascaded chip, read by its parent's handler.
    fn pending(&self) -> Vec<u32> {
        Vec::new()
    }
}

pub type IrqHandler = Arc<dyn Fn(u32, usize) -> IrqReturn + Send + Sync>;

struct IrqAction {
    name: String,
    handler: IrqHandler,
}

#[derive(Clone)]
struct GuestRoute {
    guest: String,
    router: Weak<IrqRouter>,
    line: u32,
}

struct DescState {
    irq_type: IrqType,
    affinity: CpuMask,
    per_cpu: bool,
    actions: Vec<IrqAction>,
    counts: Vec<u64>,
    routed: RoutedState,
    route: Option<GuestRoute>,
}

pub struct IrqDesc {
    hirq: u32,
    hwirq: u32,
    domain: Arc<IrqDomain>,
    state: Mutex<DescState>,
}

impl IrqDesc {
    pub fn hirq(&self) -> u32 {
        self.hirq
    }

    pub fn hwirq(&self) -> u32 {
        self.hwirq
    }

    fn chip(&self) -> &dyn HostIrqChip {
        self.domain.chip.as_ref()
    }
}

pub struct IrqDomain {
    name: String,
    base: u32,
    count: u32,
    chip: Arc<dyn HostIrqChip>,
}

impl IrqDomain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Snapshot of one host IRQ, for listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrqInfo {
    pub hirq: u32,
    pub domain: String,
    pub hwirq: u32,
    pub actions: Vec<String>,
    pub routed_to: Option<(String, u32)>,
    pub state: RoutedState,
    pub count: u64,
}

pub struct HostIrqFabric {
    cpus: usize,
    domains: RwLock<Vec<Arc<IrqDomain>>>,
    descs: RwLock<BTreeMap<u32, Arc<IrqDesc>>>,
    weak_self: Weak<HostIrqFabric>,
}

impl HostIrqFabric {
    pub fn new(cpus: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| HostIrqFabric {
            cpus,
            domains: RwLock::new(Vec::new()),
            descs: RwLock::new(BTreeMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Register `count` lines of `chip`, returning the first host IRQ number
    /// of the domain.
    pub fn add_domain(&self, name: &str, count: u32, chip: Arc<dyn HostIrqChip>) -> Result<u32> {
        if count == 0 {
            return Err(Error::Invalid(format!("IRQ domain {} has no lines", name)));
        }
        let mut domains = self.domains.write().unwrap();
        if domains.iter().any(|d| d.name == name) {
            return Err(Error::AlreadyExists(format!("IRQ domain {}", name)));
        }
        let base = domains.last().map(|d| d.base + d.count).unwrap_or(0);
        let domain = Arc::new(IrqDomain {
            name: name.to_string(),
            base,
            count,
            chip,
        });

        let mut descs = self.descs.write().unwrap();
        for hwirq in 0..count {
            let hirq = base + hwirq;
            descs.insert(
                hirq,
                Arc::new(IrqDesc {
                    hirq,
                    hwirq,
                    domain: domain.clone(),
                    state: Mutex::new(DescState {
                        irq_type: IrqType::default(),
                        affinity: CpuMask::first_n(self.cpus),
                        per_cpu: false,
                        actions: Vec::new(),
                        counts: vec![0; self.cpus],
                        routed: RoutedState::empty(),
                        route: None,
                    }),
                }),
            );
        }
        domains.push(domain);
        info!("IRQ domain {}: host IRQs {}..{}", name, base, base + count);
        Ok(base)
    }

    pub fn domain(&self, name: &str) -> Option<Arc<IrqDomain>> {
        self.domains
            .read()
            .unwrap()
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    /// Host IRQ number of line `hwirq` of domain `name`.
    pub fn find_mapping(&self, name: &str, hwirq: u32) -> Option<u32> {
        self.domain(name)
            .filter(|d| hwirq < d.count)
            .map(|d| d.base + hwirq)
    }

    fn desc(&self, hirq: u32) -> Result<Arc<IrqDesc>> {
        self.descs
            .read()
            .unwrap()
            .get(&hirq)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("host IRQ {}", hirq)))
    }

    /// Attach a handler to `hirq` and unmask it.
    pub fn request_irq(&self, hirq: u32, name: &str, handler: IrqHandler) -> Result<()> {
        let desc = self.desc(hirq)?;
        let mut st = desc.state.lock().unwrap();
        if st.route.is_some() {
            return Err(Error::AlreadyExists(format!("host IRQ {} is routed", hirq)));
        }
        if st.actions.iter().any(|a| a.name == name) {
            return Err(Error::AlreadyExists(format!("handler {} on IRQ {}", name, hirq)));
        }
        st.actions.push(IrqAction {
            name: name.to_string(),
            handler,
        });
        if st.actions.len() == 1 {
            desc.chip().unmask(desc.hwirq);
        }
        Ok(())
    }

    pub fn free_irq(&self, hirq: u32, name: &str) -> Result<()> {
        let desc = self.desc(hirq)?;
        let mut st = desc.state.lock().unwrap();
        let before = st.actions.len();
        st.actions.retain(|a| a.name != name);
        if st.actions.len() == before {
            return Err(Error::NotFound(format!("handler {} on IRQ {}", name, hirq)));
        }
        if st.actions.is_empty() {
            desc.chip().mask(desc.hwirq);
        }
        Ok(())
    }

    pub fn set_type(&self, hirq: u32, ty: IrqType) -> Result<()> {
        let desc = self.desc(hirq)?;
        let mut st = desc.state.lock().unwrap();
        desc.chip().set_type(desc.hwirq, ty)?;
        st.irq_type = ty;
        Ok(())
    }

    pub fn set_affinity(&self, hirq: u32, cpus: CpuMask) -> Result<()> {
        let cpus = cpus.and(CpuMask::first_n(self.cpus));
        if cpus.is_empty() {
            return Err(Error::Invalid(format!("empty affinity for IRQ {}", hirq)));
        }
        let desc = self.desc(hirq)?;
        let mut st = desc.state.lock().unwrap();
        desc.chip().set_affinity(desc.hwirq, cpus)?;
        st.affinity = cpus;
        Ok(())
    }

    /// Banked lines are delivered on every CPU regardless of affinity.
    pub fn set_per_cpu(&self, hirq: u32, per_cpu: bool) -> Result<()> {
        self.desc(hirq)?.state.lock().unwrap().per_cpu = per_cpu;
        Ok(())
    }

    /// Pass `hirq` through to `line` of a guest's interrupt router.
    pub fn route_to_guest(
        &self,
        hirq: u32,
        guest: &str,
        router: &Arc<IrqRouter>,
        line: u32,
    ) -> Result<()> {
        let desc = self.desc(hirq)?;
        {
            let mut st = desc.state.lock().unwrap();
            if !st.actions.is_empty() || st.route.is_some() {
                return Err(Error::AlreadyExists(format!("host IRQ {} is in use", hirq)));
            }
            st.route = Some(GuestRoute {
                guest: guest.to_string(),
                router: Arc::downgrade(router),
                line,
            });
            st.routed = RoutedState::empty();
            desc.chip().set_routed_state(desc.hwirq, st.routed);
        }

        let fabric = self.weak_self.clone();
        let weak_desc = Arc::downgrade(&desc);
        router.add_eoi_listener(
            line,
            Arc::new(move |_line| {
                if let (Some(fabric), Some(desc)) = (fabric.upgrade(), weak_desc.upgrade()) {
                    fabric.guest_eoi(&desc);
                }
            }),
        );
        desc.chip().unmask(desc.hwirq);
        info!("host IRQ {} routed to {} line {}", hirq, guest, line);
        Ok(())
    }

    pub fn unroute(&self, hirq: u32) -> Result<()> {
        let desc = self.desc(hirq)?;
        let route = {
            let mut st = desc.state.lock().unwrap();
            let route = st
                .route
                .take()
                .ok_or_else(|| Error::NotFound(format!("route of host IRQ {}", hirq)))?;
            st.routed = RoutedState::empty();
            desc.chip().set_routed_state(desc.hwirq, st.routed);
            route
        };
        desc.chip().mask(desc.hwirq);
        if let Some(router) = route.router.upgrade() {
            router.clear_eoi_listeners(route.line);
            let _ = router.handle(None, route.line, None, false);
        }
        Ok(())
    }

    /// Drop every route into `guest`.
    pub fn unroute_guest(&self, guest: &str) -> usize {
        let routed: Vec<u32> = self
            .descs
            .read()
            .unwrap()
            .values()
            .filter(|d| {
                d.state
                    .lock()
                    .unwrap()
                    .route
                    .as_ref()
                    .is_some_and(|r| r.guest == guest)
            })
            .map(|d| d.hirq)
            .collect();
        for hirq in &routed {
            let _ = self.unroute(*hirq);
        }
        routed.len()
    }

    pub fn routed_state(&self, hirq: u32) -> Result<RoutedState> {
        Ok(self.desc(hirq)?.state.lock().unwrap().routed)
    }

    /// Deliver `hirq` on host CPU `cpu`.
    pub fn handle_irq(&self, hirq: u32, cpu: usize) -> Result<IrqReturn> {
        let desc = self.desc(hirq)?;
        let mut st = desc.state.lock().unwrap();
        if cpu >= st.counts.len() {
            return Err(Error::Invalid(format!("host CPU {}", cpu)));
        }
        if !st.per_cpu && !st.affinity.contains(cpu) {
            trace!("host IRQ {} taken on CPU {} outside its affinity", hirq, cpu);
        }
        st.counts[cpu] += 1;

        if let Some(route) = st.route.clone() {
            if st.routed.contains(RoutedState::ACTIVE) {
                // Latched until the guest is done with the previous one.
                st.routed |= RoutedState::PENDING;
                desc.chip().set_routed_state(desc.hwirq, st.routed);
                desc.chip().eoi(desc.hwirq);
                return Ok(IrqReturn::Handled);
            }
            st.routed |= RoutedState::ACTIVE | RoutedState::MASKED;
            desc.chip().mask(desc.hwirq);
            desc.chip().set_routed_state(desc.hwirq, st.routed);
            drop(st);

            desc.chip().eoi(desc.hwirq);
            return match route.router.upgrade() {
                Some(router) => {
                    router.handle(None, route.line, None, true)?;
                    Ok(IrqReturn::Handled)
                }
                None => Ok(IrqReturn::None),
            };
        }

        let handlers: Vec<IrqHandler> = st.actions.iter().map(|a| a.handler.clone()).collect();
        drop(st);

        let mut ret = IrqReturn::None;
        for handler in handlers {
            if handler(hirq, cpu) == IrqReturn::Handled {
                ret = IrqReturn::Handled;
            }
        }
        desc.chip().eoi(desc.hwirq);
        if ret == IrqReturn::None {
            debug!("spurious host IRQ {} on CPU {}", hirq, cpu);
        }
        Ok(ret)
    }

    fn guest_eoi(&self, desc: &Arc<IrqDesc>) {
        let (route, redeliver) = {
            let mut st = desc.state.lock().unwrap();
            let Some(route) = st.route.clone() else {
                return;
            };
            if !st.routed.contains(RoutedState::ACTIVE) {
                return;
            }
            let redeliver = st.routed.contains(RoutedState::PENDING);
            st.routed = RoutedState::empty();
            desc.chip().set_routed_state(desc.hwirq, st.routed);
            (route, redeliver)
        };

        if let Some(router) = route.router.upgrade() {
            let _ = router.handle(None, route.line, None, false);
        }
        desc.chip().unmask(desc.hwirq);
        if redeliver {
            let cpu = desc.state.lock().unwrap().affinity.first().unwrap_or(0);
            if let Err(e) = self.handle_irq(desc.hirq, cpu) {
                warn!("host IRQ {}: redelivery failed: {}", desc.hirq, e);
            }
        }
    }

    /// Chain `child` into `parent_hirq`: the parent's handler delivers every
    /// pending line of the child domain.
    pub fn cascade(&self, parent_hirq: u32, child: &str) -> Result<()> {
        let domain = self
            .domain(child)
            .ok_or_else(|| Error::NotFound(format!("IRQ domain {}", child)))?;
        let fabric = self.weak_self.clone();
        let weak_domain = Arc::downgrade(&domain);
        self.request_irq(
            parent_hirq,
            &format!("cascade:{}", child),
            Arc::new(move |_hirq, cpu| {
                let (Some(fabric), Some(domain)) = (fabric.upgrade(), weak_domain.upgrade())
                else {
                    return IrqReturn::None;
                };
                let mut ret = IrqReturn::None;
                for hwirq in domain.chip.pending() {
                    if hwirq >= domain.count {
                        continue;
                    }
                    match fabric.handle_irq(domain.base + hwirq, cpu) {
                        Ok(IrqReturn::Handled) => ret = IrqReturn::Handled,
                        Ok(IrqReturn::None) => {}
                        Err(e) => warn!("cascade {}: {}", domain.name, e),
                    }
                }
                ret
            }),
        )
    }

    pub fn count(&self, hirq: u32, cpu: usize) -> Result<u64> {
        let desc = self.desc(hirq)?;
        let st = desc.state.lock().unwrap();
        st.counts
            .get(cpu)
            .copied()
            .ok_or_else(|| Error::Invalid(format!("host CPU {}", cpu)))
    }

    pub fn list(&self) -> Vec<IrqInfo> {
        self.descs
            .read()
            .unwrap()
            .values()
            .filter_map(|desc| {
                let st = desc.state.lock().unwrap();
                if st.actions.is_empty() && st.route.is_none() {
                    return None;
                }
                Some(IrqInfo {
                    hirq: desc.hirq,
                    domain: desc.domain.name.clone(),
                    hwirq: desc.hwirq,
                    actions: st.actions.iter().map(|a| a.name.clone()).collect(),
                    routed_to: st.route.as_ref().map(|r| (r.guest.clone(), r.line)),
                    state: st.routed,
                    count: st.counts.iter().sum(),
                })
            })
            .collect()
    }
}
