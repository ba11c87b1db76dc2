/* Copyright (C) 2022 Antmicro
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     https://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

/* Intra-cluster router working data.
 *
 * One RouterData lives per cluster under construction. It tracks, per RR
 * node, the committed occupancy, congestion history and the mode pinned by
 * the placed PB tree, plus one IntraLbNet per atom net with at least one pin
 * inside the cluster. Atoms are registered as routing targets as they are
 * placed and deregistered on revert; the PathFinder loop itself lives in
 * `pathfinder.rs`.
 */

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::arch::{Arch, PbGraph, PbNodeId, PbPinId, PortDir, PortEquivalence};
use crate::netlist::{AtomBlockId, AtomNetId, AtomNetlist, AtomPinId, PinKind};
use crate::rr_graph::{LbRrGraph, LbRrGraphInfo};
#[allow(unused)]
use crate::log::*;

pub mod pathfinder;
#[cfg(test)]
mod tests;

pub const DRIVER_INDEX: usize = 0;

#[derive(Copy, Clone, Debug)]
pub struct RouterParams {
    pub max_iterations: usize,
    pub pres_fac: f32,
    pub pres_fac_mult: f32,
    pub hist_fac: f32,
}

impl Default for RouterParams {
    fn default() -> Self {
        RouterParams {
            max_iterations: 50,
            pres_fac: 2.,
            pres_fac_mult: 2.,
            hist_fac: 0.3,
        }
    }
}

#[derive(Copy, Clone, Default)]
pub struct LbRrNodeStats {
    pub occ: i32,
    pub historical_usage: i32,
    pub mode: usize,
}

#[derive(Copy, Clone)]
pub struct ExploredNode {
    pub explored_id: u64,
    pub enqueue_id: u64,
    pub enqueue_cost: f32,
    pub prev: Option<usize>,
    /* Net whose partial route tree this node belongs to. */
    pub inet: Option<usize>,
}

impl Default for ExploredNode {
    fn default() -> Self {
        ExploredNode {
            explored_id: 0,
            enqueue_id: 0,
            enqueue_cost: 0.,
            prev: None,
            inet: None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Expansion {
    pub node: usize,
    pub prev: Option<usize>,
    pub cost: f32,
}

/* BinaryHeap is a max-heap; reverse the cost comparison to pop cheapest. */
impl PartialEq for Expansion {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for Expansion {}

impl PartialOrd for Expansion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expansion {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
    }
}

#[derive(Clone, Debug)]
pub struct RouteTree {
    pub node: usize,
    pub branches: Vec<RouteTree>,
}

impl RouteTree {
    pub fn new(node: usize) -> Self {
        RouteTree {
            node,
            branches: Vec::new(),
        }
    }

    pub fn find_node(&mut self, node: usize) -> Option<&mut RouteTree> {
        if self.node == node {
            return Some(self);
        }
        for branch in self.branches.iter_mut() {
            if let Some(hit) = branch.find_node(node) {
                return Some(hit);
            }
        }
        None
    }

    pub fn contains(&self, node: usize) -> bool {
        self.node == node || self.branches.iter().any(|b| b.contains(node))
    }

    pub fn visit<F: FnMut(usize)>(&self, f: &mut F) {
        f(self.node);
        for branch in &self.branches {
            branch.visit(f);
        }
    }
}

pub struct IntraLbNet {
    pub net: AtomNetId,
    /* Index 0 is the driver; every entry must be resolved before routing. */
    pub terminals: Vec<Option<usize>>,
    pub atom_pins: Vec<Option<AtomPinId>>,
    /* Slot in `terminals` holding the boundary sink placeholder, if any. */
    pub external_sink_index: Option<usize>,
    pub route: Option<RouteTree>,
}

impl IntraLbNet {
    fn new(net: AtomNetId) -> Self {
        IntraLbNet {
            net,
            terminals: vec![None],
            atom_pins: vec![None],
            external_sink_index: None,
            route: None,
        }
    }

    fn num_internal_sinks(&self, graph: &LbRrGraph) -> usize {
        self.terminals
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(i, t)| {
                Some(*i) != self.external_sink_index
                    && t.map(|rr| !graph.is_external_node(rr)).unwrap_or(false)
            })
            .count()
    }

    fn has_internal_terminal(&self, graph: &LbRrGraph) -> bool {
        let driver_internal = self.terminals[DRIVER_INDEX]
            .map(|rr| !graph.is_external_node(rr))
            .unwrap_or(false);
        driver_internal || self.num_internal_sinks(graph) > 0
    }
}

pub struct SavedNet {
    pub net: AtomNetId,
    pub terminals: Vec<usize>,
    pub route: RouteTree,
}

/// pin_count_in_cluster -> the pin that drives it plus the atom net carried.
pub type PbRoute = HashMap<usize, PbRoutePin>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbRoutePin {
    pub driver_pin: Option<usize>,
    pub net: AtomNetId,
}

pub struct RouterData {
    pub params: RouterParams,
    pub stats: Vec<LbRrNodeStats>,
    pub explored: Vec<ExploredNode>,
    pub explore_id: u64,
    pub nets: Vec<IntraLbNet>,
    pub saved_nets: Option<Vec<SavedNet>>,
    pub pres_con_fac: f32,
    atoms_added: HashMap<AtomBlockId, PbNodeId>,
    atom_pin_pb_pin: HashMap<AtomPinId, PbPinId>,
    pub(crate) pq: BinaryHeap<Expansion>,
}

impl RouterData {
    pub fn new(num_rr_nodes: usize, params: RouterParams) -> Self {
        RouterData {
            params,
            stats: vec![LbRrNodeStats::default(); num_rr_nodes],
            explored: vec![ExploredNode::default(); num_rr_nodes],
            explore_id: 1,
            nets: Vec::new(),
            saved_nets: None,
            pres_con_fac: params.pres_fac,
            atoms_added: HashMap::new(),
            atom_pin_pb_pin: HashMap::new(),
            pq: BinaryHeap::new(),
        }
    }

    /// Pin or release the active mode of the RR nodes governed by a PB.
    /// Input and clock pins follow the PB's own mode; the output pins of the
    /// children placed under that mode follow it too.
    pub fn set_pb_modes(
        &mut self,
        arch: &Arch,
        pb_graph: &PbGraph,
        node_id: PbNodeId,
        mode: usize,
        set: bool,
    ) {
        let node = pb_graph.node(node_id);
        let value = if set { mode } else { 0 };

        for pin_id in pb_graph.node_pins(node_id) {
            if pb_graph.pin(pin_id).dir.is_input_side() {
                self.stats[pin_id.0].mode = value;
            }
        }

        if !arch.pb_type(node.pb_type).is_primitive() {
            for by_type in &node.children[mode] {
                for child in by_type {
                    for pin_id in pb_graph.node_pins(*child) {
                        if pb_graph.pin(pin_id).dir == PortDir::Output {
                            self.stats[pin_id.0].mode = value;
                        }
                    }
                }
            }
        }
    }

    /// Register a placed atom's pins as routing drivers/targets.
    pub fn add_atom(
        &mut self,
        graph: &LbRrGraph,
        info: &LbRrGraphInfo,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        blk: AtomBlockId,
        primitive: PbNodeId,
    ) {
        debug_assert!(
            !self.atoms_added.contains_key(&blk),
            "atom added twice to router"
        );
        self.atoms_added.insert(blk, primitive);

        for pin_id in netlist.block_pins(blk) {
            self.add_pin_to_terminals(graph, info, arch, pb_graph, netlist, pin_id, primitive);
        }

        self.fix_duplicate_equivalent_pins(graph, arch, pb_graph);
    }

    /// Remove a reverted atom's pins from the routing targets.
    pub fn remove_atom(
        &mut self,
        graph: &LbRrGraph,
        info: &LbRrGraphInfo,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        blk: AtomBlockId,
    ) {
        let primitive = match self.atoms_added.remove(&blk) {
            Some(p) => p,
            None => return,
        };
        for pin_id in netlist.block_pins(blk) {
            self.remove_pin_from_terminals(graph, info, arch, pb_graph, netlist, pin_id, primitive);
        }
    }

    fn placed_pb_pin(
        &self,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        pin_id: AtomPinId,
        primitive: PbNodeId,
    ) -> PbPinId {
        let port = netlist.port(netlist.pin(pin_id).port);
        pb_graph
            .primitive_pin(arch, primitive, &port.name, netlist.pin(pin_id).bit)
            .expect("placed atom pin must map onto its primitive")
    }

    fn find_create_net(&mut self, net: AtomNetId) -> usize {
        match self.nets.iter().position(|n| n.net == net) {
            Some(idx) => idx,
            None => {
                self.nets.push(IntraLbNet::new(net));
                self.nets.len() - 1
            }
        }
    }

    fn add_pin_to_terminals(
        &mut self,
        graph: &LbRrGraph,
        info: &LbRrGraphInfo,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        pin_id: AtomPinId,
        primitive: PbNodeId,
    ) {
        let net_id = netlist.pin_net(pin_id);
        let pb_pin = self.placed_pb_pin(arch, pb_graph, netlist, pin_id, primitive);
        self.atom_pin_pb_pin.insert(pin_id, pb_pin);

        let inet = self.find_create_net(net_id);
        let lb_net = &mut self.nets[inet];
        debug_assert_eq!(lb_net.terminals.len(), lb_net.atom_pins.len());

        match netlist.pin(pin_id).kind {
            PinKind::Driver => {
                let rr = graph.pin_source_rr(pb_pin);
                lb_net.terminals[DRIVER_INDEX] = Some(rr);
                lb_net.atom_pins[DRIVER_INDEX] = Some(pin_id);
            }
            PinKind::Sink => {
                let rr = graph.pin_sink_rr(pb_pin);
                let net_pin_count = 1 + netlist.net_sinks(net_id).len();
                if lb_net.terminals.len() == net_pin_count
                    && lb_net.external_sink_index.is_some()
                {
                    /* Last sink of the net moved inside: the net is fully
                     * absorbed, reuse the boundary placeholder slot. */
                    let slot = lb_net.external_sink_index.take().unwrap();
                    lb_net.terminals[slot] = Some(rr);
                    lb_net.atom_pins[slot] = Some(pin_id);
                } else {
                    lb_net.terminals.push(Some(rr));
                    lb_net.atom_pins.push(Some(pin_id));
                }
            }
        }

        self.update_required_external_connections(graph, info, netlist, inet);
    }

    fn remove_pin_from_terminals(
        &mut self,
        graph: &LbRrGraph,
        info: &LbRrGraphInfo,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        pin_id: AtomPinId,
        _primitive: PbNodeId,
    ) {
        let net_id = netlist.pin_net(pin_id);
        self.atom_pin_pb_pin.remove(&pin_id);

        let inet = match self.nets.iter().position(|n| n.net == net_id) {
            Some(i) => i,
            None => return,
        };

        {
            let lb_net = &mut self.nets[inet];
            match netlist.pin(pin_id).kind {
                PinKind::Driver => {
                    lb_net.terminals[DRIVER_INDEX] = None;
                    lb_net.atom_pins[DRIVER_INDEX] = None;
                }
                PinKind::Sink => {
                    let idx = lb_net
                        .atom_pins
                        .iter()
                        .position(|p| *p == Some(pin_id))
                        .expect("sink pin must be a terminal");
                    lb_net.terminals.remove(idx);
                    lb_net.atom_pins.remove(idx);
                    if let Some(ext) = lb_net.external_sink_index {
                        if ext > idx {
                            lb_net.external_sink_index = Some(ext - 1);
                        }
                    }
                }
            }
        }

        if !self.nets[inet].has_internal_terminal(graph) {
            /* No pin of this net remains inside the cluster. */
            self.nets.remove(inet);
            return;
        }

        self.update_required_external_connections(graph, info, netlist, inet);
    }

    /* Ensures a net has a boundary driver when its real driver lies outside
     * the cluster, and a boundary sink when some of its sinks do. */
    fn update_required_external_connections(
        &mut self,
        graph: &LbRrGraph,
        info: &LbRrGraphInfo,
        netlist: &AtomNetlist,
        inet: usize,
    ) {
        let lb_net = &mut self.nets[inet];

        if lb_net.terminals[DRIVER_INDEX].is_none() {
            let rr = external_source_for_net(lb_net, info);
            lb_net.terminals[DRIVER_INDEX] = Some(rr);
            lb_net.atom_pins[DRIVER_INDEX] = netlist.net_driver(lb_net.net);
        }

        let driver_rr = lb_net.terminals[DRIVER_INDEX].unwrap();
        let driver_internal = !graph.is_external_node(driver_rr);

        if !driver_internal {
            /* Whichever cluster holds the driver is responsible for reaching
             * the fabric; a stale boundary-sink placeholder would force this
             * net through ext_rr for nothing. */
            if let Some(slot) = lb_net.external_sink_index.take() {
                lb_net.terminals.remove(slot);
                lb_net.atom_pins.remove(slot);
            }
        }

        if driver_internal && lb_net.external_sink_index.is_none() {
            let total_sinks = netlist.net_sinks(lb_net.net).len();
            if lb_net.num_internal_sinks(graph) < total_sinks {
                if let Some(rr) = info
                    .external_sinks_reachable(driver_rr)
                    .iter()
                    .next()
                    .copied()
                {
                    lb_net.external_sink_index = Some(lb_net.terminals.len());
                    lb_net.terminals.push(Some(rr));
                    /* Stands for the whole set of outside sinks. */
                    lb_net.atom_pins.push(None);
                }
            }
        }
    }

    /* A net may hit several logically equivalent pins of one primitive; all
     * such terminals would collapse onto the shared sink and the router
     * would route only one of them. Remap all duplicates onto their explicit
     * pin nodes so each connection stays distinct in the final pin map. */
    fn fix_duplicate_equivalent_pins(
        &mut self,
        graph: &LbRrGraph,
        arch: &Arch,
        pb_graph: &PbGraph,
    ) {
        for lb_net in self.nets.iter_mut() {
            let mut by_target: HashMap<usize, Vec<usize>> = HashMap::new();
            for (iterm, terminal) in lb_net.terminals.iter().enumerate().skip(1) {
                if let Some(rr) = terminal {
                    by_target.entry(*rr).or_insert_with(Vec::new).push(iterm);
                }
            }

            for (target, terms) in by_target {
                if terms.len() < 2 {
                    continue;
                }
                for iterm in terms {
                    let atom_pin = match lb_net.atom_pins[iterm] {
                        Some(p) => p,
                        None => continue,
                    };
                    let pb_pin = self.atom_pin_pb_pin[&atom_pin];
                    if pb_graph.pin_port(arch, pb_pin).equivalence == PortEquivalence::None {
                        continue;
                    }

                    let pin_index = pb_graph.pin(pb_pin).pin_count_in_cluster;
                    dbg_log!(
                        DBG_WARN,
                        "Duplicate connections to equivalent sink {}; remapping terminal to pin {}",
                        target,
                        pin_index
                    );
                    debug_assert_eq!(graph.pin_sink_rr(pb_pin), target);
                    lb_net.terminals[iterm] = Some(pin_index);
                }
            }
        }
    }

    /// Collapse the saved routing into the pin-to-pin map the clustered
    /// netlist keeps after the router state is dropped.
    pub fn saved_pb_route(&self, total_pb_pins: usize) -> PbRoute {
        let mut pb_route = PbRoute::new();
        if let Some(saved) = &self.saved_nets {
            for net in saved {
                load_trace_to_pb_route(&mut pb_route, total_pb_pins, net.net, None, &net.route);
            }
        }
        pb_route
    }
}

fn load_trace_to_pb_route(
    pb_route: &mut PbRoute,
    total_pins: usize,
    net: AtomNetId,
    prev_pin: Option<usize>,
    trace: &RouteTree,
) {
    let cur_pin = (trace.node < total_pins).then(|| trace.node);
    if let Some(pin) = cur_pin {
        let entry = pb_route.entry(pin).or_insert(PbRoutePin {
            driver_pin: prev_pin,
            net,
        });
        debug_assert_eq!(entry.net, net);
    }
    for branch in &trace.branches {
        load_trace_to_pb_route(
            pb_route,
            total_pins,
            net,
            cur_pin.or(prev_pin),
            branch,
        );
    }
}

fn external_source_for_net(lb_net: &IntraLbNet, info: &LbRrGraphInfo) -> usize {
    /* Pick a boundary source able to reach every internal sink: the
     * intersection of the per-sink reaching sets. */
    let mut candidates: Option<std::collections::BTreeSet<usize>> = None;
    for terminal in lb_net.terminals.iter().skip(1).flatten() {
        let reaching = info.external_sources_reaching(*terminal);
        candidates = Some(match candidates {
            None => reaching.clone(),
            Some(acc) => acc.intersection(reaching).copied().collect(),
        });
    }
    let candidates = candidates.expect("net with external driver must have a sink");
    *candidates
        .iter()
        .next()
        .expect("no external source reaches every sink of the net")
}
