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

/* Cluster legalizer: owns the clusters under construction and proves, for
 * every candidate molecule, that a legal assignment of its atoms onto free
 * primitive sites exists — growing the PB instance tree speculatively,
 * filtering on floorplan / NoC / pin budgets, asking the intra-cluster
 * router for a full legality proof, and unwinding every speculative change
 * when a trial fails.
 */

use std::collections::HashMap;

use replace_with::replace_with_or_abort;

use crate::arch::{Arch, BlockTypeId, PbClass, PbGraph, PbNodeId};
use crate::common::scale_class_size;
use crate::errors::{BlockPackStatus, PackError};
use crate::floorplan::{FloorplanConstraints, NocGroupId, PartitionRegion};
use crate::molecule::{MoleculeId, MoleculeStore};
use crate::netlist::{AtomBlockId, AtomNetId, AtomNetlist, AtomPinId, PinKind};
use crate::placement::PlacementStats;
use crate::router::pathfinder::RouteResult;
use crate::router::{PbRoute, RouterData, RouterParams};
use crate::rr_graph::{LbRrGraph, LbRrGraphInfo};
#[allow(unused)]
use crate::log::*;

#[cfg(test)]
mod tests;

/* Bounded priority array of gain candidates per open cluster. */
pub const MAX_FEASIBLE_BLOCK_ARRAY_SIZE: usize = 30;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ClusterId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PbId(pub usize);

/// Gain bookkeeping of a composite PB under construction. Dropped when the
/// cluster is finalized.
pub struct PbStats {
    pub num_child_blocks_in_pb: usize,

    /* Committed external pin usage per pin class: slot -> net. */
    pub input_pins_used: Vec<HashMap<usize, AtomNetId>>,
    pub output_pins_used: Vec<HashMap<usize, AtomNetId>>,
    /* Speculative versions, regenerated before every feasibility check. */
    pub lookahead_input_pins_used: Vec<Vec<AtomNetId>>,
    pub lookahead_output_pins_used: Vec<Vec<AtomNetId>>,

    pub num_pins_of_net_in_pb: HashMap<AtomNetId, usize>,
    pub marked_nets: Vec<AtomNetId>,
    pub marked_blocks: Vec<AtomBlockId>,
    pub tie_break_high_fanout_net: Option<AtomNetId>,

    pub gain: HashMap<AtomBlockId, f32>,
    pub timing_gain: HashMap<AtomBlockId, f32>,
    pub connection_gain: HashMap<AtomBlockId, f32>,
    pub sharing_gain: HashMap<AtomBlockId, f32>,
    pub hill_gain: HashMap<AtomBlockId, f32>,

    /* None marks a stale candidate list that must be rebuilt. */
    pub num_feasible_blocks: Option<usize>,
    pub feasible_blocks: Vec<MoleculeId>,

    pub atom_failures: HashMap<AtomBlockId, usize>,
    pub explore_transitive_fanout: bool,
    pub transitive_fanout_candidates: Option<Vec<MoleculeId>>,
}

impl PbStats {
    fn new(num_input_classes: usize, num_output_classes: usize) -> Self {
        PbStats {
            num_child_blocks_in_pb: 0,
            input_pins_used: vec![HashMap::new(); num_input_classes],
            output_pins_used: vec![HashMap::new(); num_output_classes],
            lookahead_input_pins_used: vec![Vec::new(); num_input_classes],
            lookahead_output_pins_used: vec![Vec::new(); num_output_classes],
            num_pins_of_net_in_pb: HashMap::new(),
            marked_nets: Vec::new(),
            marked_blocks: Vec::new(),
            tie_break_high_fanout_net: None,
            gain: HashMap::new(),
            timing_gain: HashMap::new(),
            connection_gain: HashMap::new(),
            sharing_gain: HashMap::new(),
            hill_gain: HashMap::new(),
            num_feasible_blocks: None,
            feasible_blocks: vec![MoleculeId(usize::MAX); MAX_FEASIBLE_BLOCK_ARRAY_SIZE],
            atom_failures: HashMap::new(),
            explore_transitive_fanout: true,
            transitive_fanout_candidates: None,
        }
    }
}

/// One node of the per-cluster PB instance tree. Children are allocated as a
/// whole level the first time an atom claims a site under the node, which
/// also pins the node's mode.
pub struct Pb {
    pub graph_node: PbNodeId,
    pub parent: Option<PbId>,
    pub mode: usize,
    pub name: Option<String>,
    /* children[child_type][instance] under the active mode */
    pub children: Option<Vec<Vec<PbId>>>,
    pub atom: Option<AtomBlockId>,
    pub stats: Option<PbStats>,
}

impl Pb {
    pub fn is_live(&self) -> bool {
        self.name.is_some() || self.atom.is_some()
    }
}

pub struct Cluster {
    pub block_type: BlockTypeId,
    pub mode: usize,
    pub name: String,
    pub pbs: Vec<Pb>,
    pub pb_of_node: HashMap<PbNodeId, PbId>,
    pub region: PartitionRegion,
    pub noc_group: Option<NocGroupId>,
    pub molecules: Vec<MoleculeId>,
    pub router: Option<RouterData>,
    pub pb_route: PbRoute,
}

pub const ROOT_PB: PbId = PbId(0);

impl Cluster {
    fn new(
        pb_graph: &PbGraph,
        block_type: BlockTypeId,
        mode: usize,
        router: RouterData,
    ) -> Self {
        let root_node = pb_graph.node(pb_graph.root);
        let mut cluster = Cluster {
            block_type,
            mode,
            name: String::new(),
            pbs: Vec::new(),
            pb_of_node: HashMap::new(),
            region: PartitionRegion::new(),
            noc_group: None,
            molecules: Vec::new(),
            router: Some(router),
            pb_route: PbRoute::new(),
        };
        cluster.pbs.push(Pb {
            graph_node: pb_graph.root,
            parent: None,
            mode,
            name: None,
            children: None,
            atom: None,
            stats: Some(PbStats::new(
                root_node.input_pin_classes.len(),
                root_node.output_pin_classes.len(),
            )),
        });
        cluster.pb_of_node.insert(pb_graph.root, ROOT_PB);
        cluster
    }

    pub fn pb(&self, id: PbId) -> &Pb {
        &self.pbs[id.0]
    }

    pub fn pb_mut(&mut self, id: PbId) -> &mut Pb {
        &mut self.pbs[id.0]
    }

    pub fn root_stats(&self) -> &PbStats {
        self.pbs[ROOT_PB.0].stats.as_ref().unwrap()
    }

    pub fn root_stats_mut(&mut self) -> &mut PbStats {
        self.pbs[ROOT_PB.0].stats.as_mut().unwrap()
    }

    pub fn atoms<'a>(&'a self) -> impl Iterator<Item = AtomBlockId> + 'a {
        self.pbs.iter().filter_map(|pb| pb.atom)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LegalizationStrategy {
    /// Trust the pin counting filters; route once when the cluster closes.
    SkipIntraLbRoute,
    /// Fully route after every molecule.
    Full,
}

#[derive(Clone)]
pub struct LegalizerOpts {
    /// Per block-type-name (input, output) external pin utilization targets.
    pub target_pin_util: HashMap<String, (f32, f32)>,
    pub enable_pin_feasibility_filter: bool,
    pub router_params: RouterParams,
    pub log_verbosity: usize,
}

impl Default for LegalizerOpts {
    fn default() -> Self {
        LegalizerOpts {
            target_pin_util: HashMap::new(),
            enable_pin_feasibility_filter: true,
            router_params: RouterParams::default(),
            log_verbosity: 0,
        }
    }
}

pub const FULL_EXTERNAL_PIN_UTIL: (f32, f32) = (1., 1.);

pub struct ClusterLegalizer<'a> {
    pub arch: &'a Arch,
    pub netlist: &'a AtomNetlist,
    pub pb_graphs: &'a [PbGraph],
    pub rr_graphs: &'a [LbRrGraph],
    pub rr_infos: &'a [LbRrGraphInfo],
    pub floorplan: &'a FloorplanConstraints,
    pub atom_noc_group: Vec<Option<NocGroupId>>,
    pub opts: LegalizerOpts,
    pub strategy: LegalizationStrategy,

    pub placement_stats: Vec<PlacementStats>,
    pub clusters: Vec<Option<Cluster>>,
    pub atom_cluster: Vec<Option<ClusterId>>,
    pub atom_pb: Vec<Option<(ClusterId, PbId)>>,
    pub molecule_cluster: HashMap<MoleculeId, ClusterId>,
}

impl<'a> ClusterLegalizer<'a> {
    pub fn new(
        arch: &'a Arch,
        netlist: &'a AtomNetlist,
        pb_graphs: &'a [PbGraph],
        rr_graphs: &'a [LbRrGraph],
        rr_infos: &'a [LbRrGraphInfo],
        floorplan: &'a FloorplanConstraints,
        atom_noc_group: Vec<Option<NocGroupId>>,
        opts: LegalizerOpts,
        strategy: LegalizationStrategy,
    ) -> Self {
        let placement_stats = pb_graphs
            .iter()
            .map(|g| PlacementStats::new(arch, g))
            .collect();
        ClusterLegalizer {
            arch,
            netlist,
            pb_graphs,
            rr_graphs,
            rr_infos,
            floorplan,
            atom_noc_group,
            opts,
            strategy,
            placement_stats,
            clusters: Vec::new(),
            atom_cluster: vec![None; netlist.blocks.len()],
            atom_pb: vec![None; netlist.blocks.len()],
            molecule_cluster: HashMap::new(),
        }
    }

    pub fn cluster(&self, id: ClusterId) -> &Cluster {
        self.clusters[id.0].as_ref().expect("live cluster")
    }

    pub fn cluster_mut(&mut self, id: ClusterId) -> &mut Cluster {
        self.clusters[id.0].as_mut().expect("live cluster")
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| ClusterId(i))
    }

    pub fn target_pin_util(&self, block_type: BlockTypeId) -> (f32, f32) {
        let name = &self.arch.block_type(block_type).name;
        self.opts
            .target_pin_util
            .get(name)
            .copied()
            .unwrap_or(FULL_EXTERNAL_PIN_UTIL)
    }

    /// Open a new cluster of the given type and mode seeded with `molecule`.
    /// The seed packs against full pin utilization so that even a molecule
    /// needing every cluster pin can open one.
    pub fn start_new_cluster(
        &mut self,
        store: &mut MoleculeStore,
        molecule: MoleculeId,
        block_type: BlockTypeId,
        mode: usize,
    ) -> (BlockPackStatus, Option<ClusterId>) {
        let type_idx = block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];
        let router = RouterData::new(
            self.rr_graphs[type_idx].nodes.len(),
            self.opts.router_params,
        );

        self.placement_stats[type_idx].reset();
        self.placement_stats[type_idx].set_root_mode(self.arch, pb_graph, mode);

        let cluster = Cluster::new(pb_graph, block_type, mode, router);
        let id = ClusterId(self.clusters.len());
        self.clusters.push(Some(cluster));

        let status = self.try_pack_molecule(store, molecule, id, FULL_EXTERNAL_PIN_UTIL);
        if status.passed() {
            let root_atom = store.molecule(molecule).root_atom();
            let name = self.netlist.block(root_atom).name.clone();
            self.cluster_mut(id).name = name;
            self.molecule_cluster.insert(molecule, id);
            (status, Some(id))
        } else {
            self.clusters.pop();
            (status, None)
        }
    }

    /// Add a molecule to an existing cluster under the type's configured
    /// external pin utilization target.
    pub fn add_mol_to_cluster(
        &mut self,
        store: &mut MoleculeStore,
        molecule: MoleculeId,
        id: ClusterId,
    ) -> BlockPackStatus {
        let target = self.target_pin_util(self.cluster(id).block_type);
        let status = self.try_pack_molecule(store, molecule, id, target);
        if status.passed() {
            self.molecule_cluster.insert(molecule, id);
        }
        status
    }

    /// The critical path: speculatively place every atom of the molecule,
    /// filter, optionally route, and either commit everything or roll all of
    /// it back.
    pub fn try_pack_molecule(
        &mut self,
        store: &mut MoleculeStore,
        molecule: MoleculeId,
        id: ClusterId,
        max_ext_pin_util: (f32, f32),
    ) -> BlockPackStatus {
        let type_idx = self.cluster(id).block_type.0;

        /* Only one long chain per cluster; more would over-constrain the
         * later placement macros. */
        if self.placement_stats[type_idx].has_long_chain
            && store.molecule(molecule).is_chain()
            && store.molecule(molecule).is_long_chain()
        {
            dbg_log!(DBG_EXTRA1, "FAILED placement filter: second long chain");
            self.record_molecule_failure(store, molecule, id);
            return BlockPackStatus::FailedFeasible;
        }

        /* Floorplan: the molecule must intersect the cluster's region. */
        let mut new_region = self.cluster(id).region.clone();
        let mut region_needs_update = false;
        for atom in store.molecule(molecule).atom_ids() {
            if !check_cluster_floorplanning(
                self.floorplan,
                atom,
                &mut new_region,
                &mut region_needs_update,
            ) {
                self.record_molecule_failure(store, molecule, id);
                return BlockPackStatus::FailedFloorplan;
            }
        }

        /* NoC grouping: atoms from different NoC groups never share one
         * cluster. */
        let mut new_noc_group = self.cluster(id).noc_group;
        for atom in store.molecule(molecule).atom_ids() {
            let atom_group = self.atom_noc_group.get(atom.0).copied().flatten();
            match (new_noc_group, atom_group) {
                (Some(c), Some(a)) if c != a => {
                    self.record_molecule_failure(store, molecule, id);
                    return BlockPackStatus::FailedNocGroup;
                }
                (None, Some(a)) => new_noc_group = Some(a),
                _ => {}
            }
        }

        let mol_size = store.molecule(molecule).atoms.len();
        let mut status = BlockPackStatus::Undefined;

        while !status.passed() {
            let sites = self.placement_stats[type_idx].get_next_primitive_list(
                self.arch,
                &self.pb_graphs[type_idx],
                self.netlist,
                store,
                molecule,
            );
            let sites = match sites {
                Some(s) => s,
                None => {
                    dbg_log!(DBG_EXTRA1, "FAILED no candidate primitives available");
                    self.record_molecule_failure(store, molecule, id);
                    return BlockPackStatus::FailedFeasible;
                }
            };

            status = BlockPackStatus::Passed;
            let mut failed_location = 0;
            for imol in 0..mol_size {
                let atom = match store.molecule(molecule).atoms[imol] {
                    Some(a) => a,
                    None => continue,
                };
                failed_location = imol + 1;
                let site = sites[imol].expect("placed molecule block must have a site");
                status = self.try_place_atom_block_rec(store, id, molecule, site, atom);
                if !status.passed() {
                    break;
                }
            }

            if self.opts.enable_pin_feasibility_filter && status.passed() {
                if !self.check_pin_feasibility(id, max_ext_pin_util) {
                    dbg_log!(DBG_EXTRA1, "FAILED pin feasibility filter");
                    status = BlockPackStatus::FailedFeasible;
                }
            }

            if status.passed() && self.strategy == LegalizationStrategy::Full {
                let cluster = self.clusters[id.0].as_mut().unwrap();
                let router = cluster.router.as_mut().unwrap();
                match router.try_route(&self.rr_graphs[type_idx], self.netlist) {
                    RouteResult::Routed => {}
                    RouteResult::ModeConflict { rr_node } => {
                        /* The pinned modes blocked the route; rejecting the
                         * placement sends us back to the enumerator, which
                         * proposes sites under other modes. */
                        dbg_log!(
                            DBG_EXTRA1,
                            "FAILED detailed routing: mode conflict at rr node {}",
                            rr_node
                        );
                        status = BlockPackStatus::FailedRoute;
                    }
                    RouteResult::Infeasible { .. } => {
                        dbg_log!(DBG_EXTRA1, "FAILED detailed routing legality");
                        status = BlockPackStatus::FailedRoute;
                    }
                }
            }

            if status.passed() {
                self.commit_molecule(
                    store,
                    molecule,
                    id,
                    &sites,
                    new_region.clone(),
                    region_needs_update,
                    new_noc_group,
                );
                return BlockPackStatus::Passed;
            }

            /* Unwind the speculative placement. */
            for imol in 0..failed_location {
                if let Some(atom) = store.molecule(molecule).atoms[imol] {
                    let cluster = self.clusters[id.0].as_mut().unwrap();
                    if let Some(router) = cluster.router.as_mut() {
                        router.remove_atom(
                            &self.rr_graphs[type_idx],
                            &self.rr_infos[type_idx],
                            self.arch,
                            &self.pb_graphs[type_idx],
                            self.netlist,
                            atom,
                        );
                    }
                }
            }
            for imol in 0..failed_location {
                if let Some(atom) = store.molecule(molecule).atoms[imol] {
                    self.revert_place_atom_block(store, atom);
                }
            }
            self.record_molecule_failure(store, molecule, id);
            self.cleanup_pb(id, ROOT_PB);
        }

        status
    }

    /* Walks up from the target primitive, lazily allocating and mode-locking
     * the parent PBs, then binds the atom to the primitive PB. */
    fn try_place_atom_block_rec(
        &mut self,
        store: &MoleculeStore,
        id: ClusterId,
        molecule: MoleculeId,
        site: PbNodeId,
        atom: AtomBlockId,
    ) -> BlockPackStatus {
        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];

        let pb_id = match self.ensure_pb(id, site, atom) {
            Ok(pb) => pb,
            Err(status) => return status,
        };

        debug_assert!(self.cluster(id).pb(pb_id).atom.is_none());
        debug_assert!(self.atom_pb[atom.0].is_none());
        debug_assert!(self.atom_cluster[atom.0].is_none());

        {
            let name = self.netlist.block(atom).name.clone();
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let pb = cluster.pb_mut(pb_id);
            pb.name = Some(name);
            pb.atom = Some(atom);
        }
        self.atom_pb[atom.0] = Some((id, pb_id));
        self.atom_cluster[atom.0] = Some(id);

        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let router = cluster.router.as_mut().unwrap();
            router.add_atom(
                &self.rr_graphs[type_idx],
                &self.rr_infos[type_idx],
                self.arch,
                pb_graph,
                self.netlist,
                atom,
                site,
            );
        }

        let mut status = BlockPackStatus::Passed;
        if !self.primitive_feasible(id, pb_id, atom) {
            status = BlockPackStatus::FailedFeasible;
        }

        /* A chain molecule's root may only land on a legal tie-off site. */
        if status.passed()
            && store.molecule(molecule).is_chain()
            && atom == store.molecule(molecule).root_atom()
        {
            status = self.check_chain_root_placement(store, molecule, id, site);
        }

        if !status.passed() {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            cluster.pb_mut(pb_id).name = None;
        }
        status
    }

    /* Find or create the PB for a pb-graph node; the whole ancestor chain is
     * created on demand and each parent's mode is pinned on first use. */
    fn ensure_pb(
        &mut self,
        id: ClusterId,
        node: PbNodeId,
        atom: AtomBlockId,
    ) -> Result<PbId, BlockPackStatus> {
        if let Some(pb_id) = self.cluster(id).pb_of_node.get(&node).copied() {
            return Ok(pb_id);
        }

        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];
        let graph_node = pb_graph.node(node);
        let parent_node = graph_node
            .parent
            .expect("the root PB always exists");

        let parent_pb_id = self.ensure_pb(id, parent_node, atom)?;
        let required_mode = graph_node.parent_mode;

        if self.cluster(id).pb(parent_pb_id).children.is_none() {
            let name = self.netlist.block(atom).name.clone();
            self.allocate_children(id, parent_pb_id, required_mode, name);
        } else if self.cluster(id).pb(parent_pb_id).mode != required_mode {
            /* Another atom already locked the parent into a different mode. */
            return Err(BlockPackStatus::FailedFeasible);
        }

        Ok(self.cluster(id).pb_of_node[&node])
    }

    fn allocate_children(&mut self, id: ClusterId, parent: PbId, mode: usize, name: String) {
        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];
        let parent_node_id = self.cluster(id).pb(parent).graph_node;

        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let parent_pb = cluster.pb_mut(parent);
            parent_pb.mode = mode;
            if parent_pb.name.is_none() {
                parent_pb.name = Some(name);
            }
        }

        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let router = cluster.router.as_mut().unwrap();
            router.set_pb_modes(self.arch, pb_graph, parent_node_id, mode, true);
        }

        let child_nodes: Vec<Vec<PbNodeId>> = pb_graph.node(parent_node_id).children[mode]
            .iter()
            .map(|instances| instances.clone())
            .collect();

        let cluster = self.clusters[id.0].as_mut().unwrap();
        let mut children = Vec::with_capacity(child_nodes.len());
        for instances in child_nodes {
            let mut pbs = Vec::with_capacity(instances.len());
            for child_node in instances {
                let child_graph_node = pb_graph.node(child_node);
                let stats = if self.arch.pb_type(child_graph_node.pb_type).is_primitive() {
                    None
                } else {
                    Some(PbStats::new(
                        child_graph_node.input_pin_classes.len(),
                        child_graph_node.output_pin_classes.len(),
                    ))
                };
                let pb_id = PbId(cluster.pbs.len());
                cluster.pbs.push(Pb {
                    graph_node: child_node,
                    parent: Some(parent),
                    mode: 0,
                    name: None,
                    children: None,
                    atom: None,
                    stats,
                });
                cluster.pb_of_node.insert(child_node, pb_id);
                pbs.push(pb_id);
            }
            children.push(pbs);
        }
        cluster.pb_mut(parent).children = Some(children);
    }

    /* Primitive-level feasibility: free site, memory-sibling net equality,
     * then the generic model/port type check. */
    fn primitive_feasible(&self, id: ClusterId, pb_id: PbId, atom: AtomBlockId) -> bool {
        let cluster = self.cluster(id);
        let pb = cluster.pb(pb_id);
        let type_idx = cluster.block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];
        let pb_type_id = pb_graph.node(pb.graph_node).pb_type;

        if let Some(existing) = pb.atom {
            if existing != atom {
                return false;
            }
        }

        if self.arch.pb_type(pb_type_id).class == PbClass::Memory {
            if let Some(sibling) = self.find_memory_sibling(id, pb_id) {
                if !self.memory_sibling_feasible(atom, pb_type_id, sibling) {
                    return false;
                }
            }
        }

        self.netlist.primitive_type_feasible(atom, self.arch, pb_type_id)
    }

    fn find_memory_sibling(&self, id: ClusterId, pb_id: PbId) -> Option<AtomBlockId> {
        let cluster = self.cluster(id);
        let parent = cluster.pb(pb_id).parent?;
        let children = cluster.pb(parent).children.as_ref()?;
        children
            .iter()
            .flat_map(|instances| instances.iter())
            .filter(|sib| **sib != pb_id)
            .find_map(|sib| cluster.pb(*sib).atom)
    }

    /* Memory slices under one parent must expose identical nets on every
     * non-data port, open bits included. */
    fn memory_sibling_feasible(
        &self,
        atom: AtomBlockId,
        pb_type_id: crate::arch::PbTypeId,
        sibling: AtomBlockId,
    ) -> bool {
        let pb_type = self.arch.pb_type(pb_type_id);
        for port in &pb_type.ports {
            if port.is_data() {
                continue;
            }
            for bit in 0..port.width {
                if self.atom_port_net(atom, &port.name, bit)
                    != self.atom_port_net(sibling, &port.name, bit)
                {
                    return false;
                }
            }
        }
        true
    }

    fn atom_port_net(&self, atom: AtomBlockId, port: &str, bit: usize) -> Option<AtomNetId> {
        self.netlist
            .block(atom)
            .ports
            .iter()
            .map(|p| self.netlist.port(*p))
            .find(|p| p.name == port)
            .and_then(|p| {
                p.pins
                    .iter()
                    .find(|pin| self.netlist.pin(**pin).bit == bit)
                    .map(|pin| self.netlist.pin_net(*pin))
            })
    }

    fn check_chain_root_placement(
        &self,
        store: &MoleculeStore,
        molecule: MoleculeId,
        id: ClusterId,
        site: PbNodeId,
    ) -> BlockPackStatus {
        let mol = store.molecule(molecule);
        let pattern = match &mol.pattern {
            Some(p) => p,
            None => return BlockPackStatus::Passed,
        };
        let pb_graph = &self.pb_graphs[self.cluster(id).block_type.0];
        let chain_roots = pb_graph.pattern_chain_roots(self.arch, &pattern.name);

        let is_long = mol.is_long_chain();
        let root_atom = mol.root_atom();

        /* The chain entry net: if driven, the root must sit at a tie-off. */
        let chain_net = chain_roots.first().and_then(|pin| {
            let port = &pb_graph.pin_port(self.arch, *pin).name;
            self.atom_port_net(root_atom, port, pb_graph.pin(*pin).pin_number)
        });

        if !is_long && chain_net.is_none() {
            return BlockPackStatus::Passed;
        }

        match store.chain_id(molecule) {
            Some(chain_id) => {
                /* Later links of a placed long chain must continue at the
                 * same chain position. */
                let ok = chain_roots
                    .get(chain_id)
                    .map(|pin| pb_graph.pin(*pin).node == site)
                    .unwrap_or(false);
                if ok {
                    BlockPackStatus::Passed
                } else {
                    BlockPackStatus::FailedFeasible
                }
            }
            None => {
                let ok = chain_roots
                    .iter()
                    .any(|pin| pb_graph.pin(*pin).node == site);
                if ok {
                    BlockPackStatus::Passed
                } else {
                    BlockPackStatus::FailedFeasible
                }
            }
        }
    }

    fn check_pin_feasibility(&mut self, id: ClusterId, max_ext_pin_util: (f32, f32)) -> bool {
        self.reset_lookahead_pins_used(id, ROOT_PB);
        self.update_lookahead_pins_used(id, ROOT_PB);
        self.check_lookahead_pins_used(id, ROOT_PB, max_ext_pin_util)
    }

    fn reset_lookahead_pins_used(&mut self, id: ClusterId, pb_id: PbId) {
        let children = {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let pb = cluster.pb_mut(pb_id);
            if let Some(stats) = pb.stats.as_mut() {
                for pins in stats.lookahead_input_pins_used.iter_mut() {
                    pins.clear();
                }
                for pins in stats.lookahead_output_pins_used.iter_mut() {
                    pins.clear();
                }
            }
            pb.children.clone()
        };
        if let Some(children) = children {
            for instances in children {
                for child in instances {
                    self.reset_lookahead_pins_used(id, child);
                }
            }
        }
    }

    fn update_lookahead_pins_used(&mut self, id: ClusterId, pb_id: PbId) {
        let (atom, children) = {
            let cluster = self.cluster(id);
            let pb = cluster.pb(pb_id);
            (pb.atom, pb.children.clone())
        };

        match children {
            Some(children) => {
                for instances in children {
                    for child in instances {
                        self.update_lookahead_pins_used(id, child);
                    }
                }
            }
            None => {
                if let Some(atom) = atom {
                    self.mark_lookahead_pins_for_atom(id, pb_id, atom);
                }
            }
        }
    }

    /* For every pin of the placed atom decide, per ancestor, whether the
     * connection must leave that ancestor; if so the pin's class at the
     * ancestor gains one speculative pin. */
    fn mark_lookahead_pins_for_atom(&mut self, id: ClusterId, pb_id: PbId, atom: AtomBlockId) {
        let pins: Vec<AtomPinId> = self.netlist.block_pins(atom).collect();
        for pin in pins {
            self.mark_lookahead_pins_for_pin(id, pb_id, atom, pin);
        }
    }

    fn mark_lookahead_pins_for_pin(
        &mut self,
        id: ClusterId,
        pb_id: PbId,
        atom: AtomBlockId,
        pin: AtomPinId,
    ) {
        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];

        let site = self.cluster(id).pb(pb_id).graph_node;
        let port = self.netlist.port(self.netlist.pin(pin).port);
        let pb_pin = pb_graph
            .primitive_pin(self.arch, site, &port.name, self.netlist.pin(pin).bit)
            .expect("placed pin resolves");
        let net = self.netlist.pin_net(pin);
        let is_input = self.netlist.pin(pin).kind == PinKind::Sink;

        let mut cur = self.cluster(id).pb(pb_id).parent;
        while let Some(cur_pb_id) = cur {
            let cur_node = self.cluster(id).pb(cur_pb_id).graph_node;
            let depth = pb_graph.node(cur_node).depth;
            let pin_class = pb_graph.pin(pb_pin).parent_pin_class[depth]
                .expect("ancestor pin class resolved");

            if is_input {
                let reachable = self.driver_reaches_pin(id, net, pb_pin, cur_pb_id, depth);
                if !reachable {
                    let cluster = self.clusters[id.0].as_mut().unwrap();
                    let stats = cluster.pb_mut(cur_pb_id).stats.as_mut().unwrap();
                    let used = &mut stats.lookahead_input_pins_used[pin_class];
                    if !used.contains(&net) {
                        used.push(net);
                    }
                }
            } else {
                let exits = self.net_exits_ancestor(id, net, pb_pin, depth);
                if exits {
                    let cluster = self.clusters[id.0].as_mut().unwrap();
                    let stats = cluster.pb_mut(cur_pb_id).stats.as_mut().unwrap();
                    stats.lookahead_output_pins_used[pin_class].push(net);
                }
            }

            cur = self.cluster(id).pb(cur_pb_id).parent;
        }
    }

    /* Can the net's driver feed this input pin without leaving the ancestor? */
    fn driver_reaches_pin(
        &self,
        id: ClusterId,
        net: AtomNetId,
        pb_pin: crate::arch::PbPinId,
        ancestor: PbId,
        depth: usize,
    ) -> bool {
        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];

        let driver_blk = match self.netlist.net_driver_block(net) {
            Some(b) => b,
            None => return false,
        };
        let driver_pb = match self.atom_pb[driver_blk.0] {
            Some((cid, pb)) if cid == id => pb,
            _ => return false,
        };

        /* The driver must itself sit under the ancestor... */
        let mut check = Some(driver_pb);
        let mut under = false;
        while let Some(pb) = check {
            if pb == ancestor {
                under = true;
                break;
            }
            check = self.cluster(id).pb(pb).parent;
        }
        if !under {
            return false;
        }

        /* ...and its output pin must reach this pin inside it. */
        let driver_pin = match self.netlist.net_driver(net) {
            Some(p) => p,
            None => return false,
        };
        let driver_port = self.netlist.port(self.netlist.pin(driver_pin).port);
        let driver_site = self.cluster(id).pb(driver_pb).graph_node;
        let driver_pb_pin = match pb_graph.primitive_pin(
            self.arch,
            driver_site,
            &driver_port.name,
            self.netlist.pin(driver_pin).bit,
        ) {
            Some(p) => p,
            None => return false,
        };

        pb_graph
            .pin(driver_pb_pin)
            .connectable_input_pins
            .get(depth)
            .map(|pins| pins.contains(&pb_pin))
            .unwrap_or(false)
    }

    /* Does this driven net have to leave the ancestor at the given depth? */
    fn net_exits_ancestor(
        &self,
        id: ClusterId,
        net: AtomNetId,
        driver_pb_pin: crate::arch::PbPinId,
        depth: usize,
    ) -> bool {
        let type_idx = self.cluster(id).block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];

        let sinks = self.netlist.net_sinks(net);
        let connectable = match pb_graph.pin(driver_pb_pin).connectable_input_pins.get(depth) {
            Some(pins) => pins,
            None => return true,
        };
        if connectable.len() < sinks.len() {
            return true;
        }

        /* All sinks must be placed in this cluster... */
        for sink in sinks {
            let sink_blk = self.netlist.pin_block(*sink);
            match self.atom_cluster[sink_blk.0] {
                Some(cid) if cid == id => {}
                _ => return true,
            }
        }

        /* ...and each must be reachable from the driver pin. */
        let mut reachable = 0;
        for sink in sinks {
            let sink_blk = self.netlist.pin_block(*sink);
            let sink_pb = match self.atom_pb[sink_blk.0] {
                Some((_, pb)) => pb,
                None => return true,
            };
            let sink_port = self.netlist.port(self.netlist.pin(*sink).port);
            let sink_site = self.cluster(id).pb(sink_pb).graph_node;
            let sink_pb_pin = match pb_graph.primitive_pin(
                self.arch,
                sink_site,
                &sink_port.name,
                self.netlist.pin(*sink).bit,
            ) {
                Some(p) => p,
                None => return true,
            };
            if connectable.contains(&sink_pb_pin) {
                reachable += 1;
            }
        }
        reachable != sinks.len()
    }

    fn check_lookahead_pins_used(
        &self,
        id: ClusterId,
        pb_id: PbId,
        max_ext_pin_util: (f32, f32),
    ) -> bool {
        let cluster = self.cluster(id);
        let pb = cluster.pb(pb_id);
        let type_idx = cluster.block_type.0;
        let pb_graph = &self.pb_graphs[type_idx];
        let graph_node = pb_graph.node(pb.graph_node);
        let is_root = pb_id == ROOT_PB;

        if let Some(stats) = pb.stats.as_ref() {
            for (iclass, class) in graph_node.input_pin_classes.iter().enumerate() {
                let mut class_size = class.num_pins;
                if is_root {
                    class_size = scale_class_size(class_size, max_ext_pin_util.0);
                    /* the committed usage may already exceed the scaled
                     * budget (the seed packed at full utilization) */
                    class_size = class_size.max(stats.input_pins_used[iclass].len());
                }
                if stats.lookahead_input_pins_used[iclass].len() > class_size {
                    return false;
                }
            }
            for (iclass, class) in graph_node.output_pin_classes.iter().enumerate() {
                let mut class_size = class.num_pins;
                if is_root {
                    class_size = scale_class_size(class_size, max_ext_pin_util.1);
                    class_size = class_size.max(stats.output_pins_used[iclass].len());
                }
                if stats.lookahead_output_pins_used[iclass].len() > class_size {
                    return false;
                }
            }
        }

        if let Some(children) = pb.children.as_ref() {
            for instances in children {
                for child in instances {
                    if !self.check_lookahead_pins_used(id, *child, max_ext_pin_util) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /* Speculation successful: lookahead pin usage becomes committed usage. */
    fn commit_lookahead_pins_used(&mut self, id: ClusterId, pb_id: PbId) {
        let children = {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let pb = cluster.pb_mut(pb_id);
            if let Some(stats) = pb.stats.as_mut() {
                for iclass in 0..stats.lookahead_input_pins_used.len() {
                    let lookahead = stats.lookahead_input_pins_used[iclass].clone();
                    for (slot, net) in lookahead.into_iter().enumerate() {
                        stats.input_pins_used[iclass].entry(slot).or_insert(net);
                    }
                }
                for iclass in 0..stats.lookahead_output_pins_used.len() {
                    let lookahead = stats.lookahead_output_pins_used[iclass].clone();
                    for (slot, net) in lookahead.into_iter().enumerate() {
                        stats.output_pins_used[iclass].entry(slot).or_insert(net);
                    }
                }
            }
            pb.children.clone()
        };
        if let Some(children) = children {
            for instances in children {
                for child in instances {
                    self.commit_lookahead_pins_used(id, child);
                }
            }
        }
    }

    fn commit_molecule(
        &mut self,
        store: &mut MoleculeStore,
        molecule: MoleculeId,
        id: ClusterId,
        sites: &[Option<PbNodeId>],
        new_region: PartitionRegion,
        region_needs_update: bool,
        new_noc_group: Option<NocGroupId>,
    ) {
        let type_idx = self.cluster(id).block_type.0;

        if region_needs_update {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            cluster.region = new_region;
        }
        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            cluster.noc_group = new_noc_group;
            cluster.molecules.push(molecule);
        }

        /* Chain bookkeeping: the first packed molecule of a long chain fixes
         * the chain position every later link must respect. */
        if store.molecule(molecule).is_chain() && store.molecule(molecule).is_long_chain() {
            self.placement_stats[type_idx].has_long_chain = true;
            if store.chain_id(molecule).is_none() {
                let root_site = sites[store.molecule(molecule).root].unwrap();
                if let Some(pattern) = store.molecule(molecule).pattern.as_ref() {
                    let pattern_name = pattern.name.clone();
                    let chain_roots = self.pb_graphs[type_idx]
                        .pattern_chain_roots(self.arch, &pattern_name);
                    if let Some(chain_id) = chain_roots
                        .iter()
                        .position(|pin| self.pb_graphs[type_idx].pin(*pin).node == root_site)
                    {
                        store.set_chain_id(molecule, chain_id);
                    }
                }
            }
        }

        for (imol, site) in sites.iter().enumerate() {
            let atom = match store.molecule(molecule).atoms[imol] {
                Some(a) => a,
                None => continue,
            };
            store.invalidate_molecules_of_atom(atom);
            self.placement_stats[type_idx].commit_primitive(
                self.arch,
                &self.pb_graphs[type_idx],
                site.unwrap(),
            );
            self.atom_cluster[atom.0] = Some(id);

            /* The candidate lists of every enclosing PB went stale. */
            let mut cur = self.atom_pb[atom.0].map(|(_, pb)| pb);
            while let Some(pb_id) = cur {
                let cluster = self.clusters[id.0].as_mut().unwrap();
                let parent = cluster.pb(pb_id).parent;
                if let Some(parent_id) = parent {
                    let stats = cluster.pb_mut(parent_id).stats.as_mut().unwrap();
                    stats.num_child_blocks_in_pb += 1;
                    stats.num_feasible_blocks = None;
                }
                cur = parent;
            }
        }

        self.commit_lookahead_pins_used(id, ROOT_PB);
    }

    /// Revert one trial atom placement, freeing any PB branch the trial
    /// allocated for it alone.
    pub fn revert_place_atom_block(&mut self, store: &mut MoleculeStore, atom: AtomBlockId) {
        let (id, pb_id) = match self.atom_pb[atom.0] {
            Some(x) => x,
            None => {
                self.atom_cluster[atom.0] = None;
                return;
            }
        };

        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            let pb = cluster.pb_mut(pb_id);
            pb.atom = None;
            pb.name = None;
        }
        self.atom_pb[atom.0] = None;
        self.atom_cluster[atom.0] = None;

        let atom_cluster = &self.atom_cluster;
        store.revalidate_molecules_of_atom(atom, |a| atom_cluster[a.0].is_none());

        /* Drop parents that only existed to host this trial. */
        let mut cur = self.cluster(id).pb(pb_id).parent;
        while let Some(pb_id) = cur {
            let next = self.cluster(id).pb(pb_id).parent;
            let empty = {
                let pb = self.cluster(id).pb(pb_id);
                pb.children.is_some()
                    && pb
                        .stats
                        .as_ref()
                        .map(|s| s.num_child_blocks_in_pb == 0)
                        .unwrap_or(false)
            };
            if empty && next.is_some() {
                self.free_pb_children(id, pb_id);
            } else if empty {
                /* The root survives so the seed can try elsewhere, but its
                 * mode pins are released. */
                let type_idx = self.cluster(id).block_type.0;
                let node = self.cluster(id).pb(pb_id).graph_node;
                let mode = self.cluster(id).pb(pb_id).mode;
                let cluster = self.clusters[id.0].as_mut().unwrap();
                if let Some(router) = cluster.router.as_mut() {
                    router.set_pb_modes(self.arch, &self.pb_graphs[type_idx], node, mode, false);
                }
            }
            cur = next;
        }
    }

    fn free_pb_children(&mut self, id: ClusterId, pb_id: PbId) {
        let type_idx = self.cluster(id).block_type.0;
        let node = self.cluster(id).pb(pb_id).graph_node;
        let mode = self.cluster(id).pb(pb_id).mode;

        {
            let cluster = self.clusters[id.0].as_mut().unwrap();
            if let Some(router) = cluster.router.as_mut() {
                router.set_pb_modes(self.arch, &self.pb_graphs[type_idx], node, mode, false);
            }
        }

        let cluster = self.clusters[id.0].as_mut().unwrap();
        let children = cluster.pb_mut(pb_id).children.take();
        if let Some(children) = children {
            for instances in children {
                for child in instances {
                    let child_node = cluster.pb(child).graph_node;
                    cluster.pb_of_node.remove(&child_node);
                }
            }
        }
        let pb = cluster.pb_mut(pb_id);
        pb.mode = 0;
        pb.name = None;
    }

    /* After a failed trial: free every PB branch without a live atom so the
     * next placement starts from a clean tree. Returns whether the subtree
     * below `pb_id` is fully free. */
    fn cleanup_pb(&mut self, id: ClusterId, pb_id: PbId) -> bool {
        let children = match self.cluster(id).pb(pb_id).children.clone() {
            Some(c) => c,
            None => return true,
        };

        let mut can_free = true;
        for instances in &children {
            for child in instances {
                let (is_primitive, occupied) = {
                    let pb = self.cluster(id).pb(*child);
                    (pb.children.is_none() && pb.stats.is_none(), pb.atom.is_some())
                };
                if is_primitive {
                    if occupied {
                        can_free = false;
                    }
                } else if !self.cleanup_pb(id, *child) {
                    can_free = false;
                }
            }
        }

        if can_free {
            self.free_pb_children(id, pb_id);
        }
        can_free
    }

    fn record_molecule_failure(
        &mut self,
        store: &MoleculeStore,
        molecule: MoleculeId,
        id: ClusterId,
    ) {
        let atom = store.molecule(molecule).root_atom();
        let cluster = self.clusters[id.0].as_mut().unwrap();
        *cluster
            .root_stats_mut()
            .atom_failures
            .entry(atom)
            .or_insert(0) += 1;
    }

    /// Tear a cluster down, reverting every molecule inside it.
    pub fn destroy_cluster(&mut self, store: &mut MoleculeStore, id: ClusterId) {
        let molecules = self.cluster(id).molecules.clone();
        for molecule in molecules {
            self.molecule_cluster.remove(&molecule);
            let atoms: Vec<AtomBlockId> = store.molecule(molecule).atom_ids().collect();
            for atom in atoms {
                if self.atom_pb[atom.0].is_some() {
                    self.revert_place_atom_block(store, atom);
                }
            }
            store.set_valid(molecule, true);
        }
        self.clusters[id.0] = None;
    }

    /// Drop destroyed clusters and renumber the survivors.
    pub fn compress(&mut self) {
        let mut remap: HashMap<ClusterId, ClusterId> = HashMap::new();
        let mut compacted = Vec::new();
        for (old, cluster) in std::mem::take(&mut self.clusters).into_iter().enumerate() {
            if let Some(cluster) = cluster {
                remap.insert(ClusterId(old), ClusterId(compacted.len()));
                compacted.push(Some(cluster));
            }
        }
        self.clusters = compacted;

        for entry in self.atom_cluster.iter_mut() {
            *entry = entry.and_then(|old| remap.get(&old).copied());
        }
        for entry in self.atom_pb.iter_mut() {
            *entry = entry.and_then(|(old, pb)| remap.get(&old).map(|new| (*new, pb)));
        }
        self.molecule_cluster = std::mem::take(&mut self.molecule_cluster)
            .into_iter()
            .filter_map(|(mol, old)| remap.get(&old).map(|new| (mol, *new)))
            .collect();
    }

    /// Prove a closed cluster routable. Used when the legalization strategy
    /// deferred the detailed routing check to the end of the cluster; a mode
    /// conflict that survives to this point escalates to a routing failure.
    pub fn check_cluster_legality(&mut self, id: ClusterId) -> Result<(), PackError> {
        let type_idx = self.cluster(id).block_type.0;
        let cluster = self.clusters[id.0].as_mut().unwrap();
        let router = cluster.router.as_mut().unwrap();
        match router.try_route(&self.rr_graphs[type_idx], self.netlist) {
            RouteResult::Routed => Ok(()),
            RouteResult::ModeConflict { .. } | RouteResult::Infeasible { .. } => {
                Err(PackError::RoutingInfeasible { cluster: id.0 })
            }
        }
    }

    /// Collapse the saved routing into a pb_route map and drop the router.
    pub fn clean_cluster(&mut self, id: ClusterId) {
        let type_idx = self.cluster(id).block_type.0;
        let total_pins = self.pb_graphs[type_idx].total_pb_pins;
        let cluster = self.clusters[id.0].as_mut().unwrap();
        if let Some(router) = cluster.router.take() {
            cluster.pb_route = router.saved_pb_route(total_pins);
        }
    }

    /// Consistency checks over the finished clustering.
    pub fn verify(&self) -> Result<(), PackError> {
        for atom in self.netlist.block_ids() {
            let in_cluster = self.atom_cluster[atom.0];
            let via_pb = self.atom_pb[atom.0];
            match (in_cluster, via_pb) {
                (Some(cid), Some((pid, pb_id))) => {
                    if cid != pid {
                        return Err(PackError::InternalInvariant(format!(
                            "atom '{}' cluster map disagrees with pb map",
                            self.netlist.block(atom).name
                        )));
                    }
                    let pb = self.cluster(cid).pb(pb_id);
                    if pb.atom != Some(atom) {
                        return Err(PackError::InternalInvariant(format!(
                            "pb does not link back to atom '{}'",
                            self.netlist.block(atom).name
                        )));
                    }
                }
                (None, None) => {}
                _ => {
                    return Err(PackError::InternalInvariant(format!(
                        "atom '{}' is half-registered",
                        self.netlist.block(atom).name
                    )))
                }
            }
        }

        for id in self.cluster_ids() {
            let cluster = self.cluster(id);
            for pb in cluster.pbs.iter().filter(|pb| pb.is_live()) {
                if let Some(children) = pb.children.as_ref() {
                    let any_live = children
                        .iter()
                        .flat_map(|i| i.iter())
                        .any(|c| cluster.pb(*c).is_live() || cluster.pb(*c).children.is_some());
                    if !any_live {
                        return Err(PackError::InternalInvariant(format!(
                            "cluster '{}' has a live composite pb without live children",
                            cluster.name
                        )));
                    }
                    /* children must sit under the active mode */
                    let type_idx = cluster.block_type.0;
                    let pb_graph = &self.pb_graphs[type_idx];
                    for child in children.iter().flat_map(|i| i.iter()) {
                        let child_node = cluster.pb(*child).graph_node;
                        if pb_graph.node(child_node).parent_mode != pb.mode {
                            return Err(PackError::InternalInvariant(format!(
                                "cluster '{}' holds a child outside its parent's mode",
                                cluster.name
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_cluster_floorplanning(
    floorplan: &FloorplanConstraints,
    atom: AtomBlockId,
    cluster_region: &mut PartitionRegion,
    needs_update: &mut bool,
) -> bool {
    let part = match floorplan.atom_partition(atom) {
        Some(p) => p,
        None => return true, /* unconstrained atom fits anywhere */
    };
    let atom_region = floorplan.partition_region(part);

    if cluster_region.empty() {
        *cluster_region = atom_region.clone();
        *needs_update = true;
        return true;
    }

    replace_with_or_abort(cluster_region, |r| r.intersection(atom_region));
    if cluster_region.empty() {
        return false;
    }
    *needs_update = true;
    true
}
