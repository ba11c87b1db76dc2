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

/* Placement enumerator: given a molecule and a partially packed cluster,
 * find free primitive sites its atoms can occupy.
 *
 * The per-type stats move primitives between four states: valid (free),
 * in-flight (speculatively proposed), tried (proposed and rejected) and
 * invalid (used, or cut off by a mode decision). Costs steer later
 * molecules toward subtrees already in use: committing a primitive grants a
 * small reward to the siblings of each ancestor, decaying with distance.
 */

use std::collections::HashMap;

use crate::arch::{Arch, PbGraph, PbNodeId, PbPinId, PbTypeId};
use crate::common::fcmp;
use crate::molecule::{MoleculeId, MoleculeKind, MoleculeStore, PackPattern};
use crate::netlist::AtomNetlist;
#[allow(unused)]
use crate::log::*;

/* cost of using a node drops as its neighbours are used, this drop must stay
 * small compared to base-cost differences */
const ANCESTOR_SIBLING_REWARD: f32 = -0.01;
const REWARD_DECAY_PER_LEVEL: f32 = 0.1;

struct PlacementPrimitive {
    node: PbNodeId,
    pb_type: PbTypeId,
    base_cost: f32,
    incremental_cost: f32,
    valid: bool,
}

pub struct PlacementStats {
    prims: Vec<PlacementPrimitive>,
    by_node: HashMap<PbNodeId, usize>,
    /* One queue of free primitives per primitive pb_type. */
    valid_queues: Vec<(PbTypeId, Vec<usize>)>,
    in_flight: Option<usize>,
    tried: Vec<usize>,
    invalid: Vec<usize>,
    curr_molecule: Option<MoleculeId>,
    pub has_long_chain: bool,
}

impl PlacementStats {
    pub fn new(arch: &Arch, pb_graph: &PbGraph) -> Self {
        let mut stats = PlacementStats {
            prims: Vec::new(),
            by_node: HashMap::new(),
            valid_queues: Vec::new(),
            in_flight: None,
            tried: Vec::new(),
            invalid: Vec::new(),
            curr_molecule: None,
            has_long_chain: false,
        };

        for node in pb_graph.primitives(arch) {
            let total = pb_graph.node(node).total_primitive_count.max(1);
            let pb_type = pb_graph.node(node).pb_type;
            let iprim = stats.prims.len();
            stats.prims.push(PlacementPrimitive {
                node,
                pb_type,
                /* scarcer primitive types cost more to consume */
                base_cost: 1. / total as f32,
                incremental_cost: 0.,
                valid: true,
            });
            stats.by_node.insert(node, iprim);

            match stats.valid_queues.iter_mut().find(|(t, _)| *t == pb_type) {
                Some((_, queue)) => queue.push(iprim),
                None => stats.valid_queues.push((pb_type, vec![iprim])),
            }
        }

        stats
    }

    /// Lowest-cost set of free primitives implementing the molecule, or None
    /// when the open cluster has no more candidate sites for it. Repeated
    /// calls with the same molecule step through alternatives.
    pub fn get_next_primitive_list(
        &mut self,
        arch: &Arch,
        pb_graph: &PbGraph,
        netlist: &AtomNetlist,
        store: &MoleculeStore,
        molecule: MoleculeId,
    ) -> Option<Vec<Option<PbNodeId>>> {
        if self.curr_molecule != Some(molecule) {
            /* New molecule, requeue tried and in-flight primitives. */
            self.flush_intermediate_queues();
            self.curr_molecule = Some(molecule);
        } else if let Some(prim) = self.in_flight.take() {
            /* Same molecule retrying: the proposed root goes to tried. */
            self.tried.push(prim);
        }

        let root_atom = store.molecule(molecule).root_atom();

        let mut best: Option<(f32, usize, Vec<Option<PbNodeId>>)> = None;
        for iqueue in 0..self.valid_queues.len() {
            let queue_type = self.valid_queues[iqueue].0;
            if !netlist.primitive_type_feasible(root_atom, arch, queue_type) {
                continue;
            }

            let mut live = Vec::with_capacity(self.valid_queues[iqueue].1.len());
            for iprim in std::mem::take(&mut self.valid_queues[iqueue].1) {
                /* remove invalidated entries lazily when encountered */
                if !self.prims[iprim].valid {
                    self.invalid.push(iprim);
                    continue;
                }
                live.push(iprim);

                let placed = try_place_molecule(
                    &self.prims,
                    &self.by_node,
                    arch,
                    pb_graph,
                    netlist,
                    store,
                    molecule,
                    self.prims[iprim].node,
                );
                if let Some((cost, sites)) = placed {
                    let better = match &best {
                        None => true,
                        Some((best_cost, best_prim, _)) => {
                            fcmp(cost, *best_cost).is_lt()
                                || (cost == *best_cost
                                    && pb_graph.node(self.prims[iprim].node).total_primitive_count
                                        > pb_graph
                                            .node(self.prims[*best_prim].node)
                                            .total_primitive_count)
                        }
                    };
                    if better {
                        best = Some((cost, iprim, sites));
                    }
                }
            }
            self.valid_queues[iqueue].1 = live;
        }

        let (_, best_prim, sites) = best?;

        /* Pull the winning root out of its queue and pin it in flight. */
        for (_, queue) in self.valid_queues.iter_mut() {
            queue.retain(|p| *p != best_prim);
        }
        self.in_flight = Some(best_prim);

        Some(sites)
    }

    /// Mark a primitive used and bias placement costs toward its
    /// neighbourhood; invalidate every subtree cut off by mode decisions on
    /// the ancestor chain.
    pub fn commit_primitive(&mut self, arch: &Arch, pb_graph: &PbGraph, chosen: PbNodeId) {
        self.flush_intermediate_queues();

        let iprim = self.by_node[&chosen];
        debug_assert!(self.prims[iprim].valid);
        self.prims[iprim].valid = false;

        let mut incr_cost = ANCESTOR_SIBLING_REWARD;
        let mut node_id = chosen;
        while let Some(parent_id) = pb_graph.node(node_id).parent {
            let skip = node_id;
            let valid_mode = pb_graph.node(node_id).parent_mode;
            let parent = pb_graph.node(parent_id);

            for (imode, by_type) in parent.children.iter().enumerate() {
                for instances in by_type {
                    for child in instances {
                        if *child == skip {
                            continue;
                        }
                        self.update_cost_or_status(
                            arch,
                            pb_graph,
                            *child,
                            incr_cost,
                            imode == valid_mode,
                        );
                    }
                }
            }

            /* ancestors farther up the tree matter less */
            incr_cost *= REWARD_DECAY_PER_LEVEL;
            node_id = parent_id;
        }
    }

    fn update_cost_or_status(
        &mut self,
        arch: &Arch,
        pb_graph: &PbGraph,
        node_id: PbNodeId,
        incremental_cost: f32,
        valid: bool,
    ) {
        if arch.pb_type(pb_graph.node(node_id).pb_type).is_primitive() {
            let iprim = self.by_node[&node_id];
            if valid {
                self.prims[iprim].incremental_cost += incremental_cost;
            } else {
                self.prims[iprim].valid = false;
            }
            return;
        }
        for by_type in &pb_graph.node(node_id).children {
            for instances in by_type {
                for child in instances {
                    self.update_cost_or_status(arch, pb_graph, *child, incremental_cost, valid);
                }
            }
        }
    }

    /// Root mode was chosen for a fresh cluster: everything under the other
    /// root modes is unusable.
    pub fn set_root_mode(&mut self, arch: &Arch, pb_graph: &PbGraph, mode: usize) {
        let root = pb_graph.node(pb_graph.root);
        for (imode, by_type) in root.children.iter().enumerate() {
            if imode == mode {
                continue;
            }
            for instances in by_type {
                for child in instances {
                    self.update_cost_or_status(arch, pb_graph, *child, 0., false);
                }
            }
        }
    }

    /// Between clusters: everything becomes free again at zero cost.
    pub fn reset(&mut self) {
        self.flush_intermediate_queues();
        for iprim in std::mem::take(&mut self.invalid) {
            self.requeue(iprim);
        }
        for prim in self.prims.iter_mut() {
            prim.incremental_cost = 0.;
            prim.valid = true;
        }
        self.curr_molecule = None;
        self.has_long_chain = false;
    }

    /// Weaker-heuristic fallback wants to revisit sites the gain-guided scan
    /// proposed and abandoned; the invalid list stays untouched.
    pub fn reset_tried_but_unused(&mut self) {
        self.flush_intermediate_queues();
        self.curr_molecule = None;
    }

    pub fn exists_free_primitive_for_atom(
        &self,
        arch: &Arch,
        netlist: &AtomNetlist,
        atom: crate::netlist::AtomBlockId,
    ) -> bool {
        self.valid_queues.iter().any(|(pb_type, queue)| {
            netlist.primitive_type_feasible(atom, arch, *pb_type)
                && queue.iter().any(|iprim| self.prims[*iprim].valid)
        })
    }

    fn flush_intermediate_queues(&mut self) {
        if let Some(prim) = self.in_flight.take() {
            self.requeue(prim);
        }
        for prim in std::mem::take(&mut self.tried) {
            self.requeue(prim);
        }
    }

    fn requeue(&mut self, iprim: usize) {
        /* validity is not touched; stale entries are collected lazily */
        let type_id = self.prims[iprim].pb_type;
        match self.valid_queues.iter_mut().find(|(t, _)| *t == type_id) {
            Some((_, queue)) => queue.push(iprim),
            None => self.valid_queues.push((type_id, vec![iprim])),
        }
    }
}

/* Try to place the molecule with its root atom on `root`; returns the cost
 * and the per-pattern-block site list. */
fn try_place_molecule(
    prims: &[PlacementPrimitive],
    by_node: &HashMap<PbNodeId, usize>,
    arch: &Arch,
    pb_graph: &PbGraph,
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    molecule: MoleculeId,
    root: PbNodeId,
) -> Option<(f32, Vec<Option<PbNodeId>>)> {
    let mol = store.molecule(molecule);
    let root_atom = mol.root_atom();

    if !netlist.primitive_type_feasible(root_atom, arch, pb_graph.node(root).pb_type) {
        return None;
    }
    let root_prim = &prims[by_node[&root]];
    if !root_prim.valid {
        return None;
    }

    let mut sites: Vec<Option<PbNodeId>> = vec![None; mol.atoms.len()];
    let mut cost = root_prim.base_cost + root_prim.incremental_cost;
    sites[mol.root] = Some(root);

    if matches!(mol.kind, MoleculeKind::ForcedPack | MoleculeKind::Chain) {
        let pattern = mol.pattern.as_ref()?;
        if !expand_forced_pack_placement(
            prims, by_node, arch, pb_graph, netlist, store, molecule, pattern,
            pattern.root_block, &mut sites, &mut cost,
        ) {
            return None;
        }
    }

    /* every pattern block with an atom needs its own site */
    for i in 0..sites.len() {
        if sites[i].is_none() != mol.atoms[i].is_none() {
            return None;
        }
        for j in 0..sites.len() {
            if i != j && sites[i].is_some() && sites[i] == sites[j] {
                return None;
            }
        }
    }

    Some((cost, sites))
}

/* Walk the forced-pack pattern's connections outward from a placed block,
 * deriving each neighbour's site from the pb-graph edges that carry the
 * pattern. */
fn expand_forced_pack_placement(
    prims: &[PlacementPrimitive],
    by_node: &HashMap<PbNodeId, usize>,
    arch: &Arch,
    pb_graph: &PbGraph,
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    molecule: MoleculeId,
    pattern: &PackPattern,
    pattern_block: usize,
    sites: &mut Vec<Option<PbNodeId>>,
    cost: &mut f32,
) -> bool {
    let mol = store.molecule(molecule);
    let placed = match sites[pattern_block] {
        Some(p) => p,
        None => return false,
    };

    for conn in &pattern.connections {
        let (next_block, forward) = if conn.from_block == pattern_block {
            (conn.to_block, true)
        } else if conn.to_block == pattern_block {
            (conn.from_block, false)
        } else {
            continue;
        };

        if sites[next_block].is_some() || mol.atoms[next_block].is_none() {
            continue;
        }

        let (port_name, pin_number) = if forward {
            (conn.from_port.as_str(), conn.from_pin)
        } else {
            (conn.to_port.as_str(), conn.to_pin)
        };
        let cur_pin = match pb_graph.primitive_pin(arch, placed, port_name, pin_number) {
            Some(p) => p,
            None => return false,
        };

        let next_pin =
            match expand_pattern_pin_edge(arch, pb_graph, &pattern.name, cur_pin, forward) {
                Some(p) => p,
                None => return false,
            };
        let next_prim = pb_graph.pin(next_pin).node;

        let atom = mol.atoms[next_block].unwrap();
        let prim = &prims[by_node[&next_prim]];
        if !prim.valid
            || !netlist.primitive_type_feasible(atom, arch, pb_graph.node(next_prim).pb_type)
        {
            return false;
        }

        sites[next_block] = Some(next_prim);
        *cost += prim.base_cost + prim.incremental_cost;

        if !expand_forced_pack_placement(
            prims, by_node, arch, pb_graph, netlist, store, molecule, pattern, next_block,
            sites, cost,
        ) {
            return false;
        }
    }

    true
}

/* Follow the single pattern-carrying fanout through intermediate pins until
 * the next primitive pin. */
fn expand_pattern_pin_edge(
    arch: &Arch,
    pb_graph: &PbGraph,
    pattern: &str,
    cur_pin: PbPinId,
    forward: bool,
) -> Option<PbPinId> {
    let edges = if forward {
        &pb_graph.pin(cur_pin).out_edges
    } else {
        &pb_graph.pin(cur_pin).in_edges
    };

    for edge in edges {
        if !edge.infer_pattern && !edge.pack_patterns.iter().any(|p| p == pattern) {
            continue;
        }
        let next = edge.pin;
        let next_node = pb_graph.pin(next).node;
        if arch.pb_type(pb_graph.node(next_node).pb_type).is_primitive() {
            return Some(next);
        }
        if let Some(hit) = expand_pattern_pin_edge(arch, pb_graph, pattern, next, forward) {
            return Some(hit);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{build_pb_graphs, ArchSpec};
    use crate::molecule::{build_molecules, MoleculeKind, MoleculeSpec, PackPattern, PatternConnection};
    use crate::netlist::NetlistSpec;

    fn adder_arch() -> ArchSpec {
        serde_yaml::from_str(
            r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: a, dir: input, width: 2}
        - {name: s, dir: output, width: 2}
        - {name: cin, dir: input, width: 1}
        - {name: cout, dir: output, width: 1}
      modes:
        - name: arith
          children:
            - pb_type:
                name: adder
                model: .subckt adder
                ports:
                  - {name: a, dir: input, width: 1}
                  - {name: cin, dir: input, width: 1}
                  - {name: s, dir: output, width: 1}
                  - {name: cout, dir: output, width: 1}
              count: 2
          interconnect:
            - {kind: direct, from: [parent.a], to: [adder.a]}
            - {kind: direct, from: [adder.s], to: [parent.s]}
            - {kind: direct, from: [parent.cin], to: ["adder[0].cin"], pack_pattern: [chain]}
            - {kind: direct, from: ["adder[0].cout"], to: ["adder[1].cin"], pack_pattern: [chain]}
            - {kind: direct, from: ["adder[1].cout"], to: [parent.cout], pack_pattern: [chain]}
"#,
        )
        .unwrap()
    }

    fn adder_netlist() -> NetlistSpec {
        serde_yaml::from_str(
            r#"
blocks:
  - name: add0
    model: .subckt adder
    ports:
      - {port: a, dir: input, nets: [x0]}
      - {port: cin, dir: input, nets: [ci]}
      - {port: s, dir: output, nets: [s0]}
      - {port: cout, dir: output, nets: [c0]}
  - name: add1
    model: .subckt adder
    ports:
      - {port: a, dir: input, nets: [x1]}
      - {port: cin, dir: input, nets: [c0]}
      - {port: s, dir: output, nets: [s1]}
      - {port: cout, dir: output, nets: [co]}
"#,
        )
        .unwrap()
    }

    fn chain_molecule_spec() -> MoleculeSpec {
        MoleculeSpec {
            kind: MoleculeKind::Chain,
            atoms: vec!["add0".into(), "add1".into()],
            root: 0,
            pattern: Some(PackPattern {
                name: "chain".into(),
                root_block: 0,
                connections: vec![PatternConnection {
                    from_block: 0,
                    from_port: "cout".into(),
                    from_pin: 0,
                    to_block: 1,
                    to_port: "cin".into(),
                    to_pin: 0,
                }],
            }),
            long_chain: false,
        }
    }

    #[test]
    fn test_forced_pack_expansion_follows_pattern() {
        let arch = adder_arch().compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        let netlist = adder_netlist().compile().unwrap();
        let store = build_molecules(&netlist, &[chain_molecule_spec()]).unwrap();
        let mut stats = PlacementStats::new(&arch, &graphs[0]);

        let sites = stats
            .get_next_primitive_list(&arch, &graphs[0], &netlist, &store, MoleculeId(0))
            .expect("chain molecule must place");

        let adders: Vec<PbNodeId> = graphs[0].primitives(&arch).collect();
        /* the chain can only start at the first adder */
        assert_eq!(sites, vec![Some(adders[0]), Some(adders[1])]);
    }

    #[test]
    fn test_no_alternative_after_exhausting_sites() {
        let arch = adder_arch().compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        let netlist = adder_netlist().compile().unwrap();
        let store = build_molecules(&netlist, &[chain_molecule_spec()]).unwrap();
        let mut stats = PlacementStats::new(&arch, &graphs[0]);

        assert!(stats
            .get_next_primitive_list(&arch, &graphs[0], &netlist, &store, MoleculeId(0))
            .is_some());
        /* same molecule again: the only viable root is in flight, nothing
         * else can anchor the chain */
        assert!(stats
            .get_next_primitive_list(&arch, &graphs[0], &netlist, &store, MoleculeId(0))
            .is_none());
    }

    #[test]
    fn test_commit_invalidates_primitive() {
        let arch = adder_arch().compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        let netlist = adder_netlist().compile().unwrap();
        /* two singleton molecules */
        let store = build_molecules(&netlist, &[]).unwrap();
        let mut stats = PlacementStats::new(&arch, &graphs[0]);
        let adders: Vec<PbNodeId> = graphs[0].primitives(&arch).collect();

        let sites = stats
            .get_next_primitive_list(&arch, &graphs[0], &netlist, &store, MoleculeId(0))
            .unwrap();
        let first = sites[0].unwrap();
        stats.commit_primitive(&arch, &graphs[0], first);

        let sites = stats
            .get_next_primitive_list(&arch, &graphs[0], &netlist, &store, MoleculeId(1))
            .unwrap();
        let second = sites[0].unwrap();
        assert_ne!(first, second);
        assert!(adders.contains(&second));

        /* committing the second exhausts the type */
        stats.commit_primitive(&arch, &graphs[0], second);
        assert!(!stats.exists_free_primitive_for_atom(
            &arch,
            &netlist,
            crate::netlist::AtomBlockId(0)
        ));

        stats.reset();
        assert!(stats.exists_free_primitive_for_atom(
            &arch,
            &netlist,
            crate::netlist::AtomBlockId(0)
        ));
    }

    #[test]
    fn test_chain_roots_found() {
        let arch = adder_arch().compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        let roots = graphs[0].pattern_chain_roots(&arch, "chain");
        assert_eq!(roots.len(), 1);
        /* the single tie-off is the first adder's carry input */
        let pin = graphs[0].pin(roots[0]);
        let adders: Vec<PbNodeId> = graphs[0].primitives(&arch).collect();
        assert_eq!(pin.node, adders[0]);
        assert_eq!(graphs[0].pin_port(&arch, roots[0]).name, "cin");
    }
}
