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

/* Negotiated-congestion (PathFinder) routing over the per-type RR graph.
 *
 * Every iteration reroutes the nets whose current trees touch an
 * over-capacity node, sink by sink with a cost-ordered maze expansion.
 * Presence penalties multiply up between iterations and overuse accumulates
 * into per-node history, steering later iterations away from congestion.
 */

use std::collections::BinaryHeap;

use super::*;
use crate::netlist::AtomNetlist;
use crate::rr_graph::LbRrGraph;
#[allow(unused)]
use crate::log::*;

#[derive(Debug)]
pub enum RouteResult {
    Routed,
    Infeasible { net: Option<AtomNetId> },
    /* A sink only reachable under a mode selection other than the one the
     * placed PB tree pinned. */
    ModeConflict { rr_node: usize },
}

impl RouteResult {
    pub fn routed(&self) -> bool {
        matches!(self, RouteResult::Routed)
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CommitRemove {
    Commit,
    Remove,
}

impl RouterData {
    /// Attempt to route every registered net. On success the routed solution
    /// is saved (and the working trees reset) for later pb_route extraction.
    pub fn try_route(&mut self, graph: &LbRrGraph, netlist: &AtomNetlist) -> RouteResult {
        for explored in self.explored.iter_mut() {
            *explored = ExploredNode::default();
        }
        self.explore_id = 1;
        for net in self.nets.iter_mut() {
            net.route = None;
        }
        for stats in self.stats.iter_mut() {
            stats.occ = 0;
            stats.historical_usage = 0;
        }
        self.pres_con_fac = self.params.pres_fac;

        let mut pq = std::mem::take(&mut self.pq);
        let result = self.route_iterations(graph, netlist, &mut pq);
        pq.clear();
        self.pq = pq;

        if result.routed() {
            self.save_and_reset_route();
        } else {
            for net in self.nets.iter_mut() {
                net.route = None;
            }
        }
        result
    }

    fn route_iterations(
        &mut self,
        graph: &LbRrGraph,
        netlist: &AtomNetlist,
        pq: &mut BinaryHeap<Expansion>,
    ) -> RouteResult {
        for _iter in 0..self.params.max_iterations {
            for inet in 0..self.nets.len() {
                if is_skip_route_net(graph, &self.stats, self.nets[inet].route.as_ref()) {
                    continue;
                }

                if let Some(route) = self.nets[inet].route.take() {
                    commit_remove_rt(
                        graph,
                        &mut self.stats,
                        &mut self.explored,
                        &route,
                        CommitRemove::Remove,
                    );
                }

                let driver = self.nets[inet].terminals[DRIVER_INDEX]
                    .expect("net must have a resolved driver");
                let mut route = RouteTree::new(driver);

                let num_terminals = self.nets[inet].terminals.len();
                for iterm in 1..num_terminals {
                    let sink = self.nets[inet].terminals[iterm]
                        .expect("net must have resolved sink targets");

                    pq.clear();
                    expand_rt(&route, &mut self.explored, pq, inet, self.explore_id);

                    let reached = self.route_one_sink(graph, pq, sink, num_terminals - 1);
                    if !reached {
                        let atom_net = self.nets[inet].net;
                        dbg_log!(
                            DBG_INFO,
                            "No possible routing path to rr node {} for net '{}'",
                            sink,
                            netlist.net(atom_net).name
                        );
                        if mode_free_reaches(graph, &route, sink) {
                            return RouteResult::ModeConflict { rr_node: sink };
                        }
                        return RouteResult::Infeasible {
                            net: Some(atom_net),
                        };
                    }

                    add_to_rt(&mut route, sink, &self.explored, inet);
                    self.bump_explore_id();
                }

                commit_remove_rt(
                    graph,
                    &mut self.stats,
                    &mut self.explored,
                    &route,
                    CommitRemove::Commit,
                );
                self.nets[inet].route = Some(route);
            }

            if self.is_route_success(graph) {
                return RouteResult::Routed;
            }
            self.pres_con_fac *= self.params.pres_fac_mult;
        }

        RouteResult::Infeasible { net: None }
    }

    /* Pop until the sink comes off the queue; expansion is mode-filtered. */
    fn route_one_sink(
        &mut self,
        graph: &LbRrGraph,
        pq: &mut BinaryHeap<Expansion>,
        sink: usize,
        net_fanout: usize,
    ) -> bool {
        while let Some(exp) = pq.pop() {
            if self.explored[exp.node].explored_id == self.explore_id {
                /* Already popped at lower cost. */
                continue;
            }
            self.explored[exp.node].explored_id = self.explore_id;
            self.explored[exp.node].prev = exp.prev;

            if exp.node == sink {
                return true;
            }

            expand_node(
                graph,
                &self.stats,
                &mut self.explored,
                pq,
                &self.params,
                self.pres_con_fac,
                exp,
                net_fanout,
                self.explore_id,
            );
        }
        false
    }

    fn bump_explore_id(&mut self) {
        self.explore_id += 1;
        if self.explore_id == u64::MAX {
            for explored in self.explored.iter_mut() {
                explored.explored_id = 0;
                explored.enqueue_id = 0;
            }
            self.explore_id = 1;
        }
    }

    fn is_route_success(&self, graph: &LbRrGraph) -> bool {
        self.stats
            .iter()
            .zip(graph.nodes.iter())
            .all(|(stats, node)| stats.occ <= node.capacity as i32)
    }

    fn save_and_reset_route(&mut self) {
        let saved = self
            .nets
            .iter_mut()
            .map(|net| SavedNet {
                net: net.net,
                terminals: net.terminals.iter().map(|t| t.unwrap()).collect(),
                route: net.route.take().expect("successful route for every net"),
            })
            .collect();
        self.saved_nets = Some(saved);
    }

    /// Nodes currently over capacity; failure diagnostics.
    pub fn congested_rr_nodes(&self, graph: &LbRrGraph) -> Vec<usize> {
        self.stats
            .iter()
            .zip(graph.nodes.iter())
            .enumerate()
            .filter(|(_, (stats, node))| stats.occ > node.capacity as i32)
            .map(|(inode, _)| inode)
            .collect()
    }
}

/* Should this net be skipped? Only nets whose current tree crosses an
 * over-capacity node need rerouting. */
fn is_skip_route_net(
    graph: &LbRrGraph,
    stats: &[LbRrNodeStats],
    route: Option<&RouteTree>,
) -> bool {
    match route {
        None => false,
        Some(route) => {
            let mut clean = true;
            route.visit(&mut |inode| {
                if stats[inode].occ > graph.nodes[inode].capacity as i32 {
                    clean = false;
                }
            });
            clean
        }
    }
}

fn commit_remove_rt(
    graph: &LbRrGraph,
    stats: &mut [LbRrNodeStats],
    explored: &mut [ExploredNode],
    route: &RouteTree,
    op: CommitRemove,
) {
    let inode = route.node;
    match op {
        CommitRemove::Commit => {
            if stats[inode].occ >= graph.nodes[inode].capacity as i32 {
                /* store historical overuse */
                stats[inode].historical_usage +=
                    stats[inode].occ - graph.nodes[inode].capacity as i32 + 1;
            }
            stats[inode].occ += 1;
        }
        CommitRemove::Remove => {
            explored[inode].inet = None;
            stats[inode].occ -= 1;
            debug_assert!(stats[inode].occ >= 0);
        }
    }
    for branch in &route.branches {
        commit_remove_rt(graph, stats, explored, branch, op);
    }
}

/* Seed the priority queue with the entire partial route tree at cost 0. */
fn expand_rt(
    route: &RouteTree,
    explored: &mut [ExploredNode],
    pq: &mut BinaryHeap<Expansion>,
    inet: usize,
    explore_id: u64,
) {
    debug_assert!(pq.is_empty());
    expand_rt_rec(route, None, explored, pq, inet, explore_id);
}

fn expand_rt_rec(
    route: &RouteTree,
    prev: Option<usize>,
    explored: &mut [ExploredNode],
    pq: &mut BinaryHeap<Expansion>,
    inet: usize,
    explore_id: u64,
) {
    pq.push(Expansion {
        node: route.node,
        prev,
        cost: 0.,
    });
    let entry = &mut explored[route.node];
    entry.inet = Some(inet);
    entry.explored_id = 0;
    entry.enqueue_id = explore_id;
    entry.enqueue_cost = 0.;
    entry.prev = prev;

    for branch in &route.branches {
        expand_rt_rec(branch, Some(route.node), explored, pq, inet, explore_id);
    }
}

fn expand_node(
    graph: &LbRrGraph,
    stats: &[LbRrNodeStats],
    explored: &mut [ExploredNode],
    pq: &mut BinaryHeap<Expansion>,
    params: &RouterParams,
    pres_con_fac: f32,
    exp: Expansion,
    net_fanout: usize,
    explore_id: u64,
) {
    let cur = exp.node;
    let mode = stats[cur].mode;

    for iedge in 0..graph.nodes[cur].num_fanout(mode) {
        let edge = graph.nodes[cur].outedges[mode][iedge];
        let target = edge.to;

        let usage = stats[target].occ + 1 - graph.nodes[target].capacity as i32;
        let mut incr_cost = graph.nodes[target].intrinsic_cost;
        incr_cost += edge.intrinsic_cost;
        incr_cost += params.hist_fac * stats[target].historical_usage as f32;
        if usage > 0 {
            incr_cost *= usage as f32 * pres_con_fac;
        }

        /* Higher-fanout nets prefer higher-fanout routing nodes and
         * vice versa. */
        let next_mode = stats[target].mode;
        let fanout_factor = if graph.nodes[target].num_fanout(next_mode) > 1 {
            0.85 + (0.25 / net_fanout as f32)
        } else {
            1.15 - (0.25 / net_fanout as f32)
        };
        incr_cost *= fanout_factor;

        let enode = Expansion {
            node: target,
            prev: Some(cur),
            cost: exp.cost + incr_cost,
        };

        /* Only enqueue paths cheaper than the best known one. */
        let entry = &mut explored[target];
        if entry.enqueue_id == explore_id {
            if enode.cost < entry.enqueue_cost {
                pq.push(enode);
            }
        } else {
            entry.enqueue_id = explore_id;
            entry.enqueue_cost = enode.cost;
            pq.push(enode);
        }
    }
}

/* Add the traceback of a freshly reached sink to the route tree. */
fn add_to_rt(route: &mut RouteTree, node: usize, explored: &[ExploredNode], inet: usize) {
    let mut trace_forward = Vec::new();
    let mut cur = node;
    while explored[cur].inet != Some(inet) {
        trace_forward.push(cur);
        cur = explored[cur]
            .prev
            .expect("traceback must lead back to the route tree");
    }

    let mut link = route
        .find_node(cur)
        .expect("traceback root must be on the route tree");
    while let Some(next) = trace_forward.pop() {
        link.branches.push(RouteTree::new(next));
        link = link.branches.last_mut().unwrap();
    }
}

/* Would the sink be reachable if expansion ignored the pinned modes? */
fn mode_free_reaches(graph: &LbRrGraph, route: &RouteTree, sink: usize) -> bool {
    let mut seeds = Vec::new();
    route.visit(&mut |inode| seeds.push(inode));

    let mut seen = vec![false; graph.nodes.len()];
    let mut stack = seeds;
    while let Some(cur) = stack.pop() {
        if cur == sink {
            return true;
        }
        if seen[cur] {
            continue;
        }
        seen[cur] = true;
        for edges in &graph.nodes[cur].outedges {
            for edge in edges {
                if !seen[edge.to] {
                    stack.push(edge.to);
                }
            }
        }
    }
    false
}
