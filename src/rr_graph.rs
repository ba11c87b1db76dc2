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

/* Per-block-type intra-cluster routing resource graph.
 *
 * Indices 0..total_pb_pins map 1:1 onto pb-graph pins. Primitive input pins
 * are intermediates with one edge into a sink node (appended after the pin
 * range; fully-equivalent ports share one sink of port-width capacity).
 * Primitive output pins are sources. Three synthetic nodes appended last
 * model the cluster boundary: ext_src -> ext_rr -> every routable input pin,
 * every routable output pin -> ext_rr -> ext_sink. Edges touching the
 * boundary carry a cost high enough to bias routing against leaving the
 * cluster when an internal path exists.
 */

use std::collections::BTreeSet;

use crate::arch::{Arch, BlockType, PbGraph, PbNodeId, PbPinId, PortDir, PortEquivalence};
#[allow(unused)]
use crate::log::*;

pub const INTERNAL_INTERCONNECT_COST: f32 = 1.;
/* set cost high to avoid using external interconnect unless necessary */
pub const EXTERNAL_INTERCONNECT_COST: f32 = 1000.;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LbRrKind {
    Source,
    Sink,
    Intermediate,
}

#[derive(Copy, Clone, Debug)]
pub struct LbRrEdge {
    pub to: usize,
    pub intrinsic_cost: f32,
}

pub struct LbRrNode {
    pub kind: LbRrKind,
    pub capacity: usize,
    pub intrinsic_cost: f32,
    pub pb_pin: Option<PbPinId>,
    /* outedges[mode] -> fanout edges active under that mode */
    pub outedges: Vec<Vec<LbRrEdge>>,
}

impl LbRrNode {
    fn new(kind: LbRrKind, capacity: usize, num_modes: usize) -> Self {
        LbRrNode {
            kind,
            capacity,
            intrinsic_cost: 0.,
            pb_pin: None,
            outedges: vec![Vec::new(); num_modes.max(1)],
        }
    }

    pub fn num_modes(&self) -> usize {
        self.outedges.len()
    }

    pub fn num_fanout(&self, mode: usize) -> usize {
        self.outedges.get(mode).map(|e| e.len()).unwrap_or(0)
    }
}

pub struct LbRrGraph {
    pub nodes: Vec<LbRrNode>,
    pub ext_src: usize,
    pub ext_sink: usize,
    pub ext_rr: usize,
}

impl LbRrGraph {
    pub fn is_external_node(&self, inode: usize) -> bool {
        inode == self.ext_src || inode == self.ext_sink || inode == self.ext_rr
    }

    /// RR source node of a primitive output pin.
    pub fn pin_source_rr(&self, pin: PbPinId) -> usize {
        debug_assert!(matches!(self.nodes[pin.0].kind, LbRrKind::Source));
        pin.0
    }

    /// RR sink behind a primitive input pin; one edge past the pin so that
    /// logically equivalent pins funnel into the shared sink.
    pub fn pin_sink_rr(&self, pin: PbPinId) -> usize {
        let node = &self.nodes[pin.0];
        debug_assert!(matches!(node.kind, LbRrKind::Intermediate));
        debug_assert_eq!(node.num_modes(), 1);
        debug_assert_eq!(node.num_fanout(0), 1);
        let sink = node.outedges[0][0].to;
        debug_assert!(matches!(self.nodes[sink].kind, LbRrKind::Sink));
        sink
    }
}

pub fn build_lb_rr_graph(arch: &Arch, graph: &PbGraph) -> LbRrGraph {
    let block_type = arch.block_type(graph.block_type);

    let mut nodes: Vec<LbRrNode> = (0..graph.total_pb_pins)
        .map(|_| LbRrNode::new(LbRrKind::Intermediate, 0, 1))
        .collect();

    load_nodes_for_pb_node(arch, graph, graph.root, &mut nodes);

    /* Synthetic boundary nodes follow every pin and sink node. */
    let ext_src = nodes.len();
    nodes.push(LbRrNode::new(LbRrKind::Source, 0, 1));
    let ext_sink = nodes.len();
    nodes.push(LbRrNode::new(LbRrKind::Sink, 0, 1));
    let ext_rr = nodes.len();
    nodes.push(LbRrNode::new(LbRrKind::Intermediate, 0, 1));

    for pin_id in graph.node_pins(graph.root) {
        let pin = graph.pin(pin_id);
        if pin_fc(block_type, graph, arch, pin_id) == 0. {
            continue;
        }
        match pin.dir {
            PortDir::Output => {
                nodes[pin_id.0].outedges[0].push(LbRrEdge {
                    to: ext_rr,
                    intrinsic_cost: EXTERNAL_INTERCONNECT_COST,
                });
                nodes[ext_rr].capacity += 1;
                nodes[ext_sink].capacity += 1;
            }
            PortDir::Input | PortDir::Clock => {
                nodes[ext_rr].outedges[0].push(LbRrEdge {
                    to: pin_id.0,
                    intrinsic_cost: EXTERNAL_INTERCONNECT_COST,
                });
                nodes[ext_rr].capacity += 1;
                nodes[ext_src].capacity += 1;
            }
        }
    }

    nodes[ext_src].outedges[0].push(LbRrEdge {
        to: ext_rr,
        intrinsic_cost: EXTERNAL_INTERCONNECT_COST,
    });
    nodes[ext_rr].outedges[0].push(LbRrEdge {
        to: ext_sink,
        intrinsic_cost: EXTERNAL_INTERCONNECT_COST,
    });

    LbRrGraph {
        nodes,
        ext_src,
        ext_sink,
        ext_rr,
    }
}

fn pin_fc(block_type: &BlockType, graph: &PbGraph, arch: &Arch, pin: PbPinId) -> f32 {
    let port_name = &graph.pin_port(arch, pin).name;
    block_type
        .fc
        .iter()
        .filter(|spec| spec.ports.iter().any(|p| p == port_name))
        .map(|spec| spec.fc)
        .fold(None, |acc: Option<f32>, fc| {
            Some(acc.map(|a| a.max(fc)).unwrap_or(fc))
        })
        .unwrap_or(1.) /* unlisted ports are connected */
}

fn load_nodes_for_pb_node(
    arch: &Arch,
    graph: &PbGraph,
    node_id: PbNodeId,
    nodes: &mut Vec<LbRrNode>,
) {
    let node = graph.node(node_id);
    let pb_type = arch.pb_type(node.pb_type);
    let parent_num_modes = node
        .parent
        .map(|p| arch.pb_type(graph.node(p).pb_type).modes.len())
        .unwrap_or(1);

    if pb_type.is_primitive() {
        for (iport, port) in pb_type.ports.iter().enumerate() {
            match port.dir {
                PortDir::Input | PortDir::Clock => {
                    /* Pins funnel into sinks; an equivalent port (full or
                     * instance) shares one sink of port-width capacity. */
                    let mut sink_index = None;
                    for pin_id in node.pins_by_port[iport].iter().copied() {
                        let equivalent = port.equivalence != PortEquivalence::None;
                        if !equivalent || sink_index.is_none() {
                            let capacity = if equivalent { port.width } else { 1 };
                            let mut sink = LbRrNode::new(LbRrKind::Sink, capacity, 1);
                            sink.intrinsic_cost = 0.;
                            sink_index = Some(nodes.len());
                            nodes.push(sink);
                        }
                        let pin_node = &mut nodes[pin_id.0];
                        *pin_node = LbRrNode::new(LbRrKind::Intermediate, 1, 1);
                        pin_node.pb_pin = Some(pin_id);
                        pin_node.outedges[0].push(LbRrEdge {
                            to: sink_index.unwrap(),
                            intrinsic_cost: INTERNAL_INTERCONNECT_COST,
                        });
                    }
                }
                PortDir::Output => {
                    for pin_id in node.pins_by_port[iport].iter().copied() {
                        let mut rr_node =
                            LbRrNode::new(LbRrKind::Source, 1, parent_num_modes);
                        rr_node.pb_pin = Some(pin_id);
                        load_pb_edges(graph, pin_id, &mut rr_node);
                        nodes[pin_id.0] = rr_node;
                    }
                }
            }
        }
    } else {
        for imode in 0..node.children.len() {
            for by_type in &node.children[imode] {
                for child in by_type {
                    load_nodes_for_pb_node(arch, graph, *child, nodes);
                }
            }
        }

        let own_num_modes = pb_type.modes.len();
        for (iport, port) in pb_type.ports.iter().enumerate() {
            for pin_id in node.pins_by_port[iport].iter().copied() {
                let num_modes = match port.dir {
                    /* Input and clock pins fan out under this node's modes;
                     * output pins under the parent's (one for the root, whose
                     * outputs only reach the boundary). */
                    PortDir::Input | PortDir::Clock => own_num_modes,
                    PortDir::Output => {
                        if node.parent.is_none() {
                            1
                        } else {
                            parent_num_modes
                        }
                    }
                };
                let mut rr_node = LbRrNode::new(LbRrKind::Intermediate, 1, num_modes);
                rr_node.pb_pin = Some(pin_id);
                if !(port.dir == PortDir::Output && node.parent.is_none()) {
                    load_pb_edges(graph, pin_id, &mut rr_node);
                }
                nodes[pin_id.0] = rr_node;
            }
        }
    }
}

fn load_pb_edges(graph: &PbGraph, pin_id: PbPinId, rr_node: &mut LbRrNode) {
    for edge in &graph.pin(pin_id).out_edges {
        debug_assert!(edge.mode < rr_node.num_modes());
        rr_node.outedges[edge.mode].push(LbRrEdge {
            to: edge.pin.0,
            intrinsic_cost: INTERNAL_INTERCONNECT_COST,
        });
    }
}

/**************************************************************************
 * Reachability precomputation
 **************************************************************************/

/// For every RR node: the external sources it can be reached from and the
/// external sinks it can reach. Traversal runs over the union of all modes'
/// edges; boundary paths pass through ext_rr regardless of internal mode
/// choices, so the union is exact here.
pub struct LbRrGraphInfo {
    external_sources_reaching: Vec<BTreeSet<usize>>,
    external_sinks_reachable: Vec<BTreeSet<usize>>,
}

impl LbRrGraphInfo {
    pub fn external_sources_reaching(&self, inode: usize) -> &BTreeSet<usize> {
        &self.external_sources_reaching[inode]
    }

    pub fn external_sinks_reachable(&self, inode: usize) -> &BTreeSet<usize> {
        &self.external_sinks_reachable[inode]
    }
}

pub fn build_lb_rr_graph_info(rr_graph: &LbRrGraph) -> LbRrGraphInfo {
    let n = rr_graph.nodes.len();
    let mut sources_reaching = vec![BTreeSet::new(); n];
    let mut sinks_reachable = vec![BTreeSet::new(); n];

    /* Forward sweep from the external source. */
    let mut stack = vec![rr_graph.ext_src];
    let mut seen = vec![false; n];
    seen[rr_graph.ext_src] = true;
    while let Some(cur) = stack.pop() {
        sources_reaching[cur].insert(rr_graph.ext_src);
        for edges in &rr_graph.nodes[cur].outedges {
            for edge in edges {
                if !seen[edge.to] {
                    seen[edge.to] = true;
                    stack.push(edge.to);
                }
            }
        }
    }

    /* Backward sweep from the external sink over reversed edges. */
    let mut rev = vec![Vec::new(); n];
    for (from, node) in rr_graph.nodes.iter().enumerate() {
        for edges in &node.outedges {
            for edge in edges {
                rev[edge.to].push(from);
            }
        }
    }
    let mut stack = vec![rr_graph.ext_sink];
    let mut seen = vec![false; n];
    seen[rr_graph.ext_sink] = true;
    while let Some(cur) = stack.pop() {
        sinks_reachable[cur].insert(rr_graph.ext_sink);
        for &from in &rev[cur] {
            if !seen[from] {
                seen[from] = true;
                stack.push(from);
            }
        }
    }

    LbRrGraphInfo {
        external_sources_reaching: sources_reaching,
        external_sinks_reachable: sinks_reachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{build_pb_graphs, ArchSpec};

    fn lut_clb() -> (Arch, Vec<PbGraph>) {
        let spec: ArchSpec = serde_yaml::from_str(
            r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: in, dir: input, width: 8}
        - {name: out, dir: output, width: 4}
        - {name: clk, dir: clock, width: 1}
      modes:
        - name: default
          children:
            - pb_type:
                name: ble
                ports:
                  - {name: in, dir: input, width: 4}
                  - {name: out, dir: output, width: 1}
                modes:
                  - name: lut
                    children:
                      - pb_type:
                          name: lut4
                          model: .names
                          ports:
                            - {name: in, dir: input, width: 4, equivalence: full}
                            - {name: out, dir: output, width: 1}
                    interconnect:
                      - {kind: direct, from: [parent.in], to: [lut4.in]}
                      - {kind: direct, from: [lut4.out], to: [parent.out]}
              count: 4
          interconnect:
            - {kind: complete, from: [parent.in], to: [ble.in]}
            - {kind: direct, from: [ble.out], to: [parent.out]}
"#,
        )
        .unwrap();
        let arch = spec.compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        (arch, graphs)
    }

    #[test]
    fn test_node_counts_and_order() {
        let (arch, graphs) = lut_clb();
        let rr = build_lb_rr_graph(&arch, &graphs[0]);
        /* 33 pins + 4 shared lut-input sinks + 3 externals */
        assert_eq!(rr.nodes.len(), graphs[0].total_pb_pins + 4 + 3);
        assert_eq!(rr.ext_src, graphs[0].total_pb_pins + 4);
        assert_eq!(rr.ext_sink, rr.ext_src + 1);
        assert_eq!(rr.ext_rr, rr.ext_sink + 1);
    }

    #[test]
    fn test_equivalent_port_shares_sink() {
        let (arch, graphs) = lut_clb();
        let g = &graphs[0];
        let rr = build_lb_rr_graph(&arch, g);

        let lut = g.primitives(&arch).next().unwrap();
        let in_pins = &g.node(lut).pins_by_port[0];
        let sink = rr.pin_sink_rr(in_pins[0]);
        for pin in in_pins {
            assert_eq!(rr.pin_sink_rr(*pin), sink);
        }
        assert_eq!(rr.nodes[sink].capacity, 4);
    }

    #[test]
    fn test_instance_equivalent_port_shares_sink() {
        let spec: ArchSpec = serde_yaml::from_str(
            r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: in, dir: input, width: 3}
        - {name: out, dir: output, width: 1}
      modes:
        - name: default
          children:
            - pb_type:
                name: lut3
                model: .names
                ports:
                  - {name: in, dir: input, width: 3, equivalence: instance}
                  - {name: out, dir: output, width: 1}
          interconnect:
            - {kind: direct, from: [parent.in], to: [lut3.in]}
            - {kind: direct, from: [lut3.out], to: [parent.out]}
"#,
        )
        .unwrap();
        let arch = spec.compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        let rr = build_lb_rr_graph(&arch, g);

        /* instance equivalence funnels into one sink just like full */
        let lut = g.primitives(&arch).next().unwrap();
        let in_pins = &g.node(lut).pins_by_port[0];
        let sink = rr.pin_sink_rr(in_pins[0]);
        for pin in in_pins {
            assert_eq!(rr.pin_sink_rr(*pin), sink);
        }
        assert_eq!(rr.nodes[sink].capacity, 3);
    }

    #[test]
    fn test_external_capacities() {
        let (arch, graphs) = lut_clb();
        let rr = build_lb_rr_graph(&arch, &graphs[0]);
        /* 8 data inputs + 1 clock feed from ext_src, 4 outputs feed the
         * ext_sink, and ext_rr carries both directions. */
        assert_eq!(rr.nodes[rr.ext_src].capacity, 9);
        assert_eq!(rr.nodes[rr.ext_sink].capacity, 4);
        assert_eq!(rr.nodes[rr.ext_rr].capacity, 13);
    }

    #[test]
    fn test_zero_fc_pins_not_connected() {
        let spec: ArchSpec = serde_yaml::from_str(
            r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: in, dir: input, width: 2}
        - {name: out, dir: output, width: 1}
      modes:
        - name: default
          children:
            - pb_type:
                name: lut2
                model: .names
                ports:
                  - {name: in, dir: input, width: 2}
                  - {name: out, dir: output, width: 1}
          interconnect:
            - {kind: direct, from: [parent.in], to: [lut2.in]}
            - {kind: direct, from: [lut2.out], to: [parent.out]}
    fc: [{ports: [in], fc: 0.0}]
"#,
        )
        .unwrap();
        let arch = spec.compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        let rr = build_lb_rr_graph(&arch, g);
        /* No inputs can enter the cluster: ext_src feeds nothing. */
        assert_eq!(rr.nodes[rr.ext_src].capacity, 0);
        assert_eq!(rr.nodes[rr.ext_rr].num_fanout(0), 1); /* only ext_sink */
        assert_eq!(rr.nodes[rr.ext_sink].capacity, 1);
    }

    #[test]
    fn test_reachability_through_boundary() {
        let (arch, graphs) = lut_clb();
        let g = &graphs[0];
        let rr = build_lb_rr_graph(&arch, g);
        let info = build_lb_rr_graph_info(&rr);

        let lut = g.primitives(&arch).next().unwrap();
        let lut_in_sink = rr.pin_sink_rr(g.node(lut).pins_by_port[0][0]);
        let lut_out_src = rr.pin_source_rr(g.node(lut).pins_by_port[1][0]);

        assert!(info
            .external_sources_reaching(lut_in_sink)
            .contains(&rr.ext_src));
        assert!(info
            .external_sinks_reachable(lut_out_src)
            .contains(&rr.ext_sink));
        /* An external source cannot "reach" the lut output source node. */
        assert!(info
            .external_sources_reaching(lut_out_src)
            .is_empty());
    }
}
