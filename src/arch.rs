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

/* Architecture model for complex logic blocks.
 *
 * A block type is a tree of pb_types: composites carry modes (each mode lists
 * child pb_types and the interconnect wiring them), leaves are primitives with
 * a behavioral model name. For packing, every block type is flattened once
 * into a PbGraph: one PbGraphNode per instantiated pb_type, one PbGraphPin
 * per physical pin, pins numbered consecutively so the pin id doubles as the
 * index of the matching routing-resource node.
 */

use std::collections::HashMap;

use crate::errors::PackError;
#[allow(unused)]
use crate::log::*;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PbTypeId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockTypeId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PbNodeId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PbPinId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDir {
    Input,
    Output,
    Clock,
}

impl PortDir {
    pub fn is_input_side(self) -> bool {
        matches!(self, PortDir::Input | PortDir::Clock)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortEquivalence {
    None,
    Full,
    Instance,
}

impl Default for PortEquivalence {
    fn default() -> Self {
        PortEquivalence::None
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbClass {
    Normal,
    Memory,
}

impl Default for PbClass {
    fn default() -> Self {
        PbClass::Normal
    }
}

pub struct Port {
    pub name: String,
    pub dir: PortDir,
    pub width: usize,
    pub equivalence: PortEquivalence,
    /* Role tag of the port ("data", "address", ...). Ports sharing a tag
     * share a pin class at every ancestor; "data"-prefixed tags are exempt
     * from the memory-sibling net equality rule. */
    pub class_tag: Option<String>,
}

impl Port {
    pub fn is_data(&self) -> bool {
        self.class_tag
            .as_deref()
            .map(|t| t.starts_with("data"))
            .unwrap_or(false)
    }
}

pub struct PbType {
    pub name: String,
    pub model: Option<String>,
    pub class: PbClass,
    pub ports: Vec<Port>,
    pub modes: Vec<Mode>,
}

impl PbType {
    pub fn is_primitive(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }
}

pub struct Mode {
    pub name: String,
    pub children: Vec<ModeChild>,
    pub interconnect: Vec<IcEdge>,
}

pub struct ModeChild {
    pub pb_type: PbTypeId,
    pub count: usize,
}

/* One already-expanded single-bit interconnect edge inside a mode. */
pub struct IcEdge {
    pub from: PinRef,
    pub to: PinRef,
    pub pack_patterns: Vec<String>,
    pub infer_pattern: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PinRef {
    pub block: BlockRef,
    pub port: usize,
    pub pin: usize,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockRef {
    Parent,
    Child { child: usize, instance: usize },
}

pub struct FcSpec {
    pub ports: Vec<String>,
    pub fc: f32,
}

pub struct BlockType {
    pub name: String,
    pub pb_type: PbTypeId,
    pub fc: Vec<FcSpec>,
    /* Device instances available for this type; used by the block-type
     * utilization balancing heuristic when opening a new cluster. */
    pub instances: usize,
}

pub struct Arch {
    pub pb_types: Vec<PbType>,
    pub block_types: Vec<BlockType>,
}

impl Arch {
    pub fn pb_type(&self, id: PbTypeId) -> &PbType {
        &self.pb_types[id.0]
    }

    pub fn block_type(&self, id: BlockTypeId) -> &BlockType {
        &self.block_types[id.0]
    }

    /// Block types whose flattened tree contains a primitive of the given
    /// behavioral model. The clusterer uses this to pick candidate types
    /// for a seed molecule.
    pub fn candidate_block_types(&self, model: &str) -> Vec<BlockTypeId> {
        self.block_types
            .iter()
            .enumerate()
            .filter(|(_, bt)| self.pb_type_contains_model(bt.pb_type, model))
            .map(|(i, _)| BlockTypeId(i))
            .collect()
    }

    fn pb_type_contains_model(&self, id: PbTypeId, model: &str) -> bool {
        let pb_type = self.pb_type(id);
        if pb_type.is_primitive() {
            return pb_type.model.as_deref() == Some(model);
        }
        pb_type.modes.iter().any(|mode| {
            mode.children
                .iter()
                .any(|c| self.pb_type_contains_model(c.pb_type, model))
        })
    }
}

/**************************************************************************
 * Flattened per-block-type graph
 **************************************************************************/

pub struct PinClass {
    pub tag: Option<String>,
    pub num_pins: usize,
}

pub struct PbGraphNode {
    pub pb_type: PbTypeId,
    pub parent: Option<PbNodeId>,
    /* Mode of the parent under which this child sits (0 for the root). */
    pub parent_mode: usize,
    /* Index of this node's child slot within the parent mode's child list. */
    pub child_type_index: usize,
    pub placement_index: usize,
    pub depth: usize,
    /* children[mode][child_type][instance] */
    pub children: Vec<Vec<Vec<PbNodeId>>>,
    /* pins_by_port is aligned with the pb_type's port list */
    pub pins_by_port: Vec<Vec<PbPinId>>,
    /* Class 0 is always the per-direction default (untagged) class. */
    pub input_pin_classes: Vec<PinClass>,
    pub output_pin_classes: Vec<PinClass>,
    /* Number of primitives of this node's pb_type in the whole cluster. */
    pub total_primitive_count: usize,
}

impl PbGraphNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

pub struct PbGraphEdge {
    pub pin: PbPinId,
    /* Mode index of the pb_graph_node owning the interconnect. */
    pub mode: usize,
    pub pack_patterns: Vec<String>,
    pub infer_pattern: bool,
}

pub struct PbGraphPin {
    pub node: PbNodeId,
    pub port: usize,
    pub dir: PortDir,
    pub pin_number: usize,
    pub pin_count_in_cluster: usize,
    pub out_edges: Vec<PbGraphEdge>,
    pub in_edges: Vec<PbGraphEdge>,
    /* For primitive output pins: primitive input/clock pins reachable without
     * leaving the ancestor at depth d, indexed by d. Routability pruning. */
    pub connectable_input_pins: Vec<Vec<PbPinId>>,
    /* Pin class of this pin at the ancestor of depth d, indexed by d.
     * None where the ancestor is a primitive or depth is below this node. */
    pub parent_pin_class: Vec<Option<usize>>,
}

pub struct PbGraph {
    pub block_type: BlockTypeId,
    pub root: PbNodeId,
    pub nodes: Vec<PbGraphNode>,
    pub pins: Vec<PbGraphPin>,
    pub total_pb_pins: usize,
    pub max_depth: usize,
    pub max_primitives: usize,
}

impl PbGraph {
    pub fn node(&self, id: PbNodeId) -> &PbGraphNode {
        &self.nodes[id.0]
    }

    pub fn pin(&self, id: PbPinId) -> &PbGraphPin {
        &self.pins[id.0]
    }

    pub fn is_primitive(&self, arch: &Arch, node: PbNodeId) -> bool {
        arch.pb_type(self.node(node).pb_type).is_primitive()
    }

    pub fn node_pins<'a>(&'a self, node: PbNodeId) -> impl Iterator<Item = PbPinId> + 'a {
        self.node(node)
            .pins_by_port
            .iter()
            .flat_map(|pins| pins.iter().copied())
    }

    pub fn pin_port<'a>(&self, arch: &'a Arch, pin: PbPinId) -> &'a Port {
        let p = self.pin(pin);
        &arch.pb_type(self.node(p.node).pb_type).ports[p.port]
    }

    /// Resolve a primitive's pin by model port name and bit index.
    pub fn primitive_pin(
        &self,
        arch: &Arch,
        node: PbNodeId,
        port_name: &str,
        bit: usize,
    ) -> Option<PbPinId> {
        let pb_type = arch.pb_type(self.node(node).pb_type);
        let port = pb_type.port_index(port_name)?;
        self.node(node).pins_by_port[port].get(bit).copied()
    }

    pub fn ancestor_at_depth(&self, node: PbNodeId, depth: usize) -> Option<PbNodeId> {
        let mut cur = node;
        loop {
            let n = self.node(cur);
            if n.depth == depth {
                return Some(cur);
            }
            cur = n.parent?;
        }
    }

    pub fn is_under(&self, node: PbNodeId, ancestor: PbNodeId) -> bool {
        let mut cur = Some(node);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.node(c).parent;
        }
        false
    }

    pub fn primitives<'a>(&'a self, arch: &'a Arch) -> impl Iterator<Item = PbNodeId> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| arch.pb_type(n.pb_type).is_primitive())
            .map(|(i, _)| PbNodeId(i))
    }

    /// Primitive input pins where a forced-pack chain may start: pins carrying
    /// the pattern on an in-edge whose tagged backward walk dead-ends without
    /// reaching another primitive output (i.e. the chain enters the cluster
    /// from the fabric or a tie-off).
    pub fn pattern_chain_roots(&self, arch: &Arch, pattern: &str) -> Vec<PbPinId> {
        let mut roots = Vec::new();
        for (ipin, pin) in self.pins.iter().enumerate() {
            if !arch.pb_type(self.node(pin.node).pb_type).is_primitive() {
                continue;
            }
            if !pin.dir.is_input_side() {
                continue;
            }
            if !pin
                .in_edges
                .iter()
                .any(|e| e.pack_patterns.iter().any(|p| p == pattern))
            {
                continue;
            }
            if !self.tagged_walk_reaches_primitive(arch, PbPinId(ipin), pattern) {
                roots.push(PbPinId(ipin));
            }
        }
        roots
    }

    fn tagged_walk_reaches_primitive(&self, arch: &Arch, from: PbPinId, pattern: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.pins.len()];
        while let Some(cur) = stack.pop() {
            if seen[cur.0] {
                continue;
            }
            seen[cur.0] = true;
            for edge in &self.pins[cur.0].in_edges {
                if !edge.pack_patterns.iter().any(|p| p == pattern) {
                    continue;
                }
                let src = self.pin(edge.pin);
                if arch.pb_type(self.node(src.node).pb_type).is_primitive()
                    && src.dir == PortDir::Output
                {
                    return true;
                }
                stack.push(edge.pin);
            }
        }
        false
    }
}

/* PbGraph construction */

struct GraphBuilder<'a> {
    arch: &'a Arch,
    nodes: Vec<PbGraphNode>,
    pins: Vec<PbGraphPin>,
    primitive_counts: HashMap<PbTypeId, usize>,
    max_depth: usize,
}

impl<'a> GraphBuilder<'a> {
    fn build(arch: &'a Arch, block_type: BlockTypeId) -> PbGraph {
        let mut builder = GraphBuilder {
            arch,
            nodes: Vec::new(),
            pins: Vec::new(),
            primitive_counts: HashMap::new(),
            max_depth: 0,
        };

        let root_type = arch.block_type(block_type).pb_type;
        let root = builder.instantiate(root_type, None, 0, 0, 0, 0);
        builder.load_interconnect(root);

        let total_pb_pins = builder.pins.len();
        let max_primitives: usize = builder.primitive_counts.values().sum();

        let mut graph = PbGraph {
            block_type,
            root,
            nodes: builder.nodes,
            pins: builder.pins,
            total_pb_pins,
            max_depth: builder.max_depth,
            max_primitives,
        };

        for node in graph.nodes.iter_mut() {
            if let Some(count) = builder.primitive_counts.get(&node.pb_type) {
                node.total_primitive_count = *count;
            }
        }

        load_pin_classes(arch, &mut graph);
        load_connectable_input_pins(arch, &mut graph);

        graph
    }

    fn instantiate(
        &mut self,
        pb_type_id: PbTypeId,
        parent: Option<PbNodeId>,
        parent_mode: usize,
        child_type_index: usize,
        placement_index: usize,
        depth: usize,
    ) -> PbNodeId {
        let pb_type = self.arch.pb_type(pb_type_id);
        let node_id = PbNodeId(self.nodes.len());
        self.max_depth = self.max_depth.max(depth);

        let mut pins_by_port = Vec::with_capacity(pb_type.ports.len());
        for (iport, port) in pb_type.ports.iter().enumerate() {
            let mut pins = Vec::with_capacity(port.width);
            for pin_number in 0..port.width {
                let pin_id = PbPinId(self.pins.len());
                self.pins.push(PbGraphPin {
                    node: node_id,
                    port: iport,
                    dir: port.dir,
                    pin_number,
                    pin_count_in_cluster: pin_id.0,
                    out_edges: Vec::new(),
                    in_edges: Vec::new(),
                    connectable_input_pins: Vec::new(),
                    parent_pin_class: Vec::new(),
                });
                pins.push(pin_id);
            }
            pins_by_port.push(pins);
        }

        self.nodes.push(PbGraphNode {
            pb_type: pb_type_id,
            parent,
            parent_mode,
            child_type_index,
            placement_index,
            depth,
            children: Vec::new(),
            pins_by_port,
            input_pin_classes: Vec::new(),
            output_pin_classes: Vec::new(),
            total_primitive_count: 0,
        });

        if pb_type.is_primitive() {
            *self.primitive_counts.entry(pb_type_id).or_insert(0) += 1;
        }

        let num_modes = pb_type.modes.len();
        let mut children = Vec::with_capacity(num_modes);
        for imode in 0..num_modes {
            let num_child_types = self.arch.pb_type(pb_type_id).modes[imode].children.len();
            let mut by_type = Vec::with_capacity(num_child_types);
            for ichild in 0..num_child_types {
                let child = &self.arch.pb_type(pb_type_id).modes[imode].children[ichild];
                let (child_type, count) = (child.pb_type, child.count);
                let mut instances = Vec::with_capacity(count);
                for inst in 0..count {
                    instances.push(self.instantiate(
                        child_type,
                        Some(node_id),
                        imode,
                        ichild,
                        inst,
                        depth + 1,
                    ));
                }
                by_type.push(instances);
            }
            children.push(by_type);
        }
        self.nodes[node_id.0].children = children;

        node_id
    }

    /* Expands every mode's interconnect of every composite node into
     * pb-graph edges attached to the concrete driver and sink pins. */
    fn load_interconnect(&mut self, node_id: PbNodeId) {
        let pb_type_id = self.nodes[node_id.0].pb_type;
        let num_modes = self.arch.pb_type(pb_type_id).modes.len();

        for imode in 0..num_modes {
            let num_edges = self.arch.pb_type(pb_type_id).modes[imode].interconnect.len();
            for iedge in 0..num_edges {
                let (from, to, patterns, infer) = {
                    let edge = &self.arch.pb_type(pb_type_id).modes[imode].interconnect[iedge];
                    (edge.from, edge.to, edge.pack_patterns.clone(), edge.infer_pattern)
                };
                let from_pin = self.resolve_pin(node_id, imode, from);
                let to_pin = self.resolve_pin(node_id, imode, to);

                self.pins[from_pin.0].out_edges.push(PbGraphEdge {
                    pin: to_pin,
                    mode: imode,
                    pack_patterns: patterns.clone(),
                    infer_pattern: infer,
                });
                self.pins[to_pin.0].in_edges.push(PbGraphEdge {
                    pin: from_pin,
                    mode: imode,
                    pack_patterns: patterns,
                    infer_pattern: infer,
                });
            }
        }

        let num_children: Vec<PbNodeId> = self.nodes[node_id.0]
            .children
            .iter()
            .flat_map(|t| t.iter().flat_map(|i| i.iter().copied()))
            .collect();
        for child in num_children {
            self.load_interconnect(child);
        }
    }

    fn resolve_pin(&self, node_id: PbNodeId, mode: usize, pin_ref: PinRef) -> PbPinId {
        let target_node = match pin_ref.block {
            BlockRef::Parent => node_id,
            BlockRef::Child { child, instance } => {
                self.nodes[node_id.0].children[mode][child][instance]
            }
        };
        self.nodes[target_node.0].pins_by_port[pin_ref.port][pin_ref.pin]
    }
}

fn load_pin_classes(arch: &Arch, graph: &mut PbGraph) {
    /* Per composite node: class 0 is the per-direction default; one further
     * class per distinct port class tag. */
    for node in graph.nodes.iter_mut() {
        let pb_type = arch.pb_type(node.pb_type);
        if pb_type.is_primitive() {
            continue;
        }
        node.input_pin_classes = build_classes(pb_type, true);
        node.output_pin_classes = build_classes(pb_type, false);
    }

    /* Resolve every primitive pin's class at each ancestor depth. */
    for ipin in 0..graph.pins.len() {
        let node = graph.pins[ipin].node;
        if !arch.pb_type(graph.node(node).pb_type).is_primitive() {
            continue;
        }
        let tag = graph.pin_port(arch, PbPinId(ipin)).class_tag.clone();
        let input_side = graph.pins[ipin].dir.is_input_side();

        let mut classes = vec![None; graph.max_depth + 1];
        let mut ancestor = graph.node(node).parent;
        while let Some(anc) = ancestor {
            let anc_node = graph.node(anc);
            let list = if input_side {
                &anc_node.input_pin_classes
            } else {
                &anc_node.output_pin_classes
            };
            let class = list
                .iter()
                .position(|c| c.tag == tag)
                .unwrap_or(0 /* default class */);
            classes[anc_node.depth] = Some(class);
            ancestor = anc_node.parent;
        }
        graph.pins[ipin].parent_pin_class = classes;
    }
}

fn build_classes(pb_type: &PbType, input_side: bool) -> Vec<PinClass> {
    let mut classes = vec![PinClass { tag: None, num_pins: 0 }];
    for port in &pb_type.ports {
        if port.dir.is_input_side() != input_side {
            continue;
        }
        match &port.class_tag {
            None => classes[0].num_pins += port.width,
            Some(tag) => {
                if let Some(class) = classes.iter_mut().find(|c| c.tag.as_deref() == Some(tag)) {
                    class.num_pins += port.width;
                } else {
                    classes.push(PinClass {
                        tag: Some(tag.clone()),
                        num_pins: port.width,
                    });
                }
            }
        }
    }
    classes
}

fn load_connectable_input_pins(arch: &Arch, graph: &mut PbGraph) {
    let primitive_outputs: Vec<PbPinId> = graph
        .pins
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            p.dir == PortDir::Output && arch.pb_type(graph.node(p.node).pb_type).is_primitive()
        })
        .map(|(i, _)| PbPinId(i))
        .collect();

    for out_pin in primitive_outputs {
        let node = graph.pin(out_pin).node;
        let node_depth = graph.node(node).depth;
        let mut per_depth = vec![Vec::new(); graph.max_depth + 1];

        for depth in 0..node_depth {
            if let Some(ancestor) = graph.ancestor_at_depth(node, depth) {
                per_depth[depth] = connectable_under(arch, graph, out_pin, ancestor);
            }
        }
        graph.pins[out_pin.0].connectable_input_pins = per_depth;
    }
}

/* DFS over all modes' edges, refusing to step outside the ancestor subtree.
 * Collects the primitive input pins reached; traversal ends at them. */
fn connectable_under(
    arch: &Arch,
    graph: &PbGraph,
    from: PbPinId,
    ancestor: PbNodeId,
) -> Vec<PbPinId> {
    let mut reached = Vec::new();
    let mut seen = vec![false; graph.pins.len()];
    let mut stack = vec![from];
    seen[from.0] = true;

    while let Some(cur) = stack.pop() {
        for edge in &graph.pin(cur).out_edges {
            let next = edge.pin;
            if seen[next.0] {
                continue;
            }
            let next_node = graph.pin(next).node;
            if !graph.is_under(next_node, ancestor) {
                continue;
            }
            seen[next.0] = true;
            let primitive = arch.pb_type(graph.node(next_node).pb_type).is_primitive();
            if primitive && graph.pin(next).dir.is_input_side() {
                reached.push(next);
            } else {
                stack.push(next);
            }
        }
    }

    reached.sort();
    reached
}

pub fn build_pb_graphs(arch: &Arch) -> Vec<PbGraph> {
    (0..arch.block_types.len())
        .map(|i| GraphBuilder::build(arch, BlockTypeId(i)))
        .collect()
}

/**************************************************************************
 * Serde specification layer
 **************************************************************************/

#[derive(Serialize, Deserialize, Clone)]
pub struct ArchSpec {
    pub block_types: Vec<BlockTypeSpec>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct BlockTypeSpec {
    pub pb_type: PbTypeSpec,
    #[serde(default)]
    pub fc: Vec<FcSpecEntry>,
    #[serde(default)]
    pub instances: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct FcSpecEntry {
    pub ports: Vec<String>,
    pub fc: f32,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PbTypeSpec {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub class: PbClass,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub modes: Vec<ModeSpec>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PortSpec {
    pub name: String,
    pub dir: PortDir,
    pub width: usize,
    #[serde(default)]
    pub equivalence: PortEquivalence,
    #[serde(default)]
    pub class: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ModeSpec {
    pub name: String,
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub interconnect: Vec<InterconnectSpec>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ChildSpec {
    pub pb_type: PbTypeSpec,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcKind {
    Direct,
    Complete,
    Mux,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct InterconnectSpec {
    pub kind: IcKind,
    pub from: Vec<String>,
    pub to: Vec<String>,
    #[serde(default)]
    pub pack_pattern: Vec<String>,
    #[serde(default)]
    pub infer_pattern: bool,
}

impl ArchSpec {
    pub fn compile(&self) -> Result<Arch, PackError> {
        let mut arch = Arch {
            pb_types: Vec::new(),
            block_types: Vec::new(),
        };
        for bt in &self.block_types {
            let pb_type = intern_pb_type(&mut arch, &bt.pb_type)?;
            arch.block_types.push(BlockType {
                name: bt.pb_type.name.clone(),
                pb_type,
                fc: bt
                    .fc
                    .iter()
                    .map(|f| FcSpec {
                        ports: f.ports.clone(),
                        fc: f.fc,
                    })
                    .collect(),
                instances: bt.instances.unwrap_or(usize::MAX),
            });
        }
        Ok(arch)
    }
}

fn intern_pb_type(arch: &mut Arch, spec: &PbTypeSpec) -> Result<PbTypeId, PackError> {
    if spec.modes.is_empty() && spec.model.is_none() {
        return Err(PackError::MalformedInput(format!(
            "primitive pb_type '{}' has no model",
            spec.name
        )));
    }

    let ports: Vec<Port> = spec
        .ports
        .iter()
        .map(|p| Port {
            name: p.name.clone(),
            dir: p.dir,
            width: p.width,
            equivalence: p.equivalence,
            class_tag: p.class.clone(),
        })
        .collect();

    let mut modes = Vec::with_capacity(spec.modes.len());
    for mode_spec in &spec.modes {
        let mut children = Vec::with_capacity(mode_spec.children.len());
        let mut child_types = Vec::with_capacity(mode_spec.children.len());
        for child in &mode_spec.children {
            let id = intern_pb_type(arch, &child.pb_type)?;
            children.push(ModeChild {
                pb_type: id,
                count: child.count,
            });
            child_types.push((child.pb_type.name.clone(), id, child.count));
        }

        let mut interconnect = Vec::new();
        for ic in &mode_spec.interconnect {
            expand_interconnect(arch, spec, &child_types, ic, &mut interconnect)?;
        }

        modes.push(Mode {
            name: mode_spec.name.clone(),
            children,
            interconnect,
        });
    }

    let id = PbTypeId(arch.pb_types.len());
    arch.pb_types.push(PbType {
        name: spec.name.clone(),
        model: spec.model.clone(),
        class: spec.class,
        ports,
        modes,
    });
    Ok(id)
}

/* A parsed "block[inst].port[pin]" reference before instance expansion;
 * block instance and pin index are both optional and default to "all". */
struct RawPinRef {
    child: Option<(usize, Option<usize>)>, /* (child index, instance or all) */
    port: usize,
    pin_lo: usize,
    pin_count: usize,
}

fn split_indexed(text: &str) -> Result<(&str, Option<usize>), PackError> {
    match text.split_once('[') {
        Some((name, rest)) => {
            let idx = rest.trim_end_matches(']').parse::<usize>().map_err(|_| {
                PackError::MalformedInput(format!("bad index in '{}'", text))
            })?;
            Ok((name, Some(idx)))
        }
        None => Ok((text, None)),
    }
}

fn parse_port_ref(
    arch: &Arch,
    parent: &PbTypeSpec,
    child_types: &[(String, PbTypeId, usize)],
    text: &str,
) -> Result<RawPinRef, PackError> {
    let (block_text, port_text) = text.rsplit_once('.').ok_or_else(|| {
        PackError::MalformedInput(format!("port reference '{}' is missing '.'", text))
    })?;

    let (block_name, instance) = split_indexed(block_text)?;
    let (port_name, pin) = split_indexed(port_text)?;

    let (child, port, width) = if block_name == "parent" || block_name == parent.name {
        let port = parent
            .ports
            .iter()
            .position(|p| p.name == port_name)
            .ok_or_else(|| {
                PackError::MalformedInput(format!("no port '{}' on '{}'", port_name, parent.name))
            })?;
        (None, port, parent.ports[port].width)
    } else {
        let (child_idx, (_, type_id, _)) = child_types
            .iter()
            .enumerate()
            .find(|(_, (name, _, _))| name == block_name)
            .ok_or_else(|| {
                PackError::MalformedInput(format!(
                    "no child '{}' in '{}'",
                    block_name, parent.name
                ))
            })?;
        let pb_type = arch.pb_type(*type_id);
        let port = pb_type.port_index(port_name).ok_or_else(|| {
            PackError::MalformedInput(format!("no port '{}' on '{}'", port_name, block_name))
        })?;
        (Some((child_idx, instance)), port, pb_type.ports[port].width)
    };

    let (pin_lo, pin_count) = match pin {
        Some(idx) if idx < width => (idx, 1),
        Some(idx) => {
            return Err(PackError::MalformedInput(format!(
                "pin index {} out of range in '{}'",
                idx, text
            )))
        }
        None => (0, width),
    };

    Ok(RawPinRef {
        child,
        port,
        pin_lo,
        pin_count,
    })
}

fn expand_instances(
    raw: &RawPinRef,
    child_types: &[(String, PbTypeId, usize)],
) -> Vec<(BlockRef, usize, usize, usize)> {
    /* (block, port, first pin, pin count) per concrete instance */
    match raw.child {
        None => vec![(BlockRef::Parent, raw.port, raw.pin_lo, raw.pin_count)],
        Some((child, Some(instance))) => {
            vec![(
                BlockRef::Child { child, instance },
                raw.port,
                raw.pin_lo,
                raw.pin_count,
            )]
        }
        Some((child, None)) => (0..child_types[child].2)
            .map(|instance| {
                (
                    BlockRef::Child { child, instance },
                    raw.port,
                    raw.pin_lo,
                    raw.pin_count,
                )
            })
            .collect(),
    }
}

fn expand_interconnect(
    arch: &Arch,
    parent: &PbTypeSpec,
    child_types: &[(String, PbTypeId, usize)],
    ic: &InterconnectSpec,
    out: &mut Vec<IcEdge>,
) -> Result<(), PackError> {
    let mut froms = Vec::new();
    for f in &ic.from {
        let raw = parse_port_ref(arch, parent, child_types, f)?;
        froms.extend(expand_instances(&raw, child_types));
    }
    let mut tos = Vec::new();
    for t in &ic.to {
        let raw = parse_port_ref(arch, parent, child_types, t)?;
        tos.extend(expand_instances(&raw, child_types));
    }

    let mut push = |from: PinRef, to: PinRef| {
        out.push(IcEdge {
            from,
            to,
            pack_patterns: ic.pack_pattern.clone(),
            infer_pattern: ic.infer_pattern,
        })
    };

    match ic.kind {
        IcKind::Complete => {
            for &(fb, fport, flo, fcount) in &froms {
                for fpin in flo..flo + fcount {
                    for &(tb, tport, tlo, tcount) in &tos {
                        for tpin in tlo..tlo + tcount {
                            push(
                                PinRef { block: fb, port: fport, pin: fpin },
                                PinRef { block: tb, port: tport, pin: tpin },
                            );
                        }
                    }
                }
            }
        }
        IcKind::Direct => {
            /* Pairs up source and sink endpoints positionally, bit for bit. */
            let fpins: Vec<(BlockRef, usize, usize)> = froms
                .iter()
                .flat_map(|&(b, p, lo, n)| (lo..lo + n).map(move |i| (b, p, i)))
                .collect();
            let tpins: Vec<(BlockRef, usize, usize)> = tos
                .iter()
                .flat_map(|&(b, p, lo, n)| (lo..lo + n).map(move |i| (b, p, i)))
                .collect();
            if fpins.len() != tpins.len() {
                return Err(PackError::MalformedInput(format!(
                    "direct interconnect width mismatch in '{}' ({} vs {})",
                    parent.name,
                    fpins.len(),
                    tpins.len()
                )));
            }
            for (&(fb, fport, fpin), &(tb, tport, tpin)) in fpins.iter().zip(tpins.iter()) {
                push(
                    PinRef { block: fb, port: fport, pin: fpin },
                    PinRef { block: tb, port: tport, pin: tpin },
                );
            }
        }
        IcKind::Mux => {
            /* Every source endpoint is one mux option; bits pair 1:1 with
             * the single destination. */
            if tos.len() != 1 {
                return Err(PackError::MalformedInput(format!(
                    "mux interconnect in '{}' needs exactly one destination",
                    parent.name
                )));
            }
            let (tb, tport, tlo, tcount) = tos[0];
            for &(fb, fport, flo, fcount) in &froms {
                if fcount != tcount {
                    return Err(PackError::MalformedInput(format!(
                        "mux interconnect width mismatch in '{}'",
                        parent.name
                    )));
                }
                for pin in 0..fcount {
                    push(
                        PinRef { block: fb, port: fport, pin: flo + pin },
                        PinRef { block: tb, port: tport, pin: tlo + pin },
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lut_clb_spec() -> ArchSpec {
        serde_yaml::from_str(
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
        .unwrap()
    }

    #[test]
    fn test_compile_and_flatten() {
        let arch = lut_clb_spec().compile().unwrap();
        let graphs = build_pb_graphs(&arch);
        assert_eq!(graphs.len(), 1);
        let g = &graphs[0];

        /* clb + 4 ble + 4 lut4 */
        assert_eq!(g.nodes.len(), 9);
        /* clb: 8+4+1, per ble: 4+1, per lut: 4+1 */
        assert_eq!(g.total_pb_pins, 13 + 4 * 5 + 4 * 5);
        assert_eq!(g.max_depth, 2);
        assert_eq!(g.max_primitives, 4);
    }

    #[test]
    fn test_pin_numbering_matches_ids() {
        let arch = lut_clb_spec().compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        for (i, pin) in g.pins.iter().enumerate() {
            assert_eq!(pin.pin_count_in_cluster, i);
        }
    }

    #[test]
    fn test_placement_indices() {
        let arch = lut_clb_spec().compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        let root = g.node(g.root);
        let bles = &root.children[0][0];
        assert_eq!(bles.len(), 4);
        for (i, ble) in bles.iter().enumerate() {
            assert_eq!(g.node(*ble).placement_index, i);
            assert_eq!(g.node(*ble).parent, Some(g.root));
        }
    }

    #[test]
    fn test_crossbar_interconnect_fanout() {
        let arch = lut_clb_spec().compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        /* Every clb input pin drives all 16 ble input pins. */
        let clb_in = g.node(g.root).pins_by_port[0][0];
        assert_eq!(g.pin(clb_in).out_edges.len(), 16);
    }

    #[test]
    fn test_connectable_input_pins_from_lut_output() {
        let arch = lut_clb_spec().compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        let lut0_out = g
            .primitives(&arch)
            .next()
            .map(|n| g.node(n).pins_by_port[1][0])
            .unwrap();
        /* This fixture has no feedback path from ble outputs back into the
         * crossbar, so a lut output cannot reach any primitive input pin
         * without leaving the cluster. */
        assert_eq!(g.pin(lut0_out).connectable_input_pins[0].len(), 0);
        assert_eq!(g.pin(lut0_out).connectable_input_pins[1].len(), 0);
    }

    #[test]
    fn test_default_pin_class_sizes() {
        let arch = lut_clb_spec().compile().unwrap();
        let g = &build_pb_graphs(&arch)[0];
        let root = g.node(g.root);
        assert_eq!(root.input_pin_classes.len(), 1);
        assert_eq!(root.input_pin_classes[0].num_pins, 9); /* in + clk */
        assert_eq!(root.output_pin_classes[0].num_pins, 4);
    }

    #[test]
    fn test_candidate_block_types_by_model() {
        let arch = lut_clb_spec().compile().unwrap();
        assert_eq!(arch.candidate_block_types(".names").len(), 1);
        assert!(arch.candidate_block_types(".latch").is_empty());
    }
}
