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

/* Primitive-level atom netlist. Blocks instantiate a behavioral model and
 * connect to nets through typed pins; everything is stored in flat arenas
 * addressed by index handles.
 */

use std::collections::HashMap;

use crate::arch::{Arch, PbTypeId, PortDir};
use crate::errors::PackError;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct AtomBlockId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct AtomPortId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct AtomPinId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct AtomNetId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PinKind {
    Driver,
    Sink,
}

pub struct AtomBlock {
    pub name: String,
    pub model: String,
    pub ports: Vec<AtomPortId>,
}

pub struct AtomPort {
    pub block: AtomBlockId,
    pub name: String,
    pub dir: PortDir,
    pub pins: Vec<AtomPinId>,
}

pub struct AtomPin {
    pub port: AtomPortId,
    pub bit: usize,
    pub net: AtomNetId,
    pub kind: PinKind,
}

pub struct AtomNet {
    pub name: String,
    pub driver: Option<AtomPinId>,
    pub sinks: Vec<AtomPinId>,
}

#[derive(Default)]
pub struct AtomNetlist {
    pub blocks: Vec<AtomBlock>,
    pub ports: Vec<AtomPort>,
    pub pins: Vec<AtomPin>,
    pub nets: Vec<AtomNet>,
}

impl AtomNetlist {
    pub fn block(&self, id: AtomBlockId) -> &AtomBlock {
        &self.blocks[id.0]
    }

    pub fn port(&self, id: AtomPortId) -> &AtomPort {
        &self.ports[id.0]
    }

    pub fn pin(&self, id: AtomPinId) -> &AtomPin {
        &self.pins[id.0]
    }

    pub fn net(&self, id: AtomNetId) -> &AtomNet {
        &self.nets[id.0]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = AtomBlockId> {
        (0..self.blocks.len()).map(AtomBlockId)
    }

    pub fn net_ids(&self) -> impl Iterator<Item = AtomNetId> {
        (0..self.nets.len()).map(AtomNetId)
    }

    pub fn block_pins<'a>(&'a self, blk: AtomBlockId) -> impl Iterator<Item = AtomPinId> + 'a {
        self.block(blk)
            .ports
            .iter()
            .flat_map(move |p| self.port(*p).pins.iter().copied())
    }

    pub fn block_pins_of_dir<'a>(
        &'a self,
        blk: AtomBlockId,
        dir: PortDir,
    ) -> impl Iterator<Item = AtomPinId> + 'a {
        self.block(blk)
            .ports
            .iter()
            .filter(move |p| self.port(**p).dir == dir)
            .flat_map(move |p| self.port(*p).pins.iter().copied())
    }

    pub fn pin_block(&self, pin: AtomPinId) -> AtomBlockId {
        self.port(self.pin(pin).port).block
    }

    pub fn pin_net(&self, pin: AtomPinId) -> AtomNetId {
        self.pin(pin).net
    }

    pub fn pin_dir(&self, pin: AtomPinId) -> PortDir {
        self.port(self.pin(pin).port).dir
    }

    pub fn net_driver(&self, net: AtomNetId) -> Option<AtomPinId> {
        self.net(net).driver
    }

    pub fn net_driver_block(&self, net: AtomNetId) -> Option<AtomBlockId> {
        self.net(net).driver.map(|p| self.pin_block(p))
    }

    pub fn net_sinks(&self, net: AtomNetId) -> &[AtomPinId] {
        &self.net(net).sinks
    }

    /// All pins of a net, driver first.
    pub fn net_pins<'a>(&'a self, net: AtomNetId) -> impl Iterator<Item = AtomPinId> + 'a {
        self.net(net)
            .driver
            .into_iter()
            .chain(self.net(net).sinks.iter().copied())
    }

    /// Number of distinct input/clock nets of a block not driven by the block
    /// itself.
    pub fn num_ext_inputs(&self, blk: AtomBlockId) -> usize {
        let mut nets: Vec<AtomNetId> = self
            .block_pins_of_dir(blk, PortDir::Input)
            .chain(self.block_pins_of_dir(blk, PortDir::Clock))
            .map(|p| self.pin_net(p))
            .filter(|n| self.net_driver_block(*n) != Some(blk))
            .collect();
        nets.sort();
        nets.dedup();
        nets.len()
    }

    pub fn num_used_pins(&self, blk: AtomBlockId) -> usize {
        self.block_pins_of_dir(blk, PortDir::Input).count()
            + self.block_pins_of_dir(blk, PortDir::Output).count()
    }

    /// True when the net drives one of its own driver block's inputs; such a
    /// net lists the block twice and gain updates must skip the driving pin.
    pub fn net_feeds_driving_block(&self, net: AtomNetId) -> bool {
        match self.net_driver_block(net) {
            Some(driver) => self
                .net_sinks(net)
                .iter()
                .any(|p| self.pin_block(*p) == driver),
            None => false,
        }
    }

    /// Type check: the block's model matches the primitive and every used
    /// port exists on it with sufficient width and the right direction.
    pub fn primitive_type_feasible(
        &self,
        blk: AtomBlockId,
        arch: &Arch,
        pb_type: PbTypeId,
    ) -> bool {
        let pb = arch.pb_type(pb_type);
        if pb.model.as_deref() != Some(self.block(blk).model.as_str()) {
            return false;
        }
        for port_id in &self.block(blk).ports {
            let port = self.port(*port_id);
            match pb.port_index(&port.name) {
                None => return false,
                Some(idx) => {
                    let arch_port = &pb.ports[idx];
                    if arch_port.dir != port.dir {
                        return false;
                    }
                    if port.pins.iter().any(|p| self.pin(*p).bit >= arch_port.width) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/**************************************************************************
 * Serde specification layer
 **************************************************************************/

#[derive(Serialize, Deserialize, Clone)]
pub struct NetlistSpec {
    pub blocks: Vec<BlockSpec>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct BlockSpec {
    pub name: String,
    pub model: String,
    /// port name -> one net name per used bit ("-" marks an open bit)
    pub ports: Vec<PortConnSpec>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PortConnSpec {
    pub port: String,
    pub dir: PortDir,
    pub nets: Vec<String>,
}

pub const OPEN_NET: &str = "-";

impl NetlistSpec {
    pub fn compile(&self) -> Result<AtomNetlist, PackError> {
        let mut netlist = AtomNetlist::default();
        let mut net_ids: HashMap<String, AtomNetId> = HashMap::new();

        for block in &self.blocks {
            let blk_id = AtomBlockId(netlist.blocks.len());
            let mut port_ids = Vec::with_capacity(block.ports.len());

            for conn in &block.ports {
                let port_id = AtomPortId(netlist.ports.len());
                let mut pin_ids = Vec::new();

                for (bit, net_name) in conn.nets.iter().enumerate() {
                    if net_name == OPEN_NET {
                        continue;
                    }
                    let net_id = *net_ids.entry(net_name.clone()).or_insert_with(|| {
                        let id = AtomNetId(netlist.nets.len());
                        netlist.nets.push(AtomNet {
                            name: net_name.clone(),
                            driver: None,
                            sinks: Vec::new(),
                        });
                        id
                    });

                    let pin_id = AtomPinId(netlist.pins.len());
                    let kind = if conn.dir == PortDir::Output {
                        PinKind::Driver
                    } else {
                        PinKind::Sink
                    };
                    netlist.pins.push(AtomPin {
                        port: port_id,
                        bit,
                        net: net_id,
                        kind,
                    });

                    match kind {
                        PinKind::Driver => {
                            if netlist.nets[net_id.0].driver.is_some() {
                                return Err(PackError::MalformedInput(format!(
                                    "net '{}' has multiple drivers",
                                    net_name
                                )));
                            }
                            netlist.nets[net_id.0].driver = Some(pin_id);
                        }
                        PinKind::Sink => netlist.nets[net_id.0].sinks.push(pin_id),
                    }
                    pin_ids.push(pin_id);
                }

                netlist.ports.push(AtomPort {
                    block: blk_id,
                    name: conn.port.clone(),
                    dir: conn.dir,
                    pins: pin_ids,
                });
                port_ids.push(port_id);
            }

            netlist.blocks.push(AtomBlock {
                name: block.name.clone(),
                model: block.model.clone(),
                ports: port_ids,
            });
        }

        Ok(netlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_spec() -> NetlistSpec {
        serde_yaml::from_str(
            r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: in, dir: input, nets: [a]}
      - {port: out, dir: output, nets: [n1]}
  - name: l2
    model: .names
    ports:
      - {port: in, dir: input, nets: [n1, b]}
      - {port: out, dir: output, nets: [n2]}
  - name: l3
    model: .names
    ports:
      - {port: in, dir: input, nets: [n2, "-", c]}
      - {port: out, dir: output, nets: [o]}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_nets_and_pins() {
        let nl = chain_spec().compile().unwrap();
        assert_eq!(nl.blocks.len(), 3);
        assert_eq!(nl.nets.len(), 6); /* a n1 b n2 c o */

        let n1 = nl.net_ids().find(|n| nl.net(*n).name == "n1").unwrap();
        assert_eq!(nl.net_sinks(n1).len(), 1);
        assert_eq!(
            nl.net_driver_block(n1),
            Some(AtomBlockId(0)),
        );
    }

    #[test]
    fn test_open_bits_are_skipped() {
        let nl = chain_spec().compile().unwrap();
        /* l3.in has bits 0 and 2 connected, bit 1 open */
        let l3 = AtomBlockId(2);
        let pins: Vec<_> = nl.block_pins_of_dir(l3, PortDir::Input).collect();
        assert_eq!(pins.len(), 2);
        assert_eq!(nl.pin(pins[1]).bit, 2);
    }

    #[test]
    fn test_num_ext_inputs() {
        let nl = chain_spec().compile().unwrap();
        assert_eq!(nl.num_ext_inputs(AtomBlockId(0)), 1); /* a */
        assert_eq!(nl.num_ext_inputs(AtomBlockId(1)), 2); /* n1 b */
    }

    #[test]
    fn test_duplicate_driver_rejected() {
        let mut spec = chain_spec();
        spec.blocks[1].ports[1].nets = vec!["n1".into()];
        assert!(spec.compile().is_err());
    }
}
