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

/* Pack molecules: small atom DAGs the prepacker decided must stay together.
 * The store keeps the molecules, their derived statistics, the atom ->
 * molecules multimap and the unclustered-by-external-input bucket index used
 * by the unrelated-clustering fallback.
 */

use std::collections::HashMap;

use crate::errors::PackError;
use crate::netlist::{AtomBlockId, AtomNetId, AtomNetlist};
use crate::arch::PortDir;
#[allow(unused)]
use crate::log::*;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MoleculeId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoleculeKind {
    Single,
    ForcedPack,
    Chain,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PatternConnection {
    pub from_block: usize,
    pub from_port: String,
    pub from_pin: usize,
    pub to_block: usize,
    pub to_port: String,
    pub to_pin: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PackPattern {
    pub name: String,
    pub root_block: usize,
    pub connections: Vec<PatternConnection>,
}

#[derive(Clone, Debug)]
pub struct ChainInfo {
    pub is_long: bool,
    /* Chain position inside a cluster; assigned when the first molecule of a
     * long chain commits and shared by every later molecule of that chain. */
    pub chain_id: Option<usize>,
}

pub struct Molecule {
    pub kind: MoleculeKind,
    /* Indexed by pattern block id; a slot may be empty when a pattern block
     * has no netlist counterpart. Singletons hold exactly one atom. */
    pub atoms: Vec<Option<AtomBlockId>>,
    pub root: usize,
    pub pattern: Option<PackPattern>,
    pub chain: Option<ChainInfo>,
}

impl Molecule {
    pub fn root_atom(&self) -> AtomBlockId {
        self.atoms[self.root].expect("molecule root atom must exist")
    }

    pub fn atom_ids<'a>(&'a self) -> impl Iterator<Item = AtomBlockId> + 'a {
        self.atoms.iter().filter_map(|a| *a)
    }

    pub fn is_chain(&self) -> bool {
        matches!(self.kind, MoleculeKind::Chain)
    }

    pub fn is_long_chain(&self) -> bool {
        self.chain.as_ref().map(|c| c.is_long).unwrap_or(false)
    }
}

struct MoleculeStats {
    valid: bool,
    num_blocks: usize,
    num_ext_inputs: usize,
    base_gain: f32,
}

pub struct MoleculeStore {
    molecules: Vec<Molecule>,
    stats: Vec<MoleculeStats>,
    atom_molecules: HashMap<AtomBlockId, Vec<MoleculeId>>,
    max_num_blocks: usize,
    max_num_ext_inputs: usize,
}

impl MoleculeStore {
    pub fn new(netlist: &AtomNetlist, molecules: Vec<Molecule>) -> Self {
        let mut atom_molecules: HashMap<AtomBlockId, Vec<MoleculeId>> = HashMap::new();
        let mut stats = Vec::with_capacity(molecules.len());

        for (imol, molecule) in molecules.iter().enumerate() {
            for atom in molecule.atom_ids() {
                atom_molecules
                    .entry(atom)
                    .or_insert_with(Vec::new)
                    .push(MoleculeId(imol));
            }

            let num_blocks = molecule.atom_ids().count();
            let num_ext_inputs = count_molecule_ext_inputs(netlist, molecule);
            stats.push(MoleculeStats {
                valid: true,
                num_blocks,
                num_ext_inputs,
                base_gain: num_blocks as f32,
            });
        }

        let max_num_blocks = stats.iter().map(|s| s.num_blocks).max().unwrap_or(0);
        let max_num_ext_inputs = stats.iter().map(|s| s.num_ext_inputs).max().unwrap_or(0);

        MoleculeStore {
            molecules,
            stats,
            atom_molecules,
            max_num_blocks,
            max_num_ext_inputs,
        }
    }

    pub fn len(&self) -> usize {
        self.molecules.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = MoleculeId> {
        (0..self.molecules.len()).map(MoleculeId)
    }

    pub fn molecule(&self, id: MoleculeId) -> &Molecule {
        &self.molecules[id.0]
    }

    pub fn atom_molecules(&self, atom: AtomBlockId) -> &[MoleculeId] {
        self.atom_molecules
            .get(&atom)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn valid(&self, id: MoleculeId) -> bool {
        self.stats[id.0].valid
    }

    pub fn set_valid(&mut self, id: MoleculeId, valid: bool) {
        self.stats[id.0].valid = valid;
    }

    pub fn num_blocks(&self, id: MoleculeId) -> usize {
        self.stats[id.0].num_blocks
    }

    pub fn num_ext_inputs(&self, id: MoleculeId) -> usize {
        self.stats[id.0].num_ext_inputs
    }

    pub fn base_gain(&self, id: MoleculeId) -> f32 {
        self.stats[id.0].base_gain
    }

    pub fn max_num_blocks(&self) -> usize {
        self.max_num_blocks
    }

    pub fn max_num_ext_inputs(&self) -> usize {
        self.max_num_ext_inputs
    }

    pub fn set_chain_id(&mut self, id: MoleculeId, chain_id: usize) {
        if let Some(chain) = self.molecules[id.0].chain.as_mut() {
            chain.chain_id = Some(chain_id);
        }
    }

    pub fn chain_id(&self, id: MoleculeId) -> Option<usize> {
        self.molecules[id.0].chain.as_ref().and_then(|c| c.chain_id)
    }

    /// Invalidate every molecule sharing an atom with the committed one.
    pub fn invalidate_molecules_of_atom(&mut self, atom: AtomBlockId) {
        let ids: Vec<MoleculeId> = self.atom_molecules(atom).to_vec();
        for id in ids {
            self.stats[id.0].valid = false;
        }
    }

    /// After a revert: molecules whose atoms are all unclustered again become
    /// candidates.
    pub fn revalidate_molecules_of_atom<F>(&mut self, atom: AtomBlockId, is_unclustered: F)
    where
        F: Fn(AtomBlockId) -> bool,
    {
        let ids: Vec<MoleculeId> = self.atom_molecules(atom).to_vec();
        for id in ids {
            if !self.stats[id.0].valid {
                let all_free = self.molecules[id.0].atom_ids().all(|a| is_unclustered(a));
                if all_free {
                    self.stats[id.0].valid = true;
                }
            }
        }
    }
}

fn count_molecule_ext_inputs(netlist: &AtomNetlist, molecule: &Molecule) -> usize {
    let members: Vec<AtomBlockId> = molecule.atom_ids().collect();
    let mut nets: Vec<AtomNetId> = Vec::new();
    for atom in &members {
        let input_pins = netlist
            .block_pins_of_dir(*atom, PortDir::Input)
            .chain(netlist.block_pins_of_dir(*atom, PortDir::Clock));
        for pin in input_pins {
            let net = netlist.pin_net(pin);
            let internal = netlist
                .net_driver_block(net)
                .map(|d| members.contains(&d))
                .unwrap_or(false);
            if !internal && !nets.contains(&net) {
                nets.push(net);
            }
        }
    }
    nets.len()
}

/**************************************************************************
 * Unclustered-by-external-input index
 **************************************************************************/

/// Bucket k holds every molecule with exactly k external inputs, highest
/// base gain first. Only consulted for unrelated clustering and max-input
/// seeding; validity is re-checked lazily on every scan.
pub struct UnclusteredIndex {
    buckets: Vec<Vec<MoleculeId>>,
}

impl UnclusteredIndex {
    pub fn new(store: &MoleculeStore) -> Self {
        let mut buckets = vec![Vec::new(); store.max_num_ext_inputs() + 1];
        let mut by_gain: Vec<MoleculeId> = store.ids().collect();
        by_gain.sort_by(|a, b| {
            crate::common::fcmp(store.base_gain(*b), store.base_gain(*a))
                .then(a.0.cmp(&b.0))
        });
        for id in by_gain {
            buckets[store.num_ext_inputs(id)].push(id);
        }
        UnclusteredIndex { buckets }
    }

    /// Best still-valid molecule with exactly `ext_inps` external inputs that
    /// passes the caller's feasibility check.
    pub fn molecule_by_ext_inputs<F>(
        &self,
        store: &MoleculeStore,
        ext_inps: usize,
        feasible: F,
    ) -> Option<MoleculeId>
    where
        F: Fn(MoleculeId) -> bool,
    {
        self.buckets
            .get(ext_inps)?
            .iter()
            .copied()
            .find(|id| store.valid(*id) && feasible(*id))
    }

    /// Molecule with the most external inputs not exceeding `inputs_avail`.
    pub fn molecule_with_most_ext_inputs<F>(
        &self,
        store: &MoleculeStore,
        inputs_avail: usize,
        feasible: F,
    ) -> Option<MoleculeId>
    where
        F: Fn(MoleculeId) -> bool,
    {
        let start = inputs_avail.min(self.buckets.len().saturating_sub(1));
        for ext_inps in (0..=start).rev() {
            let hit = self
                .molecule_by_ext_inputs(store, ext_inps, &feasible);
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    /// Seed fallback: the valid molecule with the most external inputs.
    pub fn seed_with_most_ext_inputs(&self, store: &MoleculeStore) -> Option<MoleculeId> {
        for bucket in self.buckets.iter().rev() {
            if let Some(id) = bucket.iter().copied().find(|id| store.valid(*id)) {
                return Some(id);
            }
        }
        None
    }
}

/**************************************************************************
 * Serde specification layer
 **************************************************************************/

#[derive(Serialize, Deserialize, Clone)]
pub struct MoleculeSpec {
    pub kind: MoleculeKind,
    /// atom block names, indexed by pattern block id; "-" marks an empty slot
    pub atoms: Vec<String>,
    #[serde(default)]
    pub root: usize,
    #[serde(default)]
    pub pattern: Option<PackPattern>,
    #[serde(default)]
    pub long_chain: bool,
}

/// Builds the molecule store from explicit molecule specs; atoms not covered
/// by any spec get an implicit singleton molecule each.
pub fn build_molecules(
    netlist: &AtomNetlist,
    specs: &[MoleculeSpec],
) -> Result<MoleculeStore, PackError> {
    let name_to_block: HashMap<&str, AtomBlockId> = netlist
        .block_ids()
        .map(|b| (netlist.block(b).name.as_str(), b))
        .collect();

    let mut molecules = Vec::new();
    let mut covered = vec![false; netlist.blocks.len()];

    for spec in specs {
        let mut atoms = Vec::with_capacity(spec.atoms.len());
        for name in &spec.atoms {
            if name == crate::netlist::OPEN_NET {
                atoms.push(None);
                continue;
            }
            let blk = *name_to_block.get(name.as_str()).ok_or_else(|| {
                PackError::MalformedInput(format!("molecule references unknown atom '{}'", name))
            })?;
            covered[blk.0] = true;
            atoms.push(Some(blk));
        }
        if atoms.get(spec.root).copied().flatten().is_none() {
            return Err(PackError::MalformedInput(
                "molecule root slot is empty".to_string(),
            ));
        }
        let chain = match spec.kind {
            MoleculeKind::Chain => Some(ChainInfo {
                is_long: spec.long_chain,
                chain_id: None,
            }),
            _ => None,
        };
        molecules.push(Molecule {
            kind: spec.kind,
            atoms,
            root: spec.root,
            pattern: spec.pattern.clone(),
            chain,
        });
    }

    for blk in netlist.block_ids() {
        if !covered[blk.0] {
            molecules.push(Molecule {
                kind: MoleculeKind::Single,
                atoms: vec![Some(blk)],
                root: 0,
                pattern: None,
                chain: None,
            });
        }
    }

    Ok(MoleculeStore::new(netlist, molecules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlist::NetlistSpec;

    fn netlist() -> AtomNetlist {
        let spec: NetlistSpec = serde_yaml::from_str(
            r#"
blocks:
  - name: a
    model: .names
    ports:
      - {port: in, dir: input, nets: [x, y]}
      - {port: out, dir: output, nets: [n1]}
  - name: b
    model: .names
    ports:
      - {port: in, dir: input, nets: [n1, z]}
      - {port: out, dir: output, nets: [o]}
"#,
        )
        .unwrap();
        spec.compile().unwrap()
    }

    #[test]
    fn test_singletons_for_uncovered_atoms() {
        let nl = netlist();
        let store = build_molecules(&nl, &[]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.num_blocks(MoleculeId(0)), 1);
        assert_eq!(store.num_ext_inputs(MoleculeId(0)), 2); /* x y */
    }

    #[test]
    fn test_pair_molecule_ext_inputs_skip_internal_net() {
        let nl = netlist();
        let spec = MoleculeSpec {
            kind: MoleculeKind::ForcedPack,
            atoms: vec!["a".into(), "b".into()],
            root: 0,
            pattern: None,
            long_chain: false,
        };
        let store = build_molecules(&nl, &[spec]).unwrap();
        assert_eq!(store.len(), 1);
        /* x, y, z — n1 is internal to the molecule */
        assert_eq!(store.num_ext_inputs(MoleculeId(0)), 3);
        assert_eq!(store.max_num_blocks(), 2);
    }

    #[test]
    fn test_invalidate_and_revalidate() {
        let nl = netlist();
        let mut store = build_molecules(&nl, &[]).unwrap();
        let a = AtomBlockId(0);
        store.invalidate_molecules_of_atom(a);
        assert!(!store.valid(MoleculeId(0)));
        store.revalidate_molecules_of_atom(a, |_| true);
        assert!(store.valid(MoleculeId(0)));
    }

    #[test]
    fn test_unclustered_index_prefers_most_inputs() {
        let nl = netlist();
        let store = build_molecules(&nl, &[]).unwrap();
        let index = UnclusteredIndex::new(&store);
        let seed = index.seed_with_most_ext_inputs(&store).unwrap();
        /* block 'a' has 2 external inputs, 'b' also 2 — gain ties, lowest
         * id wins */
        assert_eq!(store.num_ext_inputs(seed), 2);
        let pick = index.molecule_with_most_ext_inputs(&store, 1, |_| true);
        assert!(pick.is_none()); /* nothing with <= 1 inputs */
    }
}
