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

/* Greedy seed-and-grow clusterer.
 *
 * Picks the most attractive unclustered molecule as a seed, opens a cluster
 * for it, then keeps attracting gain-connected molecules until nothing fits.
 * Attraction is a blend of net sharing, connection absorption and timing
 * criticality, maintained incrementally as atoms commit. Clusters are first
 * built with routing checked only when they close; a cluster failing that
 * check is rebuilt with full routing after every molecule.
 */

use std::collections::{HashMap, HashSet};

use crate::arch::{Arch, BlockTypeId, PortDir};
use crate::cluster::{
    Cluster, ClusterId, ClusterLegalizer, LegalizationStrategy, LegalizerOpts, PbId,
    MAX_FEASIBLE_BLOCK_ARRAY_SIZE,
};
use crate::common::fcmp;
use crate::errors::PackError;
use crate::floorplan::{FloorplanConstraints, NocGroupId, PartitionRegion};
use crate::molecule::{MoleculeId, MoleculeStore, UnclusteredIndex};
use crate::netlist::{AtomBlockId, AtomNetId, AtomNetlist, AtomPinId};
use crate::router::RouterParams;
use crate::rr_graph::{build_lb_rr_graph, build_lb_rr_graph_info};
#[allow(unused)]
use crate::log::*;

/* The packer looks at every sink of a net when scoring candidates; nets
 * beyond this fanout are hopeless to absorb and only tracked as a tie
 * breaker. */
pub const MAX_NET_SINKS_IGNORE: usize = 256;
/* At most this many sinks of the cached high-fanout net are explored. */
pub const MAX_HIGH_FANOUT_EXPLORE: usize = 10;
/* Transitive candidates come from nets with fewer external terminals than
 * this, and at most this many molecules are considered. */
pub const MAX_TRANSITIVE_FANOUT_EXPLORE: usize = 4;
pub const MAX_TRANSITIVE_EXPLORE: usize = 4;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedPolicy {
    Blend,
    Timing,
    MaxInputs,
}

/// When the intra-cluster router is consulted. The cheaper end-of-cluster
/// stage escalates to per-atom routing on failure either way.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetailedRoutingStage {
    EndOfCluster,
    EachAtom,
}

#[derive(Clone)]
pub struct PackerOpts {
    pub alpha: f32,
    pub beta: f32,
    pub allow_unrelated_clustering: bool,
    pub balance_block_type_util: bool,
    pub enable_pin_feasibility_filter: bool,
    pub connection_driven: bool,
    pub global_clocks: bool,
    pub seed_policy: SeedPolicy,
    pub detailed_routing: DetailedRoutingStage,
    pub target_pin_util: HashMap<String, (f32, f32)>,
    pub high_fanout_threshold: HashMap<String, usize>,
    pub router_params: RouterParams,
    pub log_verbosity: usize,
}

impl Default for PackerOpts {
    fn default() -> Self {
        PackerOpts {
            alpha: 0.75,
            beta: 0.9,
            allow_unrelated_clustering: true,
            balance_block_type_util: true,
            enable_pin_feasibility_filter: true,
            connection_driven: true,
            global_clocks: true,
            seed_policy: SeedPolicy::Blend,
            detailed_routing: DetailedRoutingStage::EndOfCluster,
            target_pin_util: HashMap::new(),
            high_fanout_threshold: HashMap::new(),
            router_params: RouterParams::default(),
            log_verbosity: 0,
        }
    }
}

/// Externally computed setup criticalities (one per atom sink pin). Absent
/// criticalities read as zero; an absent table disables the timing terms.
#[derive(Default)]
pub struct TimingInfo {
    pub pin_criticality: HashMap<AtomPinId, f32>,
}

impl TimingInfo {
    pub fn criticality(&self, pin: AtomPinId) -> f32 {
        self.pin_criticality.get(&pin).copied().unwrap_or(0.)
    }
}

#[derive(Serialize)]
pub struct ClusterRecord {
    pub name: String,
    pub block_type: String,
    pub mode: String,
    pub atoms: Vec<String>,
    pub pb_route: Vec<PbRouteRecord>,
    pub region: PartitionRegion,
    pub noc_group: Option<usize>,
}

#[derive(Serialize)]
pub struct PbRouteRecord {
    pub pin: usize,
    pub driver_pin: Option<usize>,
    pub net: String,
}

#[derive(Serialize)]
pub struct PackOutput {
    pub clusters: Vec<ClusterRecord>,
    pub atom_cluster: Vec<Option<usize>>,
    pub type_usage: HashMap<String, usize>,
}

enum GainUpdate {
    Gain,
    NoGain,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum NetRelation {
    Input,
    Output,
}

/// Pack the whole netlist into clusters.
pub fn do_clustering(
    arch: &Arch,
    netlist: &AtomNetlist,
    store: &mut MoleculeStore,
    floorplan: &FloorplanConstraints,
    atom_noc_group: Vec<Option<NocGroupId>>,
    timing: Option<TimingInfo>,
    opts: &PackerOpts,
) -> Result<PackOutput, PackError> {
    let pb_graphs = crate::arch::build_pb_graphs(arch);
    let rr_graphs: Vec<_> = pb_graphs
        .iter()
        .map(|g| build_lb_rr_graph(arch, g))
        .collect();
    let rr_infos: Vec<_> = rr_graphs.iter().map(build_lb_rr_graph_info).collect();

    let legalizer_opts = LegalizerOpts {
        target_pin_util: opts.target_pin_util.clone(),
        enable_pin_feasibility_filter: opts.enable_pin_feasibility_filter,
        router_params: opts.router_params,
        log_verbosity: opts.log_verbosity,
    };
    let mut legalizer = ClusterLegalizer::new(
        arch,
        netlist,
        &pb_graphs,
        &rr_graphs,
        &rr_infos,
        floorplan,
        atom_noc_group,
        legalizer_opts,
        LegalizationStrategy::SkipIntraLbRoute,
    );

    let is_clock = find_clock_nets(netlist);
    let unclustered = UnclusteredIndex::new(store);
    let timing_driven = timing.is_some();
    let timing = timing.unwrap_or_default();

    let block_criticality = compute_block_criticality(netlist, &timing);
    let seed_atoms = build_seed_order(netlist, store, opts, &block_criticality);
    let mut seed_index = 0;

    let mut num_used_type_instances: HashMap<BlockTypeId, usize> = HashMap::new();
    /* Nets with few external terminals per committed cluster; fuel for the
     * transitive-fanout candidate scan. */
    let mut clb_inter_blk_nets: Vec<Vec<AtomNetId>> = Vec::new();

    let mut istart = get_seed_molecule(
        store, &unclustered, opts, &seed_atoms, &mut seed_index, &legalizer,
    );

    let stages: &[LegalizationStrategy] = match opts.detailed_routing {
        DetailedRoutingStage::EndOfCluster => &[
            LegalizationStrategy::SkipIntraLbRoute,
            LegalizationStrategy::Full,
        ],
        DetailedRoutingStage::EachAtom => &[LegalizationStrategy::Full],
    };

    while let Some(seed_molecule) = istart {
        let saved_seed_index = seed_index;

        /* The last stage routes after every molecule and can only fail by
         * the seed being unplaceable, which start_new_cluster surfaces. */
        'stage: for stage in stages.iter().copied() {
            legalizer.strategy = stage;

            let cluster_id = start_new_cluster(
                &mut legalizer,
                store,
                netlist,
                arch,
                seed_molecule,
                &num_used_type_instances,
                opts,
            )?;
            dbg_log!(
                DBG_INFO,
                "Complex block {}: '{}', type '{}'",
                cluster_id.0,
                legalizer.cluster(cluster_id).name,
                arch.block_type(legalizer.cluster(cluster_id).block_type).name
            );

            update_cluster_stats(
                &mut legalizer,
                store,
                netlist,
                seed_molecule,
                cluster_id,
                &is_clock,
                timing_driven,
                &timing,
                opts,
            );

            let mut num_unrelated_attempts = 0;
            let mut prev_molecule = seed_molecule;
            let mut next_molecule = get_molecule_for_cluster(
                &mut legalizer,
                store,
                netlist,
                cluster_id,
                &unclustered,
                opts,
                &mut num_unrelated_attempts,
                &clb_inter_blk_nets,
            );

            while let Some(molecule) = next_molecule {
                if molecule == prev_molecule {
                    break;
                }
                let status = legalizer.add_mol_to_cluster(store, molecule, cluster_id);
                prev_molecule = molecule;

                if status.passed() {
                    dbg_log!(
                        DBG_EXTRA1,
                        "PASSED molecule with root atom '{}'",
                        netlist.block(store.molecule(molecule).root_atom()).name
                    );
                    update_cluster_stats(
                        &mut legalizer,
                        store,
                        netlist,
                        molecule,
                        cluster_id,
                        &is_clock,
                        timing_driven,
                        &timing,
                        opts,
                    );
                    num_unrelated_attempts = 0;
                } else {
                    dbg_log!(
                        DBG_EXTRA1,
                        "FAILED molecule with root atom '{}': {:?}",
                        netlist.block(store.molecule(molecule).root_atom()).name,
                        status
                    );
                }

                next_molecule = get_molecule_for_cluster(
                    &mut legalizer,
                    store,
                    netlist,
                    cluster_id,
                    &unclustered,
                    opts,
                    &mut num_unrelated_attempts,
                    &clb_inter_blk_nets,
                );
            }

            /* Cluster closed; prove routability if we deferred it. */
            let is_cluster_legal = match stage {
                LegalizationStrategy::SkipIntraLbRoute => {
                    legalizer.check_cluster_legality(cluster_id).is_ok()
                }
                LegalizationStrategy::Full => true,
            };

            if is_cluster_legal {
                record_inter_block_nets(
                    &mut clb_inter_blk_nets,
                    legalizer.cluster(cluster_id),
                    netlist,
                    cluster_id,
                );
                *num_used_type_instances
                    .entry(legalizer.cluster(cluster_id).block_type)
                    .or_insert(0) += 1;
                legalizer.clean_cluster(cluster_id);
                break 'stage;
            }

            dbg_log!(
                DBG_INFO,
                "Failed route at end of cluster {}; rebuilding with detailed routing per molecule",
                cluster_id.0
            );
            legalizer.destroy_cluster(store, cluster_id);
            seed_index = saved_seed_index;
        }

        istart = get_seed_molecule(
            store, &unclustered, opts, &seed_atoms, &mut seed_index, &legalizer,
        );
    }

    legalizer.compress();
    legalizer.verify()?;

    Ok(build_output(arch, netlist, &legalizer))
}

fn find_clock_nets(netlist: &AtomNetlist) -> HashSet<AtomNetId> {
    let mut clocks = HashSet::new();
    for net in netlist.net_ids() {
        for pin in netlist.net_sinks(net) {
            if netlist.pin_dir(*pin) == PortDir::Clock {
                clocks.insert(net);
                break;
            }
        }
    }
    clocks
}

fn compute_block_criticality(netlist: &AtomNetlist, timing: &TimingInfo) -> Vec<f32> {
    let mut criticality: Vec<f32> = vec![0.; netlist.blocks.len()];
    for blk in netlist.block_ids() {
        for pin in netlist.block_pins_of_dir(blk, PortDir::Input) {
            criticality[blk.0] = criticality[blk.0].max(timing.criticality(pin));
        }
    }
    criticality
}

/* Seed score: a weighted mix of block criticality, relative external input
 * count, and molecule size. */
fn build_seed_order(
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    opts: &PackerOpts,
    block_criticality: &[f32],
) -> Vec<AtomBlockId> {
    let seed_blend_fac = 0.5;
    let max_molecule_inputs = store.max_num_ext_inputs().max(1);

    let mut gains = vec![0.; netlist.blocks.len()];
    for blk in netlist.block_ids() {
        let mut max_blend_gain = 0.;
        for molecule in store.atom_molecules(blk) {
            let inputs_of_molecule = store.num_ext_inputs(*molecule) as f32;
            let blocks_of_molecule = store.num_blocks(*molecule) as f32;

            let mut blend_gain = seed_blend_fac * block_criticality[blk.0]
                + (1. - seed_blend_fac) * (inputs_of_molecule / max_molecule_inputs as f32);
            blend_gain *= 1. + 0.2 * (blocks_of_molecule - 1.);
            if blend_gain > max_blend_gain {
                max_blend_gain = blend_gain;
            }
        }
        gains[blk.0] = max_blend_gain;
    }

    let mut atoms: Vec<AtomBlockId> = netlist.block_ids().collect();
    match opts.seed_policy {
        SeedPolicy::Timing => {
            atoms.sort_by(|a, b| {
                fcmp(block_criticality[b.0], block_criticality[a.0]).then(a.0.cmp(&b.0))
            });
        }
        _ => {
            atoms.sort_by(|a, b| fcmp(gains[b.0], gains[a.0]).then(a.0.cmp(&b.0)));
        }
    }
    atoms
}

fn get_seed_molecule(
    store: &MoleculeStore,
    unclustered: &UnclusteredIndex,
    opts: &PackerOpts,
    seed_atoms: &[AtomBlockId],
    seed_index: &mut usize,
    legalizer: &ClusterLegalizer,
) -> Option<MoleculeId> {
    if opts.seed_policy == SeedPolicy::MaxInputs {
        return unclustered.seed_with_most_ext_inputs(store);
    }

    while *seed_index < seed_atoms.len() {
        let blk = seed_atoms[*seed_index];
        *seed_index += 1;

        if legalizer.atom_cluster[blk.0].is_some() {
            continue;
        }
        /* Several molecules may share the atom; the one with the largest
         * base gain wins. */
        let best = store
            .atom_molecules(blk)
            .iter()
            .copied()
            .filter(|m| store.valid(*m))
            .max_by(|a, b| fcmp(store.base_gain(*a), store.base_gain(*b)));
        if best.is_some() {
            return best;
        }
    }
    None
}

/* Opens a cluster for the seed molecule, preferring under-utilized block
 * types and trying every root mode of a type before giving up on it. */
fn start_new_cluster(
    legalizer: &mut ClusterLegalizer,
    store: &mut MoleculeStore,
    netlist: &AtomNetlist,
    arch: &Arch,
    molecule: MoleculeId,
    num_used_type_instances: &HashMap<BlockTypeId, usize>,
    opts: &PackerOpts,
) -> Result<ClusterId, PackError> {
    let root_atom = store.molecule(molecule).root_atom();
    let model = &netlist.block(root_atom).model;

    let mut candidate_types = arch.candidate_block_types(model);
    if candidate_types.is_empty() {
        return Err(PackError::MoleculeUnplaceable {
            atom: netlist.block(root_atom).name.clone(),
        });
    }

    if opts.balance_block_type_util {
        /* Prefer the least-utilized type that can host the root primitive. */
        candidate_types.sort_by(|a, b| {
            let util = |t: &BlockTypeId| {
                let used = num_used_type_instances.get(t).copied().unwrap_or(0) as f32;
                used / arch.block_type(*t).instances as f32
            };
            fcmp(util(a), util(b)).then(a.0.cmp(&b.0))
        });
    }

    for block_type in candidate_types {
        let num_modes = arch
            .pb_type(arch.block_type(block_type).pb_type)
            .modes
            .len();
        for mode in 0..num_modes {
            let (status, id) = legalizer.start_new_cluster(store, molecule, block_type, mode);
            if status.passed() {
                return Ok(id.unwrap());
            }
        }
    }

    Err(PackError::MoleculeUnplaceable {
        atom: netlist.block(root_atom).name.clone(),
    })
}

fn high_fanout_threshold(arch: &Arch, opts: &PackerOpts, block_type: BlockTypeId) -> usize {
    opts.high_fanout_threshold
        .get(&arch.block_type(block_type).name)
        .copied()
        .unwrap_or(MAX_NET_SINKS_IGNORE)
}

/* Marks nets touched by a freshly committed molecule and refreshes the gain
 * vectors of unclustered neighbours. */
fn update_cluster_stats(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    molecule: MoleculeId,
    cluster_id: ClusterId,
    is_clock: &HashSet<AtomNetId>,
    timing_driven: bool,
    timing: &TimingInfo,
    opts: &PackerOpts,
) {
    let fanout_threshold =
        high_fanout_threshold(legalizer.arch, opts, legalizer.cluster(cluster_id).block_type);

    let atoms: Vec<AtomBlockId> = store.molecule(molecule).atom_ids().collect();
    for blk in atoms {
        let atom_pb = legalizer.atom_pb[blk.0].map(|(_, pb)| pb);
        let atom_pb = match atom_pb {
            Some(pb) => pb,
            None => continue,
        };

        for pin in netlist
            .block_pins_of_dir(blk, PortDir::Output)
            .collect::<Vec<_>>()
        {
            let net = netlist.pin_net(pin);
            let flag = if is_clock.contains(&net) && opts.global_clocks {
                GainUpdate::NoGain
            } else {
                GainUpdate::Gain
            };
            mark_and_update_partial_gain(
                legalizer, netlist, cluster_id, atom_pb, blk, net, flag,
                NetRelation::Output, timing_driven, timing, opts, is_clock, fanout_threshold,
            );
        }

        for pin in netlist
            .block_pins_of_dir(blk, PortDir::Input)
            .collect::<Vec<_>>()
        {
            let net = netlist.pin_net(pin);
            mark_and_update_partial_gain(
                legalizer, netlist, cluster_id, atom_pb, blk, net, GainUpdate::Gain,
                NetRelation::Input, timing_driven, timing, opts, is_clock, fanout_threshold,
            );
        }

        for pin in netlist
            .block_pins_of_dir(blk, PortDir::Clock)
            .collect::<Vec<_>>()
        {
            let net = netlist.pin_net(pin);
            let flag = if opts.global_clocks {
                GainUpdate::NoGain
            } else {
                GainUpdate::Gain
            };
            mark_and_update_partial_gain(
                legalizer, netlist, cluster_id, atom_pb, blk, net, flag,
                NetRelation::Input, timing_driven, timing, opts, is_clock, fanout_threshold,
            );
        }

        update_total_gain(legalizer, netlist, cluster_id, atom_pb, timing_driven, opts);
    }
}

fn pb_parent_chain(cluster: &Cluster, pb: PbId) -> Vec<PbId> {
    let mut chain = Vec::new();
    let mut cur = cluster.pb(pb).parent;
    while let Some(pb_id) = cur {
        chain.push(pb_id);
        cur = cluster.pb(pb_id).parent;
    }
    chain
}

fn mark_and_update_partial_gain(
    legalizer: &mut ClusterLegalizer,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    atom_pb: PbId,
    clustered_blk: AtomBlockId,
    net: AtomNetId,
    flag: GainUpdate,
    relation: NetRelation,
    timing_driven: bool,
    timing: &TimingInfo,
    opts: &PackerOpts,
    is_clock: &HashSet<AtomNetId>,
    fanout_threshold: usize,
) {
    if netlist.net_sinks(net).len() > fanout_threshold {
        /* Too costly to mark every sink of a net this wide; remember the
         * thinnest such net as a weak tie breaker instead. */
        if !is_clock.contains(&net) {
            let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
            let stats = cluster.root_stats_mut();
            let replace = match stats.tie_break_high_fanout_net {
                None => true,
                Some(stored) => netlist.net_sinks(net).len() < netlist.net_sinks(stored).len(),
            };
            if replace {
                stats.tie_break_high_fanout_net = Some(net);
            }
        }
        return;
    }

    let chain = pb_parent_chain(legalizer.cluster(cluster_id), atom_pb);
    for cur_pb in chain {
        let first_touch = {
            let cluster = legalizer.cluster(cluster_id);
            !cluster
                .pb(cur_pb)
                .stats
                .as_ref()
                .unwrap()
                .num_pins_of_net_in_pb
                .contains_key(&net)
        };

        if first_touch {
            let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
            cluster
                .pb_mut(cur_pb)
                .stats
                .as_mut()
                .unwrap()
                .marked_nets
                .push(net);
        }

        if matches!(flag, GainUpdate::Gain) {
            if first_touch {
                update_sharing_and_hill_gain(legalizer, netlist, cluster_id, cur_pb, net);
            }
            if opts.connection_driven {
                update_connection_gain_values(
                    legalizer, netlist, cluster_id, cur_pb, clustered_blk, net, relation,
                );
            }
            if timing_driven && !is_clock.contains(&net) {
                update_timing_gain_values(legalizer, netlist, cluster_id, cur_pb, net, relation, timing);
            }
        }

        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        *cluster
            .pb_mut(cur_pb)
            .stats
            .as_mut()
            .unwrap()
            .num_pins_of_net_in_pb
            .entry(net)
            .or_insert(0) += 1;
    }
}

/* Sharing gain counts nets in common with the growing cluster; hill gain is
 * the pin saving a candidate would bring. */
fn update_sharing_and_hill_gain(
    legalizer: &mut ClusterLegalizer,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    cur_pb: PbId,
    net: AtomNetId,
) {
    let pins: Vec<AtomPinId> = if netlist.net_feeds_driving_block(net) {
        /* Skip the driving pin so the looped-back block counts once. */
        netlist.net_sinks(net).to_vec()
    } else {
        netlist.net_pins(net).collect()
    };

    for pin in pins {
        let blk = netlist.pin_block(pin);
        if legalizer.atom_cluster[blk.0].is_some() {
            continue;
        }
        let ext_inputs = netlist.num_ext_inputs(blk) as f32;
        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();
        if !stats.sharing_gain.contains_key(&blk) {
            stats.marked_blocks.push(blk);
            stats.sharing_gain.insert(blk, 1.);
            stats.hill_gain.insert(blk, 1. - ext_inputs);
        } else {
            *stats.sharing_gain.get_mut(&blk).unwrap() += 1.;
            *stats.hill_gain.get_mut(&blk).unwrap() += 1.;
        }
    }
}

fn update_connection_gain_values(
    legalizer: &mut ClusterLegalizer,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    cur_pb: PbId,
    clustered_blk: AtomBlockId,
    net: AtomNetId,
    relation: NetRelation,
) {
    /* Split the net's terminals into connections absorbed at the clustered
     * block, still-open ones and ones stuck in other clusters; an open
     * terminal close to absorption is worth the most. */
    let clustered_pb = legalizer.atom_pb[clustered_blk.0]
        .map(|(_, pb)| pb)
        .expect("gain update runs on a placed block");

    let mut num_internal = 0usize;
    let mut num_open = 0usize;
    let mut num_stuck = 0usize;

    for pin in netlist.net_pins(net).collect::<Vec<_>>() {
        let blk = netlist.pin_block(pin);
        match legalizer.atom_cluster[blk.0] {
            Some(cid) if cid == cluster_id
                && atom_in_pb(legalizer, cluster_id, blk, clustered_pb) =>
            {
                num_internal += 1
            }
            Some(_) => num_stuck += 1,
            None => num_open += 1,
        }
    }

    let weight = 1. / (num_open as f32 + 1.5 * num_stuck as f32 + 0.1);
    let crowded_weight = 1. / (num_open as f32 + 1.5 * num_stuck as f32 + 0.1 + 1.);

    match relation {
        NetRelation::Output => {
            for pin in netlist.net_sinks(net).to_vec() {
                let blk = netlist.pin_block(pin);
                if legalizer.atom_cluster[blk.0].is_none() {
                    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
                    let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();
                    let gain = stats.connection_gain.entry(blk).or_insert(0.);
                    if num_internal > 1 {
                        *gain -= crowded_weight;
                    }
                    *gain += weight;
                }
            }
        }
        NetRelation::Input => {
            if let Some(driver) = netlist.net_driver_block(net) {
                if legalizer.atom_cluster[driver.0].is_none() {
                    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
                    let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();
                    let gain = stats.connection_gain.entry(driver).or_insert(0.);
                    if num_internal > 1 {
                        *gain -= crowded_weight;
                    }
                    *gain += weight;
                }
            }
        }
    }
}

fn atom_in_pb(
    legalizer: &ClusterLegalizer,
    cluster_id: ClusterId,
    blk: AtomBlockId,
    pb: PbId,
) -> bool {
    let mut cur = match legalizer.atom_pb[blk.0] {
        Some((cid, pb_id)) if cid == cluster_id => Some(pb_id),
        _ => return false,
    };
    let cluster = legalizer.cluster(cluster_id);
    while let Some(pb_id) = cur {
        if pb_id == pb {
            return true;
        }
        cur = cluster.pb(pb_id).parent;
    }
    false
}

fn update_timing_gain_values(
    legalizer: &mut ClusterLegalizer,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    cur_pb: PbId,
    net: AtomNetId,
    relation: NetRelation,
    timing: &TimingInfo,
) {
    match relation {
        NetRelation::Output => {
            let sinks: Vec<AtomPinId> = netlist.net_sinks(net).to_vec();
            for pin in sinks {
                let blk = netlist.pin_block(pin);
                if legalizer.atom_cluster[blk.0].is_none() {
                    let crit = timing.criticality(pin);
                    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
                    let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();
                    let gain = stats.timing_gain.entry(blk).or_insert(0.);
                    if crit > *gain {
                        *gain = crit;
                    }
                }
            }
        }
        NetRelation::Input => {
            /* Credit the unclustered driver with the most critical sink of
             * the net it feeds into the cluster. */
            let driver = match netlist.net_driver_block(net) {
                Some(d) => d,
                None => return,
            };
            if legalizer.atom_cluster[driver.0].is_some() {
                return;
            }
            for pin in netlist.net_sinks(net).to_vec() {
                let crit = timing.criticality(pin);
                let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
                let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();
                let gain = stats.timing_gain.entry(driver).or_insert(0.);
                if crit > *gain {
                    *gain = crit;
                }
            }
        }
    }
}

fn update_total_gain(
    legalizer: &mut ClusterLegalizer,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    atom_pb: PbId,
    timing_driven: bool,
    opts: &PackerOpts,
) {
    let chain = pb_parent_chain(legalizer.cluster(cluster_id), atom_pb);
    for cur_pb in chain {
        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        let stats = cluster.pb_mut(cur_pb).stats.as_mut().unwrap();

        let marked = stats.marked_blocks.clone();
        for blk in marked {
            let sharing = stats.sharing_gain.get(&blk).copied().unwrap_or(0.);
            let connection = stats.connection_gain.get(&blk).copied().unwrap_or(0.);
            stats.connection_gain.entry(blk).or_insert(0.);
            stats.sharing_gain.entry(blk).or_insert(0.);

            let num_used_pins = netlist.num_used_pins(blk).max(1) as f32;

            let mut gain = if opts.connection_driven {
                ((1. - opts.beta) * sharing + opts.beta * connection) / num_used_pins
            } else {
                sharing / num_used_pins
            };
            if timing_driven {
                let timing_gain = stats.timing_gain.get(&blk).copied().unwrap_or(0.);
                gain = opts.alpha * timing_gain + (1. - opts.alpha) * gain;
            }
            stats.gain.insert(blk, gain);
        }
    }
}

/* Gain of packing a whole molecule: member gains, base gain as tie breaker,
 * and a small penalty per input a gain-less member would drag in. */
fn get_molecule_gain(
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    molecule: MoleculeId,
    blk_gain: &HashMap<AtomBlockId, f32>,
) -> f32 {
    let mol = store.molecule(molecule);
    let mut gain = 0.;
    let mut num_introduced_inputs = 0usize;

    for atom in mol.atom_ids() {
        if let Some(g) = blk_gain.get(&atom) {
            gain += g;
        } else {
            for pin in netlist.block_pins_of_dir(atom, PortDir::Input) {
                let net = netlist.pin_net(pin);
                let driver = netlist.net_driver_block(net);
                let internal = driver.map(|d| mol.atom_ids().any(|a| a == d)).unwrap_or(false);
                if !internal {
                    num_introduced_inputs += 1;
                }
            }
        }
    }

    gain += store.base_gain(molecule) * 0.0001;
    gain -= num_introduced_inputs as f32 * 0.001;
    gain
}

/* Bounded ascending-gain insertion into the candidate array; the best
 * candidate sits at the end. */
fn add_molecule_to_candidates(
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    stats: &mut crate::cluster::PbStats,
    molecule: MoleculeId,
    max_queue_size: usize,
) {
    let num = stats.num_feasible_blocks.unwrap_or(0);
    for i in 0..num {
        if stats.feasible_blocks[i] == molecule {
            return; /* already queued */
        }
    }

    let gain_of = |m: MoleculeId| get_molecule_gain(netlist, store, m, &stats.gain);

    if num >= max_queue_size - 1 {
        /* Full: drop the worst if the newcomer beats it. */
        if gain_of(molecule) > gain_of(stats.feasible_blocks[0]) {
            let mut j = 0;
            while j < num - 1 {
                if gain_of(molecule) <= gain_of(stats.feasible_blocks[j + 1]) {
                    break;
                }
                stats.feasible_blocks[j] = stats.feasible_blocks[j + 1];
                j += 1;
            }
            stats.feasible_blocks[j] = molecule;
        }
        stats.num_feasible_blocks = Some(num);
    } else {
        let mut j = num;
        while j > 0 {
            if gain_of(stats.feasible_blocks[j - 1]) > gain_of(molecule) {
                stats.feasible_blocks[j] = stats.feasible_blocks[j - 1];
            } else {
                break;
            }
            j -= 1;
        }
        stats.feasible_blocks[j] = molecule;
        stats.num_feasible_blocks = Some(num + 1);
    }
}

fn exists_free_primitives_for_molecule(
    legalizer: &ClusterLegalizer,
    netlist: &AtomNetlist,
    store: &MoleculeStore,
    cluster_id: ClusterId,
    molecule: MoleculeId,
) -> bool {
    let type_idx = legalizer.cluster(cluster_id).block_type.0;
    store.molecule(molecule).atom_ids().all(|atom| {
        legalizer.placement_stats[type_idx].exists_free_primitive_for_atom(
            legalizer.arch,
            netlist,
            atom,
        )
    })
}

/* Candidate priority: (1) gain-marked neighbours, (2) the cached high-fanout
 * tie-break net, (3) neighbours of neighbouring clusters (two hops). */
fn get_highest_gain_molecule(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    clb_inter_blk_nets: &[Vec<AtomNetId>],
) -> Option<MoleculeId> {
    if legalizer.cluster(cluster_id).root_stats().num_feasible_blocks.is_none() {
        rebuild_marked_candidates(legalizer, store, netlist, cluster_id);
    }

    if legalizer.cluster(cluster_id).root_stats().num_feasible_blocks == Some(0) {
        if let Some(net) = legalizer.cluster(cluster_id).root_stats().tie_break_high_fanout_net {
            explore_high_fanout_net(legalizer, store, netlist, cluster_id, net);
        }
    }

    if legalizer.cluster(cluster_id).root_stats().num_feasible_blocks == Some(0)
        && legalizer.cluster(cluster_id).root_stats().tie_break_high_fanout_net.is_none()
        && legalizer.cluster(cluster_id).root_stats().explore_transitive_fanout
    {
        explore_transitive_fanout(
            legalizer, store, netlist, cluster_id, clb_inter_blk_nets,
        );
    }

    /* Grab the best remaining candidate. */
    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
    let stats = cluster.root_stats_mut();
    let num = stats.num_feasible_blocks.unwrap_or(0);
    if num == 0 {
        return None;
    }
    stats.num_feasible_blocks = Some(num - 1);
    let molecule = stats.feasible_blocks[num - 1];
    debug_assert!(store.valid(molecule));
    Some(molecule)
}

fn rebuild_marked_candidates(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
) {
    {
        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        let stats = cluster.root_stats_mut();
        stats.num_feasible_blocks = Some(0);
        /* If nothing turns up, allow exploring two hops away. */
        stats.explore_transitive_fanout = true;
    }

    let marked: Vec<AtomBlockId> = legalizer
        .cluster(cluster_id)
        .root_stats()
        .marked_blocks
        .clone();
    for blk in marked {
        if legalizer.atom_cluster[blk.0].is_some() {
            continue;
        }
        for molecule in store.atom_molecules(blk).to_vec() {
            if !store.valid(molecule) {
                continue;
            }
            if !exists_free_primitives_for_molecule(legalizer, netlist, store, cluster_id, molecule)
            {
                continue;
            }
            let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
            add_molecule_to_candidates(
                netlist,
                store,
                cluster.root_stats_mut(),
                molecule,
                MAX_FEASIBLE_BLOCK_ARRAY_SIZE,
            );
        }
    }
}

/* The ignored high-fanout net can still seed lightly related candidates. */
fn explore_high_fanout_net(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    net: AtomNetId,
) {
    let type_idx = legalizer.cluster(cluster_id).block_type.0;
    legalizer.placement_stats[type_idx].reset_tried_but_unused();

    let mut count = 0;
    for pin in netlist.net_pins(net).collect::<Vec<_>>() {
        if count >= MAX_HIGH_FANOUT_EXPLORE {
            break;
        }
        let blk = netlist.pin_block(pin);
        if legalizer.atom_cluster[blk.0].is_some() {
            continue;
        }
        for molecule in store.atom_molecules(blk).to_vec() {
            if !store.valid(molecule) {
                continue;
            }
            if !exists_free_primitives_for_molecule(legalizer, netlist, store, cluster_id, molecule)
            {
                continue;
            }
            let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
            add_molecule_to_candidates(
                netlist,
                store,
                cluster.root_stats_mut(),
                molecule,
                MAX_FEASIBLE_BLOCK_ARRAY_SIZE.min(MAX_HIGH_FANOUT_EXPLORE),
            );
            count += 1;
        }
    }

    /* This net has had its chance. */
    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
    cluster.root_stats_mut().tie_break_high_fanout_net = None;
}

fn explore_transitive_fanout(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    clb_inter_blk_nets: &[Vec<AtomNetId>],
) {
    let first_visit = legalizer
        .cluster(cluster_id)
        .root_stats()
        .transitive_fanout_candidates
        .is_none();

    if !first_visit {
        /* No more transitive candidates to consider. */
        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        let stats = cluster.root_stats_mut();
        stats.transitive_fanout_candidates = None;
        stats.explore_transitive_fanout = false;
        return;
    }

    let mut candidates: Vec<MoleculeId> = Vec::new();
    let marked_nets: Vec<AtomNetId> = legalizer
        .cluster(cluster_id)
        .root_stats()
        .marked_nets
        .clone();

    for net in marked_nets {
        if netlist.net_pins(net).count() >= MAX_TRANSITIVE_FANOUT_EXPLORE + 1 {
            continue;
        }
        for pin in netlist.net_pins(net).collect::<Vec<_>>() {
            let blk = netlist.pin_block(pin);
            let tclb = match legalizer.atom_cluster[blk.0] {
                Some(c) if c != cluster_id => c,
                _ => continue,
            };
            let inter_nets = match clb_inter_blk_nets.get(tclb.0) {
                Some(nets) => nets.clone(),
                None => continue,
            };
            for tnet in inter_nets {
                for tpin in netlist.net_pins(tnet).collect::<Vec<_>>() {
                    let blk2 = netlist.pin_block(tpin);
                    if legalizer.atom_cluster[blk2.0].is_some() {
                        continue;
                    }
                    {
                        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
                        let stats = cluster.root_stats_mut();
                        *stats.gain.entry(blk2).or_insert(0.) += 0.001;
                    }
                    for molecule in store.atom_molecules(blk2).to_vec() {
                        if store.valid(molecule) && !candidates.contains(&molecule) {
                            candidates.push(molecule);
                        }
                    }
                }
            }
        }
    }

    for molecule in &candidates {
        if !exists_free_primitives_for_molecule(legalizer, netlist, store, cluster_id, *molecule) {
            continue;
        }
        let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
        add_molecule_to_candidates(
            netlist,
            store,
            cluster.root_stats_mut(),
            *molecule,
            MAX_FEASIBLE_BLOCK_ARRAY_SIZE.min(MAX_TRANSITIVE_EXPLORE),
        );
    }

    let cluster = legalizer.clusters[cluster_id.0].as_mut().unwrap();
    cluster.root_stats_mut().transitive_fanout_candidates = Some(candidates);
}

fn get_molecule_for_cluster(
    legalizer: &mut ClusterLegalizer,
    store: &MoleculeStore,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
    unclustered: &UnclusteredIndex,
    opts: &PackerOpts,
    num_unrelated_attempts: &mut usize,
    clb_inter_blk_nets: &[Vec<AtomNetId>],
) -> Option<MoleculeId> {
    let best = get_highest_gain_molecule(legalizer, store, netlist, cluster_id, clb_inter_blk_nets);

    if best.is_some() {
        *num_unrelated_attempts = 0;
        return best;
    }

    if opts.allow_unrelated_clustering && *num_unrelated_attempts == 0 {
        *num_unrelated_attempts += 1;

        /* Remaining external-input capacity bounds how hungry an unrelated
         * molecule may be. */
        let type_idx = legalizer.cluster(cluster_id).block_type.0;
        let pb_graph = &legalizer.pb_graphs[type_idx];
        let root = pb_graph.node(pb_graph.root);
        let total_inputs: usize = root.input_pin_classes.iter().map(|c| c.num_pins).sum();
        let used_inputs: usize = legalizer
            .cluster(cluster_id)
            .root_stats()
            .input_pins_used
            .iter()
            .map(|m| m.len())
            .sum();
        let inputs_avail = total_inputs.saturating_sub(used_inputs);

        return unclustered.molecule_with_most_ext_inputs(store, inputs_avail, |m| {
            exists_free_primitives_for_molecule(legalizer, netlist, store, cluster_id, m)
        });
    }

    None
}

fn record_inter_block_nets(
    clb_inter_blk_nets: &mut Vec<Vec<AtomNetId>>,
    cluster: &Cluster,
    netlist: &AtomNetlist,
    cluster_id: ClusterId,
) {
    while clb_inter_blk_nets.len() <= cluster_id.0 {
        clb_inter_blk_nets.push(Vec::new());
    }
    let stats = cluster.root_stats();
    for net in &stats.marked_nets {
        let total = netlist.net_pins(*net).count();
        let inside = stats.num_pins_of_net_in_pb.get(net).copied().unwrap_or(0);
        let external_terminals = total.saturating_sub(inside);
        if external_terminals > 0 && external_terminals < MAX_TRANSITIVE_FANOUT_EXPLORE {
            clb_inter_blk_nets[cluster_id.0].push(*net);
        }
    }
}

fn build_output(arch: &Arch, netlist: &AtomNetlist, legalizer: &ClusterLegalizer) -> PackOutput {
    let mut clusters = Vec::new();
    let mut type_usage: HashMap<String, usize> = HashMap::new();

    for id in legalizer.cluster_ids() {
        let cluster = legalizer.cluster(id);
        let block_type = arch.block_type(cluster.block_type);
        let pb_type = arch.pb_type(block_type.pb_type);
        *type_usage.entry(block_type.name.clone()).or_insert(0) += 1;

        let mut pb_route: Vec<PbRouteRecord> = cluster
            .pb_route
            .iter()
            .map(|(pin, entry)| PbRouteRecord {
                pin: *pin,
                driver_pin: entry.driver_pin,
                net: netlist.net(entry.net).name.clone(),
            })
            .collect();
        pb_route.sort_by_key(|r| r.pin);

        clusters.push(ClusterRecord {
            name: cluster.name.clone(),
            block_type: block_type.name.clone(),
            mode: pb_type
                .modes
                .get(cluster.mode)
                .map(|m| m.name.clone())
                .unwrap_or_default(),
            atoms: cluster
                .atoms()
                .map(|a| netlist.block(a).name.clone())
                .collect(),
            pb_route,
            region: cluster.region.clone(),
            noc_group: cluster.noc_group.map(|g| g.0),
        });
    }

    PackOutput {
        clusters,
        atom_cluster: legalizer
            .atom_cluster
            .iter()
            .map(|c| c.map(|id| id.0))
            .collect(),
        type_usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_order_prefers_bigger_molecules() {
        let netlist = crate::netlist::NetlistSpec {
            blocks: vec![
                crate::netlist::BlockSpec {
                    name: "a".into(),
                    model: ".names".into(),
                    ports: vec![
                        crate::netlist::PortConnSpec {
                            port: "in".into(),
                            dir: PortDir::Input,
                            nets: vec!["x".into()],
                        },
                        crate::netlist::PortConnSpec {
                            port: "out".into(),
                            dir: PortDir::Output,
                            nets: vec!["n".into()],
                        },
                    ],
                },
                crate::netlist::BlockSpec {
                    name: "b".into(),
                    model: ".names".into(),
                    ports: vec![
                        crate::netlist::PortConnSpec {
                            port: "in".into(),
                            dir: PortDir::Input,
                            nets: vec!["n".into(), "y".into()],
                        },
                        crate::netlist::PortConnSpec {
                            port: "out".into(),
                            dir: PortDir::Output,
                            nets: vec!["o".into()],
                        },
                    ],
                },
            ],
        }
        .compile()
        .unwrap();

        let store = crate::molecule::build_molecules(&netlist, &[]).unwrap();
        let opts = PackerOpts::default();
        let crit = vec![0.; 2];
        let order = build_seed_order(&netlist, &store, &opts, &crit);
        /* 'b' has two external inputs to 'a''s one */
        assert_eq!(order[0], AtomBlockId(1));
    }

    #[test]
    fn test_clock_net_detection() {
        let netlist = crate::netlist::NetlistSpec {
            blocks: vec![crate::netlist::BlockSpec {
                name: "ff".into(),
                model: ".latch".into(),
                ports: vec![
                    crate::netlist::PortConnSpec {
                        port: "d".into(),
                        dir: PortDir::Input,
                        nets: vec!["d".into()],
                    },
                    crate::netlist::PortConnSpec {
                        port: "clk".into(),
                        dir: PortDir::Clock,
                        nets: vec!["clk".into()],
                    },
                    crate::netlist::PortConnSpec {
                        port: "q".into(),
                        dir: PortDir::Output,
                        nets: vec!["q".into()],
                    },
                ],
            }],
        }
        .compile()
        .unwrap();

        let clocks = find_clock_nets(&netlist);
        assert_eq!(clocks.len(), 1);
        let clk = netlist.net_ids().find(|n| netlist.net(*n).name == "clk").unwrap();
        assert!(clocks.contains(&clk));
    }
}
