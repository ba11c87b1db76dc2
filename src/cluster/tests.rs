use super::*;
use crate::arch::{build_pb_graphs, ArchSpec};
use crate::clusterer::{do_clustering, PackerOpts};
use crate::floorplan::{PartitionId, Region};
use crate::molecule::build_molecules;
use crate::netlist::NetlistSpec;
use crate::rr_graph::{build_lb_rr_graph, build_lb_rr_graph_info};

fn lut_clb_arch(num_bles: usize) -> ArchSpec {
    serde_yaml::from_str(&format!(
        r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {{name: in, dir: input, width: 8}}
        - {{name: out, dir: output, width: {num_bles}}}
      modes:
        - name: default
          children:
            - pb_type:
                name: ble
                ports:
                  - {{name: in, dir: input, width: 4}}
                  - {{name: out, dir: output, width: 1}}
                modes:
                  - name: lut
                    children:
                      - pb_type:
                          name: lut4
                          model: .names
                          ports:
                            - {{name: in, dir: input, width: 4, equivalence: full}}
                            - {{name: out, dir: output, width: 1}}
                    interconnect:
                      - {{kind: direct, from: [parent.in], to: [lut4.in]}}
                      - {{kind: direct, from: [lut4.out], to: [parent.out]}}
              count: {num_bles}
          interconnect:
            - {{kind: complete, from: [parent.in, ble.out], to: [ble.in]}}
            - {{kind: direct, from: [ble.out], to: [parent.out]}}
"#
    ))
    .unwrap()
}

/* Everything a legalizer borrows, bundled so tests can own it in one place. */
struct Env {
    arch: crate::arch::Arch,
    netlist: crate::netlist::AtomNetlist,
    pb_graphs: Vec<crate::arch::PbGraph>,
    rr_graphs: Vec<crate::rr_graph::LbRrGraph>,
    rr_infos: Vec<crate::rr_graph::LbRrGraphInfo>,
    floorplan: FloorplanConstraints,
}

impl Env {
    fn new(arch_spec: ArchSpec, netlist_yaml: &str) -> Self {
        let arch = arch_spec.compile().unwrap();
        let netlist = serde_yaml::from_str::<NetlistSpec>(netlist_yaml)
            .unwrap()
            .compile()
            .unwrap();
        let pb_graphs = build_pb_graphs(&arch);
        let rr_graphs: Vec<_> = pb_graphs
            .iter()
            .map(|g| build_lb_rr_graph(&arch, g))
            .collect();
        let rr_infos: Vec<_> = rr_graphs.iter().map(build_lb_rr_graph_info).collect();
        Env {
            arch,
            netlist,
            pb_graphs,
            rr_graphs,
            rr_infos,
            floorplan: FloorplanConstraints::default(),
        }
    }

    fn legalizer(&self, strategy: LegalizationStrategy) -> ClusterLegalizer {
        ClusterLegalizer::new(
            &self.arch,
            &self.netlist,
            &self.pb_graphs,
            &self.rr_graphs,
            &self.rr_infos,
            &self.floorplan,
            vec![None; self.netlist.blocks.len()],
            LegalizerOpts::default(),
            strategy,
        )
    }
}

#[test]
fn test_singleton_lut_cluster() {
    let env = Env::new(
        lut_clb_arch(4),
        r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: out, dir: output, nets: [o]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();

    let output = do_clustering(
        &env.arch,
        &env.netlist,
        &mut store,
        &env.floorplan,
        vec![None; env.netlist.blocks.len()],
        None,
        &PackerOpts::default(),
    )
    .unwrap();

    assert_eq!(output.clusters.len(), 1);
    let record = &output.clusters[0];
    assert_eq!(record.block_type, "clb");
    assert_eq!(record.mode, "default");
    assert_eq!(record.atoms, vec!["l1".to_string()]);

    /* The lone output net never leaves the lut output pin. */
    let lut0 = env.pb_graphs[0].primitives(&env.arch).next().unwrap();
    let lut0_out = env.pb_graphs[0].node(lut0).pins_by_port[1][0];
    assert_eq!(record.pb_route.len(), 1);
    assert_eq!(record.pb_route[0].pin, lut0_out.0);
    assert_eq!(record.pb_route[0].driver_pin, None);
    assert_eq!(record.pb_route[0].net, "o");

    assert_eq!(output.atom_cluster, vec![Some(0)]);
    assert_eq!(output.type_usage.get("clb"), Some(&1));
}

#[test]
fn test_absorbed_chain_in_one_cluster() {
    /* Three chained LUTs pack into one cluster; the two chain nets are
     * fully absorbed while the output crosses the boundary once. */
    let env = Env::new(
        lut_clb_arch(4),
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
      - {port: in, dir: input, nets: [n2, c]}
      - {port: out, dir: output, nets: [o]}
  - name: consumer
    model: .names
    ports:
      - {port: in, dir: input, nets: [o]}
      - {port: out, dir: output, nets: [unused]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();
    let mut legalizer = env.legalizer(LegalizationStrategy::Full);

    let mol_of = |store: &crate::molecule::MoleculeStore, atom: usize| {
        store.atom_molecules(crate::netlist::AtomBlockId(atom))[0]
    };

    let seed = mol_of(&store, 0);
    let (status, id) =
        legalizer.start_new_cluster(&mut store, seed, crate::arch::BlockTypeId(0), 0);
    assert!(status.passed());
    let id = id.unwrap();

    for atom in 1..3 {
        let mol = mol_of(&store, atom);
        let status = legalizer.add_mol_to_cluster(&mut store, mol, id);
        assert!(status.passed(), "atom {} failed: {:?}", atom, status);
    }

    let cluster = legalizer.cluster(id);
    let router = cluster.router.as_ref().unwrap();
    let saved = router.saved_nets.as_ref().unwrap();
    let ext_rr = env.rr_graphs[0].ext_rr;

    for net_name in ["n1", "n2"] {
        let net = saved
            .iter()
            .find(|n| env.netlist.net(n.net).name == net_name)
            .unwrap();
        let mut uses = 0;
        net.route.visit(&mut |node| {
            if node == ext_rr {
                uses += 1;
            }
        });
        assert_eq!(uses, 0, "net {} should be absorbed", net_name);
    }

    let o = saved
        .iter()
        .find(|n| env.netlist.net(n.net).name == "o")
        .unwrap();
    let mut uses = 0;
    o.route.visit(&mut |node| {
        if node == ext_rr {
            uses += 1;
        }
    });
    assert_eq!(uses, 1);
}

#[test]
fn test_capacity_overflow_opens_second_cluster() {
    /* Four independent LUTs compete for a three-BLE cluster. */
    let env = Env::new(
        lut_clb_arch(3),
        r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: in, dir: input, nets: [a]}
      - {port: out, dir: output, nets: [o1]}
  - name: l2
    model: .names
    ports:
      - {port: in, dir: input, nets: [b]}
      - {port: out, dir: output, nets: [o2]}
  - name: l3
    model: .names
    ports:
      - {port: in, dir: input, nets: [c]}
      - {port: out, dir: output, nets: [o3]}
  - name: l4
    model: .names
    ports:
      - {port: in, dir: input, nets: [d]}
      - {port: out, dir: output, nets: [o4]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();

    let output = do_clustering(
        &env.arch,
        &env.netlist,
        &mut store,
        &env.floorplan,
        vec![None; env.netlist.blocks.len()],
        None,
        &PackerOpts::default(),
    )
    .unwrap();

    assert_eq!(output.clusters.len(), 2);
    let mut sizes: Vec<usize> = output.clusters.iter().map(|c| c.atoms.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 3]);
    /* every atom landed somewhere */
    assert!(output.atom_cluster.iter().all(|c| c.is_some()));
}

fn memory_arch() -> ArchSpec {
    serde_yaml::from_str(
        r#"
block_types:
  - pb_type:
      name: memclb
      ports:
        - {name: addr, dir: input, width: 2}
        - {name: din, dir: input, width: 2}
        - {name: dout, dir: output, width: 2}
        - {name: clk, dir: clock, width: 1}
      modes:
        - name: default
          children:
            - pb_type:
                name: mem
                class: memory
                ports:
                  - {name: addr, dir: input, width: 2, class: address}
                  - {name: din, dir: input, width: 2, class: data_in}
                  - {name: dout, dir: output, width: 2, class: data_out}
                  - {name: clk, dir: clock, width: 1}
                modes:
                  - name: sp
                    children:
                      - pb_type:
                          name: ram_slice
                          model: .subckt sp_ram
                          class: memory
                          ports:
                            - {name: addr, dir: input, width: 2, class: address}
                            - {name: din, dir: input, width: 1, class: data_in}
                            - {name: dout, dir: output, width: 1, class: data_out}
                            - {name: clk, dir: clock, width: 1}
                        count: 2
                    interconnect:
                      - {kind: complete, from: [parent.addr], to: [ram_slice.addr]}
                      - {kind: direct, from: [parent.din], to: [ram_slice.din]}
                      - {kind: direct, from: [ram_slice.dout], to: [parent.dout]}
                      - {kind: complete, from: [parent.clk], to: [ram_slice.clk]}
          interconnect:
            - {kind: direct, from: [parent.addr], to: [mem.addr]}
            - {kind: direct, from: [parent.din], to: [mem.din]}
            - {kind: direct, from: [mem.dout], to: [parent.dout]}
            - {kind: direct, from: [parent.clk], to: [mem.clk]}
"#,
    )
    .unwrap()
}

#[test]
fn test_memory_sibling_net_mismatch_rejected() {
    /* Two RAM slices with equal address buses but different clocks must not
     * share the memory block. */
    let env = Env::new(
        memory_arch(),
        r#"
blocks:
  - name: slice_a
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d0]}
      - {port: dout, dir: output, nets: [q0]}
      - {port: clk, dir: clock, nets: [clk_a]}
  - name: slice_b
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d1]}
      - {port: dout, dir: output, nets: [q1]}
      - {port: clk, dir: clock, nets: [clk_b]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();
    let mut legalizer = env.legalizer(LegalizationStrategy::SkipIntraLbRoute);

    let mol_a = store.atom_molecules(crate::netlist::AtomBlockId(0))[0];
    let mol_b = store.atom_molecules(crate::netlist::AtomBlockId(1))[0];

    let (status, id) =
        legalizer.start_new_cluster(&mut store, mol_a, crate::arch::BlockTypeId(0), 0);
    assert!(status.passed());
    let id = id.unwrap();

    let status = legalizer.add_mol_to_cluster(&mut store, mol_b, id);
    assert_eq!(status, BlockPackStatus::FailedFeasible);

    /* slice_b fully reverted */
    assert!(legalizer.atom_cluster[1].is_none());
    assert!(legalizer.atom_pb[1].is_none());
    assert!(store.valid(mol_b));
}

#[test]
fn test_memory_sibling_match_accepted() {
    let env = Env::new(
        memory_arch(),
        r#"
blocks:
  - name: slice_a
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d0]}
      - {port: dout, dir: output, nets: [q0]}
      - {port: clk, dir: clock, nets: [clk]}
  - name: slice_b
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d1]}
      - {port: dout, dir: output, nets: [q1]}
      - {port: clk, dir: clock, nets: [clk]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();
    let mut legalizer = env.legalizer(LegalizationStrategy::SkipIntraLbRoute);

    let mol_a = store.atom_molecules(crate::netlist::AtomBlockId(0))[0];
    let mol_b = store.atom_molecules(crate::netlist::AtomBlockId(1))[0];

    let (status, id) =
        legalizer.start_new_cluster(&mut store, mol_a, crate::arch::BlockTypeId(0), 0);
    assert!(status.passed());
    let status = legalizer.add_mol_to_cluster(&mut store, mol_b, id.unwrap());
    assert!(status.passed());
}

#[test]
fn test_disjoint_floorplan_regions_split_clusters() {
    let arch = lut_clb_arch(4).compile().unwrap();
    let netlist = serde_yaml::from_str::<NetlistSpec>(
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
      - {port: in, dir: input, nets: [n1]}
      - {port: out, dir: output, nets: [o]}
"#,
    )
    .unwrap()
    .compile()
    .unwrap();

    let floorplan = FloorplanConstraints {
        partitions: vec![
            PartitionRegion {
                regions: vec![Region { x_low: 0, y_low: 0, x_high: 1, y_high: 1 }],
            },
            PartitionRegion {
                regions: vec![Region { x_low: 5, y_low: 5, x_high: 6, y_high: 6 }],
            },
        ],
        atom_partition: vec![Some(PartitionId(0)), Some(PartitionId(1))],
    };

    let mut store = build_molecules(&netlist, &[]).unwrap();
    let output = do_clustering(
        &arch,
        &netlist,
        &mut store,
        &floorplan,
        vec![None; netlist.blocks.len()],
        None,
        &PackerOpts::default(),
    )
    .unwrap();

    assert_eq!(output.clusters.len(), 2);
    assert_ne!(output.atom_cluster[0], output.atom_cluster[1]);
    /* each cluster carries the region of its pinned atom */
    for record in &output.clusters {
        assert_eq!(record.region.regions.len(), 1);
    }
}

#[test]
fn test_noc_group_conflict_rejected() {
    let env = Env::new(
        lut_clb_arch(4),
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
      - {port: in, dir: input, nets: [n1]}
      - {port: out, dir: output, nets: [o]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();
    let mut legalizer = ClusterLegalizer::new(
        &env.arch,
        &env.netlist,
        &env.pb_graphs,
        &env.rr_graphs,
        &env.rr_infos,
        &env.floorplan,
        vec![Some(NocGroupId(0)), Some(NocGroupId(1))],
        LegalizerOpts::default(),
        LegalizationStrategy::Full,
    );

    let mol_a = store.atom_molecules(crate::netlist::AtomBlockId(0))[0];
    let mol_b = store.atom_molecules(crate::netlist::AtomBlockId(1))[0];

    let (status, id) =
        legalizer.start_new_cluster(&mut store, mol_a, crate::arch::BlockTypeId(0), 0);
    assert!(status.passed());
    let id = id.unwrap();
    assert_eq!(legalizer.cluster(id).noc_group, Some(NocGroupId(0)));

    let status = legalizer.add_mol_to_cluster(&mut store, mol_b, id);
    assert_eq!(status, BlockPackStatus::FailedNocGroup);
}

#[test]
fn test_failed_trial_leaves_no_trace() {
    /* A rejected molecule must not leak state: same live pbs, same router
     * nets, same atom maps as before the attempt. */
    let env = Env::new(
        memory_arch(),
        r#"
blocks:
  - name: slice_a
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d0]}
      - {port: dout, dir: output, nets: [q0]}
      - {port: clk, dir: clock, nets: [clk_a]}
  - name: slice_b
    model: .subckt sp_ram
    ports:
      - {port: addr, dir: input, nets: [a0, a1]}
      - {port: din, dir: input, nets: [d1]}
      - {port: dout, dir: output, nets: [q1]}
      - {port: clk, dir: clock, nets: [clk_b]}
"#,
    );
    let mut store = build_molecules(&env.netlist, &[]).unwrap();
    let mut legalizer = env.legalizer(LegalizationStrategy::SkipIntraLbRoute);

    let mol_a = store.atom_molecules(crate::netlist::AtomBlockId(0))[0];
    let mol_b = store.atom_molecules(crate::netlist::AtomBlockId(1))[0];

    let (status, id) =
        legalizer.start_new_cluster(&mut store, mol_a, crate::arch::BlockTypeId(0), 0);
    assert!(status.passed());
    let id = id.unwrap();

    let live_pbs_before: Vec<usize> = legalizer
        .cluster(id)
        .pbs
        .iter()
        .enumerate()
        .filter(|(_, pb)| pb.is_live())
        .map(|(i, _)| i)
        .collect();
    let router_nets_before = legalizer.cluster(id).router.as_ref().unwrap().nets.len();
    let atom_cluster_before = legalizer.atom_cluster.clone();

    let status = legalizer.add_mol_to_cluster(&mut store, mol_b, id);
    assert!(!status.passed());

    let live_pbs_after: Vec<usize> = legalizer
        .cluster(id)
        .pbs
        .iter()
        .enumerate()
        .filter(|(_, pb)| pb.is_live())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(live_pbs_before, live_pbs_after);
    assert_eq!(
        legalizer.cluster(id).router.as_ref().unwrap().nets.len(),
        router_nets_before
    );
    assert_eq!(legalizer.atom_cluster, atom_cluster_before);
    assert_eq!(legalizer.cluster(id).molecules, vec![mol_a]);
}

#[test]
fn test_root_mode_selected_by_seed_model() {
    /* A two-mode cluster: packing a latch must land in the ff mode. */
    let arch: ArchSpec = serde_yaml::from_str(
        r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: in, dir: input, width: 4}
        - {name: out, dir: output, width: 1}
        - {name: clk, dir: clock, width: 1}
      modes:
        - name: lutmode
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
        - name: ffmode
          children:
            - pb_type:
                name: ff
                model: .latch
                ports:
                  - {name: d, dir: input, width: 1}
                  - {name: q, dir: output, width: 1}
                  - {name: clk, dir: clock, width: 1}
          interconnect:
            - {kind: direct, from: ["parent.in[0]"], to: [ff.d]}
            - {kind: direct, from: [ff.q], to: [parent.out]}
            - {kind: complete, from: [parent.clk], to: [ff.clk]}
"#,
    )
    .unwrap();

    let netlist = serde_yaml::from_str::<NetlistSpec>(
        r#"
blocks:
  - name: ff0
    model: .latch
    ports:
      - {port: d, dir: input, nets: [d]}
      - {port: q, dir: output, nets: [q]}
      - {port: clk, dir: clock, nets: [clk]}
"#,
    )
    .unwrap()
    .compile()
    .unwrap();

    let arch = arch.compile().unwrap();
    let mut store = build_molecules(&netlist, &[]).unwrap();
    let output = do_clustering(
        &arch,
        &netlist,
        &mut store,
        &FloorplanConstraints::default(),
        vec![None; netlist.blocks.len()],
        None,
        &PackerOpts::default(),
    )
    .unwrap();

    assert_eq!(output.clusters.len(), 1);
    assert_eq!(output.clusters[0].mode, "ffmode");
}
