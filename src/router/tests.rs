use super::pathfinder::RouteResult;
use super::*;
use crate::arch::{build_pb_graphs, Arch, ArchSpec, PbGraph};
use crate::netlist::{AtomNetlist, NetlistSpec};
use crate::rr_graph::{build_lb_rr_graph, build_lb_rr_graph_info, LbRrGraph, LbRrGraphInfo};

fn feedback_clb(num_bles: usize) -> ArchSpec {
    /* Four-input LUT cluster with output feedback into the crossbar, so
     * LUT-to-LUT nets can be absorbed without leaving the cluster. */
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

struct Fixture {
    arch: Arch,
    graphs: Vec<PbGraph>,
    rr: LbRrGraph,
    info: LbRrGraphInfo,
    netlist: AtomNetlist,
}

fn fixture(arch_spec: ArchSpec, netlist_yaml: &str) -> Fixture {
    let arch = arch_spec.compile().unwrap();
    let graphs = build_pb_graphs(&arch);
    let rr = build_lb_rr_graph(&arch, &graphs[0]);
    let info = build_lb_rr_graph_info(&rr);
    let netlist: AtomNetlist = serde_yaml::from_str::<NetlistSpec>(netlist_yaml)
        .unwrap()
        .compile()
        .unwrap();
    Fixture {
        arch,
        graphs,
        rr,
        info,
        netlist,
    }
}

fn place_all_on_luts(fx: &Fixture, router: &mut RouterData) {
    let luts: Vec<_> = fx.graphs[0].primitives(&fx.arch).collect();
    for blk in fx.netlist.block_ids() {
        router.add_atom(
            &fx.rr,
            &fx.info,
            &fx.arch,
            &fx.graphs[0],
            &fx.netlist,
            blk,
            luts[blk.0],
        );
    }
}

fn saved_net<'r>(router: &'r RouterData, fx: &Fixture, name: &str) -> &'r SavedNet {
    router
        .saved_nets
        .as_ref()
        .unwrap()
        .iter()
        .find(|n| fx.netlist.net(n.net).name == name)
        .unwrap()
}

fn count_node_in_tree(tree: &RouteTree, node: usize) -> usize {
    let mut count = 0;
    tree.visit(&mut |n| {
        if n == node {
            count += 1;
        }
    });
    count
}

#[test]
fn test_absorbed_chain_avoids_boundary() {
    /* l1 -> l2 -> l3 through two nets; intermediate nets are absorbed, the
     * external output crosses the boundary exactly once. */
    let fx = fixture(
        feedback_clb(4),
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
  - name: sink_elsewhere
    model: .names
    ports:
      - {port: in, dir: input, nets: [o]}
"#,
    );

    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    let luts: Vec<_> = fx.graphs[0].primitives(&fx.arch).collect();
    for blk in 0..3 {
        router.add_atom(
            &fx.rr,
            &fx.info,
            &fx.arch,
            &fx.graphs[0],
            &fx.netlist,
            crate::netlist::AtomBlockId(blk),
            luts[blk],
        );
    }

    assert!(router.try_route(&fx.rr, &fx.netlist).routed());

    for net in ["n1", "n2"] {
        let saved = saved_net(&router, &fx, net);
        assert_eq!(count_node_in_tree(&saved.route, fx.rr.ext_rr), 0);
    }
    /* 'o' has a sink outside the cluster */
    let o = saved_net(&router, &fx, "o");
    assert_eq!(count_node_in_tree(&o.route, fx.rr.ext_rr), 1);
    /* external input nets enter through the boundary once each */
    let a = saved_net(&router, &fx, "a");
    assert_eq!(count_node_in_tree(&a.route, fx.rr.ext_rr), 1);
    assert_eq!(a.terminals[DRIVER_INDEX], fx.rr.ext_src);
}

#[test]
fn test_duplicate_equivalent_pins_stay_distinct() {
    /* One net drives two logically equivalent pins of a single LUT; the
     * terminals must target the explicit pin nodes, not the shared sink. */
    let fx = fixture(
        feedback_clb(4),
        r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: in, dir: input, nets: [x, "-", x]}
      - {port: out, dir: output, nets: [o]}
"#,
    );

    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    place_all_on_luts(&fx, &mut router);

    let x = fx
        .netlist
        .net_ids()
        .find(|n| fx.netlist.net(*n).name == "x")
        .unwrap();
    let lb_net = router.nets.iter().find(|n| n.net == x).unwrap();
    let sinks: Vec<usize> = lb_net.terminals[1..]
        .iter()
        .filter_map(|t| *t)
        .filter(|t| Some(*t) != lb_net.external_sink_index.and_then(|i| lb_net.terminals[i]))
        .collect();

    let pin_terminals: Vec<usize> = sinks
        .iter()
        .copied()
        .filter(|t| *t < fx.graphs[0].total_pb_pins)
        .collect();
    assert_eq!(pin_terminals.len(), 2);
    assert_ne!(pin_terminals[0], pin_terminals[1]);

    assert!(router.try_route(&fx.rr, &fx.netlist).routed());
    let pb_route = router.saved_pb_route(fx.graphs[0].total_pb_pins);
    for pin in pin_terminals {
        assert_eq!(pb_route.get(&pin).map(|e| e.net), Some(x));
    }
}

#[test]
fn test_duplicate_pins_on_instance_equivalent_port() {
    /* Instance equivalence shares the sink the same way full equivalence
     * does, so the duplicate-terminal remap must apply there too. */
    let arch_spec: ArchSpec = serde_yaml::from_str(
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

    let fx = fixture(
        arch_spec,
        r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: in, dir: input, nets: [x, "-", x]}
      - {port: out, dir: output, nets: [o]}
"#,
    );

    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    place_all_on_luts(&fx, &mut router);

    let x = fx
        .netlist
        .net_ids()
        .find(|n| fx.netlist.net(*n).name == "x")
        .unwrap();
    let lb_net = router.nets.iter().find(|n| n.net == x).unwrap();
    let pin_terminals: Vec<usize> = lb_net.terminals[1..]
        .iter()
        .filter_map(|t| *t)
        .filter(|t| *t < fx.graphs[0].total_pb_pins)
        .collect();
    assert_eq!(pin_terminals.len(), 2);
    assert_ne!(pin_terminals[0], pin_terminals[1]);

    assert!(router.try_route(&fx.rr, &fx.netlist).routed());
}

#[test]
fn test_boundary_capacity_overflow_is_infeasible() {
    /* A single-input cluster cannot feed two different external nets. */
    let arch_spec: ArchSpec = serde_yaml::from_str(
        r#"
block_types:
  - pb_type:
      name: clb
      ports:
        - {name: in, dir: input, width: 1}
        - {name: out, dir: output, width: 2}
      modes:
        - name: default
          children:
            - pb_type:
                name: lut1
                model: .names
                ports:
                  - {name: in, dir: input, width: 1}
                  - {name: out, dir: output, width: 1}
              count: 2
          interconnect:
            - {kind: complete, from: [parent.in], to: [lut1.in]}
            - {kind: direct, from: [lut1.out], to: [parent.out]}
"#,
    )
    .unwrap();

    let fx = fixture(
        arch_spec,
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
"#,
    );

    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    place_all_on_luts(&fx, &mut router);

    match router.try_route(&fx.rr, &fx.netlist) {
        RouteResult::Infeasible { .. } => {}
        other => panic!("expected infeasible route, got {:?}", other),
    }
    /* The congestion history of the contended boundary node accumulated
     * across iterations. */
    assert!(router.stats[fx.rr.ext_src].historical_usage > 0);
    assert!(router
        .congested_rr_nodes(&fx.rr)
        .contains(&fx.rr.ext_src));
}

#[test]
fn test_remove_atom_restores_net_state() {
    let fx = fixture(
        feedback_clb(4),
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

    let luts: Vec<_> = fx.graphs[0].primitives(&fx.arch).collect();
    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    router.add_atom(
        &fx.rr,
        &fx.info,
        &fx.arch,
        &fx.graphs[0],
        &fx.netlist,
        crate::netlist::AtomBlockId(0),
        luts[0],
    );
    let nets_before: Vec<(crate::netlist::AtomNetId, usize)> = router
        .nets
        .iter()
        .map(|n| (n.net, n.terminals.len()))
        .collect();

    /* Speculatively add the second atom, then revert it. */
    router.add_atom(
        &fx.rr,
        &fx.info,
        &fx.arch,
        &fx.graphs[0],
        &fx.netlist,
        crate::netlist::AtomBlockId(1),
        luts[1],
    );
    router.remove_atom(
        &fx.rr,
        &fx.info,
        &fx.arch,
        &fx.graphs[0],
        &fx.netlist,
        crate::netlist::AtomBlockId(1),
    );

    let nets_after: Vec<(crate::netlist::AtomNetId, usize)> = router
        .nets
        .iter()
        .map(|n| (n.net, n.terminals.len()))
        .collect();
    assert_eq!(nets_before, nets_after);
    assert!(router.try_route(&fx.rr, &fx.netlist).routed());
}

#[test]
fn test_route_then_capacity_invariant() {
    /* After a successful route every node's occupancy obeys its capacity. */
    let fx = fixture(
        feedback_clb(4),
        r#"
blocks:
  - name: l1
    model: .names
    ports:
      - {port: in, dir: input, nets: [a, b]}
      - {port: out, dir: output, nets: [n1]}
  - name: l2
    model: .names
    ports:
      - {port: in, dir: input, nets: [n1, a]}
      - {port: out, dir: output, nets: [o]}
"#,
    );

    let mut router = RouterData::new(fx.rr.nodes.len(), RouterParams::default());
    place_all_on_luts(&fx, &mut router);
    assert!(router.try_route(&fx.rr, &fx.netlist).routed());
    assert!(router.congested_rr_nodes(&fx.rr).is_empty());
}
