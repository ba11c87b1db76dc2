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


use clap::Parser;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[macro_use]
extern crate serde;

use clbpack::arch::ArchSpec;
use clbpack::clusterer::{do_clustering, DetailedRoutingStage, PackerOpts, SeedPolicy};
use clbpack::floorplan::{FloorplanConstraints, NocGroupId, PartitionId, PartitionRegion};
use clbpack::molecule::{build_molecules, MoleculeSpec};
use clbpack::netlist::NetlistSpec;

#[derive(Parser, Debug)]
#[clap(
    author = "Antmicro",
    version = "0.1.0",
    about = "CLBPACK - Complex Logic Block PACKer",
    long_about = None
)]
struct Args {
    #[clap(help = "Packing testcase file (YAML: architecture, netlist, options)")]
    testcase: String,
    #[clap(long, help = "Write packed clusters to this file in JSON format")]
    json: Option<String>,
    #[clap(long, help = "Seed selection policy: blend, timing or maxinputs")]
    seed: Option<String>,
    #[clap(long, help = "Disable the unrelated-clustering fallback")]
    no_unrelated: bool,
    #[clap(long, help = "Disable the speculative pin feasibility filter")]
    no_pin_filter: bool,
}

#[derive(Deserialize)]
struct PackSpec {
    arch: ArchSpec,
    netlist: NetlistSpec,
    #[serde(default)]
    molecules: Vec<MoleculeSpec>,
    #[serde(default)]
    floorplan: Option<FloorplanSpec>,
    #[serde(default)]
    noc_groups: HashMap<String, usize>,
    #[serde(default)]
    options: OptionsSpec,
}

#[derive(Deserialize)]
struct FloorplanSpec {
    partitions: Vec<PartitionRegion>,
    atoms: HashMap<String, usize>,
}

#[derive(Deserialize, Default)]
struct OptionsSpec {
    alpha: Option<f32>,
    beta: Option<f32>,
    allow_unrelated_clustering: Option<bool>,
    balance_block_type_util: Option<bool>,
    enable_pin_feasibility_filter: Option<bool>,
    connection_driven: Option<bool>,
    global_clocks: Option<bool>,
    seed_policy: Option<SeedPolicy>,
    detailed_routing: Option<DetailedRoutingStage>,
    target_pin_util: Option<HashMap<String, (f32, f32)>>,
    high_fanout_threshold: Option<HashMap<String, usize>>,
}

fn load_opts(spec: &OptionsSpec, args: &Args) -> PackerOpts {
    let mut opts = PackerOpts::default();
    if let Some(v) = spec.alpha {
        opts.alpha = v;
    }
    if let Some(v) = spec.beta {
        opts.beta = v;
    }
    if let Some(v) = spec.allow_unrelated_clustering {
        opts.allow_unrelated_clustering = v;
    }
    if let Some(v) = spec.balance_block_type_util {
        opts.balance_block_type_util = v;
    }
    if let Some(v) = spec.enable_pin_feasibility_filter {
        opts.enable_pin_feasibility_filter = v;
    }
    if let Some(v) = spec.connection_driven {
        opts.connection_driven = v;
    }
    if let Some(v) = spec.global_clocks {
        opts.global_clocks = v;
    }
    if let Some(v) = spec.seed_policy {
        opts.seed_policy = v;
    }
    if let Some(v) = spec.detailed_routing {
        opts.detailed_routing = v;
    }
    if let Some(v) = &spec.target_pin_util {
        opts.target_pin_util = v.clone();
    }
    if let Some(v) = &spec.high_fanout_threshold {
        opts.high_fanout_threshold = v.clone();
    }

    if let Some(seed) = &args.seed {
        opts.seed_policy = match seed.as_str() {
            "blend" => SeedPolicy::Blend,
            "timing" => SeedPolicy::Timing,
            "maxinputs" => SeedPolicy::MaxInputs,
            other => panic!("Unknown seed policy '{}'", other),
        };
    }
    if args.no_unrelated {
        opts.allow_unrelated_clustering = false;
    }
    if args.no_pin_filter {
        opts.enable_pin_feasibility_filter = false;
    }
    opts
}

fn main() {
    let args = Args::parse();

    let raw = std::fs::read_to_string(Path::new(&args.testcase))
        .expect("Couldn't open testcase file");
    let spec: PackSpec = serde_yaml::from_str(&raw)
        .expect("Testcase file does not contain a valid packing description");

    let arch = spec.arch.compile().expect("invalid architecture");
    let netlist = spec.netlist.compile().expect("invalid netlist");
    let mut store =
        build_molecules(&netlist, &spec.molecules).expect("invalid molecule list");

    let name_to_block: HashMap<&str, usize> = netlist
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.name.as_str(), i))
        .collect();

    let floorplan = match &spec.floorplan {
        None => FloorplanConstraints::default(),
        Some(fp) => {
            let mut atom_partition = vec![None; netlist.blocks.len()];
            for (atom, part) in &fp.atoms {
                let blk = *name_to_block
                    .get(atom.as_str())
                    .expect("floorplan references unknown atom");
                atom_partition[blk] = Some(PartitionId(*part));
            }
            FloorplanConstraints {
                partitions: fp.partitions.clone(),
                atom_partition,
            }
        }
    };

    let mut noc_groups = vec![None; netlist.blocks.len()];
    for (atom, group) in &spec.noc_groups {
        let blk = *name_to_block
            .get(atom.as_str())
            .expect("noc group references unknown atom");
        noc_groups[blk] = Some(NocGroupId(*group));
    }

    let opts = load_opts(&spec.options, &args);

    let output = do_clustering(
        &arch,
        &netlist,
        &mut store,
        &floorplan,
        noc_groups,
        None,
        &opts,
    )
    .expect("packing failed");

    for record in &output.clusters {
        println!(concat!(
            "Cluster '{}' ({} mode {}):\n",
            "    Atoms:                 {}\n",
            "    Routed pin map size:   {}"
            ),
            record.name,
            record.block_type,
            record.mode,
            record.atoms.join(", "),
            record.pb_route.len()
        );
    }
    println!("Packed {} atoms into {} clusters", netlist.blocks.len(), output.clusters.len());
    for (block_type, used) in &output.type_usage {
        println!("    {} x {}", used, block_type);
    }

    if let Some(json_path) = &args.json {
        let data = serde_json::to_string_pretty(&output).unwrap();
        let mut file = File::create(Path::new(json_path)).unwrap();
        file.write(data.as_bytes()).map(|_| ()).unwrap();
    }
}
