#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde;

#[macro_use]
pub mod log;
pub mod common;
pub mod errors;
pub mod arch;
pub mod floorplan;
pub mod netlist;
pub mod molecule;
pub mod rr_graph;
pub mod router;
pub mod placement;
pub mod cluster;
pub mod clusterer;
