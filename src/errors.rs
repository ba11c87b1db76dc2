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

use thiserror::Error;

/// Errors surfaced by the packing core. Only `MoleculeUnplaceable` and
/// `InternalInvariant` are fatal to a clustering run; the remaining kinds are
/// handled locally by the cluster legalizer which reverts the speculative
/// state and retries with the next candidate placement.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("no logic block type can implement molecule rooted at atom '{atom}'")]
    MoleculeUnplaceable { atom: String },

    #[error("lookahead pin usage exceeds class limits of block type '{block_type}'")]
    PinFeasibilityViolated { block_type: String },

    #[error("intra-cluster routing infeasible in cluster {cluster}")]
    RoutingInfeasible { cluster: usize },

    #[error("floorplan region of atom '{atom}' does not intersect cluster region")]
    FloorplanViolation { atom: String },

    #[error("atom '{atom}' belongs to a different NoC group than its cluster")]
    NocGroupViolation { atom: String },

    #[error("physical block '{pb}' is already committed to mode {mode}")]
    ModeConflict { pb: String, mode: usize },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// Outcome of one `try_pack_molecule` attempt. Mirrors the recoverable subset
/// of `PackError`; the legalizer loops on these without unwinding.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockPackStatus {
    Passed,
    FailedFeasible,
    FailedRoute,
    FailedFloorplan,
    FailedNocGroup,
    Undefined,
}

impl BlockPackStatus {
    pub fn passed(self) -> bool {
        matches!(self, BlockPackStatus::Passed)
    }
}
