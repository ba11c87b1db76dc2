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

/* Floorplan constraints: atoms may be pinned to partitions, each partition
 * covering one or more device rectangles. A growing cluster tracks the
 * intersection of the regions of everything packed into it; an empty
 * intersection rejects the candidate.
 */

use crate::netlist::AtomBlockId;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NocGroupId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Region {
    pub x_low: i32,
    pub y_low: i32,
    pub x_high: i32,
    pub y_high: i32,
}

impl Region {
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let r = Region {
            x_low: self.x_low.max(other.x_low),
            y_low: self.y_low.max(other.y_low),
            x_high: self.x_high.min(other.x_high),
            y_high: self.y_high.min(other.y_high),
        };
        (r.x_low <= r.x_high && r.y_low <= r.y_high).then(|| r)
    }
}

/// A union of rectangles. The empty list means "unconstrained" for a fresh
/// cluster, but "no legal location" once an intersection has emptied it, so
/// emptiness is tracked separately from the rectangle list.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct PartitionRegion {
    pub regions: Vec<Region>,
}

impl PartitionRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn intersection(self, other: &PartitionRegion) -> PartitionRegion {
        let mut regions = Vec::new();
        for a in &self.regions {
            for b in &other.regions {
                if let Some(r) = a.intersection(b) {
                    if !regions.contains(&r) {
                        regions.push(r);
                    }
                }
            }
        }
        PartitionRegion { regions }
    }
}

/// User floorplan constraints: partition regions plus the atom -> partition
/// pinning. Unpinned atoms are unconstrained.
#[derive(Default)]
pub struct FloorplanConstraints {
    pub partitions: Vec<PartitionRegion>,
    pub atom_partition: Vec<Option<PartitionId>>,
}

impl FloorplanConstraints {
    pub fn atom_partition(&self, atom: AtomBlockId) -> Option<PartitionId> {
        self.atom_partition.get(atom.0).copied().flatten()
    }

    pub fn partition_region(&self, part: PartitionId) -> &PartitionRegion {
        &self.partitions[part.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> Region {
        Region { x_low: x0, y_low: y0, x_high: x1, y_high: y1 }
    }

    #[test]
    fn test_rect_intersection() {
        let a = rect(0, 0, 4, 4);
        let b = rect(2, 2, 8, 8);
        assert_eq!(a.intersection(&b), Some(rect(2, 2, 4, 4)));
        assert_eq!(a.intersection(&rect(5, 5, 6, 6)), None);
    }

    #[test]
    fn test_disjoint_partition_regions_empty_out() {
        let a = PartitionRegion { regions: vec![rect(0, 0, 1, 1)] };
        let b = PartitionRegion { regions: vec![rect(3, 3, 4, 4)] };
        assert!(a.intersection(&b).empty());
    }

    #[test]
    fn test_multi_rect_intersection_dedups() {
        let a = PartitionRegion { regions: vec![rect(0, 0, 4, 4), rect(0, 0, 4, 4)] };
        let b = PartitionRegion { regions: vec![rect(1, 1, 2, 2)] };
        let i = a.intersection(&b);
        assert_eq!(i.regions, vec![rect(1, 1, 2, 2)]);
    }
}
