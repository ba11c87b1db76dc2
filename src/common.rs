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

use std::cmp::Ordering;

/* Total order over f32 costs. NaN never shows up in cost arithmetic here,
 * so collapsing it to Equal is acceptable. */
pub fn fcmp(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/* Scales a pin-class capacity by an external utilization fraction.
 * Uses ceil so a class of size 1 never scales down to zero. */
pub fn scale_class_size(class_size: usize, util: f32) -> usize {
    (util * class_size as f32).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcmp_orders_costs() {
        assert_eq!(fcmp(1.0, 2.0), Ordering::Less);
        assert_eq!(fcmp(2.0, 1.0), Ordering::Greater);
        assert_eq!(fcmp(1.5, 1.5), Ordering::Equal);
    }

    #[test]
    fn test_scale_class_size_never_zeroes_small_classes() {
        assert_eq!(scale_class_size(1, 0.2), 1);
        assert_eq!(scale_class_size(10, 0.75), 8);
        assert_eq!(scale_class_size(4, 1.0), 4);
    }
}
