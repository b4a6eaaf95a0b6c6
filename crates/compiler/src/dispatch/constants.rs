//! Constant handling for dispatch regions.
//!
//! Host-visible constants captured by a region are rematerialized into
//! the region body when small (splats always qualify regardless of
//! size): the capture is removed and the constant op is cloned at the
//! head of the region. Larger constants stay captured and are outlined
//! as module-level variables.

use crate::dispatch::region::DispatchRegion;
use crate::ir::{GraphFunc, Operation, ValueId};

/// Dense constants at or below this size are rematerialized.
pub const REMATERIALIZE_THRESHOLD_BYTES: usize = 256;

/// Rewrites region captures in place. Returns the constant values that
/// remain captured and must become module-level variables.
pub fn rematerialize_constants(
    func: &GraphFunc,
    regions: &mut [DispatchRegion],
) -> Vec<ValueId> {
    let mut outlined = Vec::new();
    for region in regions.iter_mut() {
        let mut kept = Vec::with_capacity(region.captures.len());
        for &capture in &region.captures {
            let constant = func.producer(capture).and_then(|producer| {
                match &func.node(producer).op {
                    Operation::Constant { data } => Some((producer, data)),
                    _ => None,
                }
            });
            match constant {
                Some((producer, data)) => {
                    let size = data.captured_byte_size(func.value_type(capture));
                    if data.is_splat() || size <= REMATERIALIZE_THRESHOLD_BYTES {
                        // Clone at the head of the region; the capture
                        // disappears.
                        region.ops.insert(0, producer);
                    } else {
                        kept.push(capture);
                        if !outlined.contains(&capture) {
                            outlined.push(capture);
                        }
                    }
                }
                None => kept.push(capture),
            }
        }
        region.captures = kept;
    }
    outlined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::partition::form_dispatch_regions;
    use crate::ir::{ConstantData, EwOp, ScalarValue, TensorType};
    use tensile_hal::ElementType;

    fn constant_region(data: ConstantData, extent: usize) -> (GraphFunc, Vec<DispatchRegion>) {
        let mut func = GraphFunc::new("main");
        let ty = TensorType::static_shape(&[extent], ElementType::F32);
        let a = func.add_parameter("a", ty.clone());
        let c = func.add_constant(data, ty).unwrap();
        let sum = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, c])
            .unwrap();
        func.add_result(sum);
        let regions = form_dispatch_regions(&func).unwrap();
        (func, regions)
    }

    #[test]
    fn test_small_dense_constant_rematerialized() {
        let data = ConstantData::Dense(vec![0u8; 64].into());
        let (func, mut regions) = constant_region(data, 16);
        let outlined = rematerialize_constants(&func, &mut regions);
        assert!(outlined.is_empty());
        assert_eq!(regions[0].captures.len(), 1);
        assert_eq!(regions[0].ops.len(), 2);
    }

    #[test]
    fn test_large_dense_constant_stays_captured() {
        let extent = 1024;
        let data = ConstantData::Dense(vec![0u8; extent * 4].into());
        let (func, mut regions) = constant_region(data, extent);
        let outlined = rematerialize_constants(&func, &mut regions);
        assert_eq!(outlined.len(), 1);
        assert_eq!(regions[0].captures.len(), 2);
        assert_eq!(regions[0].ops.len(), 1);
    }

    #[test]
    fn test_splat_always_rematerialized() {
        // A splat over a large tensor still qualifies.
        let data = ConstantData::Splat(ScalarValue::F32(3.0));
        let (func, mut regions) = constant_region(data, 100_000);
        let outlined = rematerialize_constants(&func, &mut regions);
        assert!(outlined.is_empty());
        assert_eq!(regions[0].ops.len(), 2);
    }
}
