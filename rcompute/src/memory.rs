//! Memory-type selection.
//!
//! [`MemoryTypeTable`] is a copy of a physical device's memory-type list
//! reduced to the property flags of each type. It is a plain value so the
//! selection rule can be exercised without a device.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "No memory type in mask {type_bits:#b} provides the required \
     properties {required:?}"
)]
pub struct NoSuitableMemory {
    pub type_bits: u32,
    pub required: vk::MemoryPropertyFlags,
}

/// Property flags of every memory type a physical device exposes, indexed
/// by memory-type index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryTypeTable {
    types: Vec<vk::MemoryPropertyFlags>,
}

impl MemoryTypeTable {
    pub fn new(types: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self { types }
    }

    pub fn from_properties(
        properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let count = properties.memory_type_count as usize;
        Self {
            types: properties.memory_types[..count]
                .iter()
                .map(|ty| ty.property_flags)
                .collect(),
        }
    }

    /// Pick the lowest memory-type index that is allowed by `type_bits`
    /// (bit `i` set means type `i` is compatible with the resource) and
    /// whose flags contain all of `required`.
    pub fn select(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, NoSuitableMemory> {
        self.types
            .iter()
            .enumerate()
            .take(u32::BITS as usize)
            .find(|&(i, flags)| {
                type_bits & (1 << i) != 0 && flags.contains(required)
            })
            .map(|(i, _)| i as u32)
            .ok_or(NoSuitableMemory {
                type_bits,
                required,
            })
    }

    /// Flags of memory type `index`, or `None` when out of range.
    pub fn flags(&self, index: u32) -> Option<vk::MemoryPropertyFlags> {
        self.types.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use vk::MemoryPropertyFlags as F;

    // Shaped like a typical discrete GPU: VRAM, then system RAM, then the
    // small host-visible VRAM window.
    fn discrete_table() -> MemoryTypeTable {
        MemoryTypeTable::new(vec![
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
        ])
    }

    #[test]
    fn picks_lowest_matching_index() {
        let table = discrete_table();
        assert_eq!(table.select(0b1111, F::DEVICE_LOCAL), Ok(0));
        assert_eq!(table.select(0b1111, F::HOST_VISIBLE), Ok(1));
        assert_eq!(
            table.select(0b1111, F::HOST_VISIBLE | F::HOST_CACHED),
            Ok(2)
        );
    }

    #[test]
    fn respects_type_bits() {
        let table = discrete_table();
        assert_eq!(table.select(0b1110, F::DEVICE_LOCAL), Ok(3));
        assert_eq!(table.select(0b0100, F::HOST_VISIBLE), Ok(2));
    }

    #[test]
    fn required_flags_must_all_be_present() {
        let table = discrete_table();
        assert_eq!(
            table.select(0b1111, F::DEVICE_LOCAL | F::HOST_VISIBLE),
            Ok(3)
        );
    }

    #[test]
    fn empty_requirement_matches_first_allowed_type() {
        let table = discrete_table();
        assert_eq!(table.select(0b1000, F::empty()), Ok(3));
    }

    #[test]
    fn fails_when_nothing_matches() {
        let table = discrete_table();
        let err = table
            .select(0b0001, F::HOST_VISIBLE)
            .expect_err("type 0 is not host visible");
        assert_eq!(
            err,
            NoSuitableMemory {
                type_bits: 0b0001,
                required: F::HOST_VISIBLE,
            }
        );
        assert!(table.select(0, F::empty()).is_err());
        assert!(table.select(0b1111, F::PROTECTED).is_err());
    }

    #[test]
    fn selection_is_deterministic() {
        let table = discrete_table();
        let first = table.select(0b1011, F::HOST_VISIBLE);
        for _ in 0..8 {
            assert_eq!(table.select(0b1011, F::HOST_VISIBLE), first);
        }
    }

    #[test]
    fn from_properties_honours_type_count() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        props.memory_types[0].property_flags = F::DEVICE_LOCAL;
        props.memory_types[1].property_flags = F::HOST_VISIBLE;
        props.memory_types[2].property_flags = F::HOST_CACHED;

        let table = MemoryTypeTable::from_properties(&props);
        assert_eq!(table.len(), 2);
        assert_eq!(table.flags(1), Some(F::HOST_VISIBLE));
        assert_eq!(table.flags(2), None);
    }
}
