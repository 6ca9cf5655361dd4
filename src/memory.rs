//! Chunked device memory: large fixed-size blocks sub-allocated with a bump
//! offset and grown on demand. Nothing is freed individually; chunks live
//! until arena teardown.

use ash::vk;
use log::info;

/// Device-local pool chunk size. Allocation count dominates driver overhead,
/// so requests are packed into few large blocks.
const DEVICE_LOCAL_CHUNK_SIZE: vk::DeviceSize = 16 * 1024 * 1024;
/// Host-visible pool chunk size.
const HOST_VISIBLE_CHUNK_SIZE: vk::DeviceSize = 8 * 1024 * 1024;

/// One native memory block serving many sub-allocations of a single memory
/// type. `used` only ever advances.
pub struct MemoryChunk {
    memory: vk::DeviceMemory,
    capacity: vk::DeviceSize,
    used: vk::DeviceSize,
    memory_type_index: u32,
    mapped: Option<*mut u8>,
}

impl MemoryChunk {
    /// Reserve `size` bytes at the next offset aligned to `alignment`.
    /// Returns `None` when the aligned range does not fit.
    fn suballocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<vk::DeviceSize> {
        let offset = align_up(self.used, alignment);
        if offset + size > self.capacity {
            return None;
        }
        self.used = offset + size;
        Some(offset)
    }

    fn accepts_type(&self, memory_type_bits: u32) -> bool {
        memory_type_bits & (1 << self.memory_type_index) != 0
    }
}

/// A sub-range of a chunk, consumed immediately to bind a buffer or image.
///
/// The memory handle is a non-owning back-reference; the arena frees the
/// chunk at teardown.
#[derive(Clone, Copy)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub mapped: Option<*mut u8>,
}

/// A one-off memory block outside the pools, for resources that are either
/// recreated over time (staging) or released early (transient build scratch).
pub struct DedicatedAllocation {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub mapped: Option<*mut u8>,
}

/// Two pools of memory chunks: device-local and host-visible. Host-visible
/// chunks are persistently mapped at creation.
pub struct DeviceArena {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_chunks: Vec<MemoryChunk>,
    host_chunks: Vec<MemoryChunk>,
}

impl DeviceArena {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_properties,
            device_chunks: Vec::new(),
            host_chunks: Vec::new(),
        }
    }

    /// Sub-allocate from the first existing compatible chunk, or grow the
    /// pool with a fresh chunk of `max(default, size)` bytes.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        host_visible: bool,
    ) -> Result<Allocation, String> {
        let pool = if host_visible {
            &mut self.host_chunks
        } else {
            &mut self.device_chunks
        };

        for chunk in pool.iter_mut() {
            if !chunk.accepts_type(requirements.memory_type_bits) {
                continue;
            }
            if let Some(offset) = chunk.suballocate(requirements.size, requirements.alignment) {
                return Ok(allocation_at(chunk, offset));
            }
        }

        let memory_type_index = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            required_property_flags(host_visible),
        )?;

        let default_size = if host_visible {
            HOST_VISIBLE_CHUNK_SIZE
        } else {
            DEVICE_LOCAL_CHUNK_SIZE
        };
        let capacity = requirements.size.max(default_size);

        let mut chunk = create_chunk(device, capacity, memory_type_index, host_visible)?;
        let offset = chunk
            .suballocate(requirements.size, requirements.alignment)
            .ok_or_else(|| {
                format!(
                    "Fresh chunk of {} bytes cannot hold allocation of {} bytes",
                    capacity, requirements.size
                )
            })?;
        let allocation = allocation_at(&chunk, offset);

        info!(
            "New {} chunk: {} bytes, memory type {}",
            if host_visible { "host-visible" } else { "device-local" },
            capacity,
            memory_type_index
        );

        if host_visible {
            self.host_chunks.push(chunk);
        } else {
            self.device_chunks.push(chunk);
        }
        Ok(allocation)
    }

    /// Allocate a standalone memory block outside the pools. Unlike pooled
    /// allocations it can be returned to the driver with `free_dedicated`.
    pub fn allocate_dedicated(
        &self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        host_visible: bool,
    ) -> Result<DedicatedAllocation, String> {
        let memory_type_index = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            required_property_flags(host_visible),
        )?;

        let (memory, mapped) =
            allocate_block(device, requirements.size, memory_type_index, host_visible)?;

        Ok(DedicatedAllocation {
            memory,
            size: requirements.size,
            mapped,
        })
    }

    pub fn free_dedicated(&self, device: &ash::Device, allocation: DedicatedAllocation) {
        unsafe {
            device.free_memory(allocation.memory, None);
        }
    }

    /// Free every chunk. All allocations handed out by this arena are
    /// invalid afterwards.
    pub fn destroy(&mut self, device: &ash::Device) {
        let count = self.device_chunks.len() + self.host_chunks.len();
        for chunk in self.device_chunks.drain(..).chain(self.host_chunks.drain(..)) {
            unsafe {
                device.free_memory(chunk.memory, None);
            }
        }
        if count > 0 {
            info!("Freed {} memory chunks", count);
        }
    }
}

fn allocation_at(chunk: &MemoryChunk, offset: vk::DeviceSize) -> Allocation {
    Allocation {
        memory: chunk.memory,
        offset,
        mapped: chunk.mapped.map(|ptr| unsafe { ptr.add(offset as usize) }),
    }
}

fn create_chunk(
    device: &ash::Device,
    capacity: vk::DeviceSize,
    memory_type_index: u32,
    host_visible: bool,
) -> Result<MemoryChunk, String> {
    let (memory, mapped) = allocate_block(device, capacity, memory_type_index, host_visible)?;
    Ok(MemoryChunk {
        memory,
        capacity,
        used: 0,
        memory_type_index,
        mapped,
    })
}

/// Allocate native memory with device addressing enabled, and persistently
/// map it when host-visible.
fn allocate_block(
    device: &ash::Device,
    size: vk::DeviceSize,
    memory_type_index: u32,
    host_visible: bool,
) -> Result<(vk::DeviceMemory, Option<*mut u8>), String> {
    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(size)
        .memory_type_index(memory_type_index)
        .push_next(&mut flags_info);

    let memory = unsafe {
        device.allocate_memory(&allocate_info, None).map_err(|e| {
            format!(
                "Failed to allocate {} bytes of memory type {}: {:?}",
                size, memory_type_index, e
            )
        })?
    };

    let mapped = if host_visible {
        let ptr = unsafe {
            device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| format!("Failed to map {} bytes: {:?}", size, e))?
        };
        Some(ptr as *mut u8)
    } else {
        None
    };

    Ok((memory, mapped))
}

fn required_property_flags(host_visible: bool) -> vk::MemoryPropertyFlags {
    if host_visible {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    }
}

/// Select a memory type matching both the requirements bitmask and the
/// required property flags. No match is a configuration error: the device
/// does not support the requested combination.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, String> {
    for index in 0..properties.memory_type_count {
        let suitable = memory_type_bits & (1 << index) != 0;
        let memory_type = &properties.memory_types[index as usize];
        if suitable && memory_type.property_flags.contains(flags) {
            return Ok(index);
        }
    }
    Err(format!(
        "No compatible memory type (type_bits=0x{:x}, required flags={:?})",
        memory_type_bits, flags
    ))
}

/// Align a value up to the given power-of-two alignment.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chunk(capacity: vk::DeviceSize) -> MemoryChunk {
        MemoryChunk {
            memory: vk::DeviceMemory::null(),
            capacity,
            used: 0,
            memory_type_index: 0,
            mapped: None,
        }
    }

    #[test]
    fn suballocations_are_aligned() {
        let mut chunk = test_chunk(4096);
        for &alignment in &[1u64, 4, 16, 64, 256] {
            let offset = chunk.suballocate(10, alignment).unwrap();
            assert_eq!(offset % alignment, 0, "alignment {}", alignment);
        }
    }

    #[test]
    fn suballocations_never_overlap_and_usage_is_monotonic() {
        let mut chunk = test_chunk(4096);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        let mut last_used = 0;
        for &(size, alignment) in &[(13u64, 4u64), (100, 64), (1, 1), (255, 128), (512, 256)] {
            let offset = chunk.suballocate(size, alignment).unwrap();
            for &(start, end) in &ranges {
                assert!(offset >= end || offset + size <= start, "overlap");
            }
            ranges.push((offset, offset + size));
            assert!(chunk.used >= last_used);
            last_used = chunk.used;
        }
        assert!(chunk.used <= chunk.capacity);
    }

    #[test]
    fn full_chunk_rejects_further_requests() {
        let mut chunk = test_chunk(64);
        assert_eq!(chunk.suballocate(63, 1), Some(0));
        assert_eq!(chunk.used, 63);
        // used = capacity - 1: anything larger than one byte must go to a
        // new chunk instead of overflowing this one.
        assert_eq!(chunk.suballocate(2, 1), None);
        assert_eq!(chunk.used, 63);
        assert_eq!(chunk.suballocate(1, 1), Some(63));
        assert_eq!(chunk.suballocate(1, 1), None);
    }

    #[test]
    fn aligned_tail_that_does_not_fit_is_rejected() {
        let mut chunk = test_chunk(128);
        assert_eq!(chunk.suballocate(100, 1), Some(0));
        // 28 bytes remain but the aligned offset pushes past capacity.
        assert_eq!(chunk.suballocate(20, 64), None);
        assert_eq!(chunk.used, 100);
    }

    fn fake_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = 3;
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties
    }

    #[test]
    fn memory_type_selection_honors_bitmask_and_flags() {
        let properties = fake_memory_properties();
        assert_eq!(
            find_memory_type(&properties, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
        assert_eq!(
            find_memory_type(
                &properties,
                0b111,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            )
            .unwrap(),
            1
        );
        // Bitmask excludes type 0, forcing the combined type.
        assert_eq!(
            find_memory_type(&properties, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            2
        );
    }

    #[test]
    fn missing_memory_type_is_an_error() {
        let properties = fake_memory_properties();
        let result = find_memory_type(
            &properties,
            0b001,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("No compatible memory type"));
    }

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(255, 256), 256);
    }
}
