//! GPU frame timing: a fixed ring of timestamp query pairs, one slot per
//! frame in flight, read back without blocking.

use ash::vk;

use crate::context::RenderContext;
use crate::registry::ResourceRegistry;

/// Timestamp query pairs indexed by frame-in-flight slot. The pool is
/// created through the registry and torn down with everything else; the
/// ring itself owns no native resources.
pub struct TimestampRing {
    query_pool: vk::QueryPool,
    slots: u32,
    timestamp_period: f32,
}

impl TimestampRing {
    pub fn new(
        ctx: &RenderContext,
        registry: &mut ResourceRegistry,
        frames_in_flight: u32,
    ) -> Result<Self, String> {
        if frames_in_flight == 0 {
            return Err("Timestamp ring needs at least one slot".to_string());
        }

        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(frames_in_flight * 2);
        let query_pool = registry.create_query_pool(&info)?;

        Ok(Self {
            query_pool,
            slots: frames_in_flight,
            timestamp_period: ctx.timestamp_period(),
        })
    }

    /// The ring slot for a monotonically increasing frame counter.
    pub fn slot_for_frame(&self, frame_index: u64) -> u32 {
        (frame_index % self.slots as u64) as u32
    }

    /// Reset the slot's query pair and write the frame-start timestamp.
    pub fn write_start(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        let first = slot * 2;
        unsafe {
            device.cmd_reset_query_pool(cmd, self.query_pool, first, 2);
            device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.query_pool,
                first,
            );
        }
    }

    /// Write the frame-end timestamp.
    pub fn write_end(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        unsafe {
            device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                slot * 2 + 1,
            );
        }
    }

    /// GPU time between the slot's start and end timestamps, in
    /// milliseconds. `None` while the slot's results are still in flight.
    pub fn read_millis(&self, device: &ash::Device, slot: u32) -> Result<Option<f64>, String> {
        let mut ticks = [0u64; 2];
        let result = unsafe {
            device.get_query_pool_results(
                self.query_pool,
                slot * 2,
                &mut ticks,
                vk::QueryResultFlags::TYPE_64,
            )
        };

        match result {
            Ok(()) => {
                let elapsed = ticks[1].saturating_sub(ticks[0]);
                let nanos = elapsed as f64 * self.timestamp_period as f64;
                Ok(Some(nanos / 1_000_000.0))
            }
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(format!("Failed to read timestamp queries: {:?}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(slots: u32) -> TimestampRing {
        TimestampRing {
            query_pool: vk::QueryPool::null(),
            slots,
            timestamp_period: 1.0,
        }
    }

    #[test]
    fn slots_wrap_around_the_ring() {
        let ring = ring(3);
        assert_eq!(ring.slot_for_frame(0), 0);
        assert_eq!(ring.slot_for_frame(1), 1);
        assert_eq!(ring.slot_for_frame(2), 2);
        assert_eq!(ring.slot_for_frame(3), 0);
        assert_eq!(ring.slot_for_frame(7), 1);
    }

    #[test]
    fn consecutive_frames_in_flight_use_distinct_slots() {
        let ring = ring(2);
        for frame in 0..10u64 {
            assert_ne!(ring.slot_for_frame(frame), ring.slot_for_frame(frame + 1));
        }
    }
}
