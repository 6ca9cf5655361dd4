//! Acceleration structures: one bottom-level structure per mesh, built once
//! at load time, and a top-level structure over the instance set, rebuilt
//! every frame inside the main command stream.

use ash::vk;
use glam::Mat4;
use log::info;

use crate::context::RenderContext;
use crate::memory::{align_up, Allocation, DeviceArena};

/// Geometry of one mesh, referenced by device address. Vertex positions are
/// three packed f32 at offset 0 of each `vertex_stride` bytes; indices are
/// u32 triangle lists.
#[derive(Clone, Copy)]
pub struct MeshGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertex_stride: vk::DeviceSize,
}

/// A built bottom-level structure. Immutable after creation; the device
/// address stays constant for its whole lifetime.
pub struct BlasEntry {
    pub structure: vk::AccelerationStructureKHR,
    pub buffer: vk::Buffer,
    pub device_address: vk::DeviceAddress,
}

/// The full intersection accelerator for a scene: all bottom-level
/// structures, the top-level structure, its persistent build scratch, and
/// the mapped instance records rewritten each frame.
pub struct SceneAccel {
    blas: Vec<BlasEntry>,

    tlas: vk::AccelerationStructureKHR,
    tlas_buffer: vk::Buffer,
    tlas_address: vk::DeviceAddress,

    // Kept alive across frames: the per-frame rebuild reuses it instead of
    // allocating new scratch.
    scratch_buffer: vk::Buffer,
    scratch_address: vk::DeviceAddress,

    instance_buffer: vk::Buffer,
    instance_address: vk::DeviceAddress,
    instances: *mut vk::AccelerationStructureInstanceKHR,
    instance_count: u32,
}

impl SceneAccel {
    /// Build one BLAS per mesh and a TLAS with one identity-transformed
    /// instance per mesh. Blocks on one-shot submissions; load-time only.
    pub fn build(
        ctx: &RenderContext,
        arena: &mut DeviceArena,
        meshes: &[MeshGeometry],
    ) -> Result<Self, String> {
        validate_meshes(meshes)?;

        // --- 1. Bottom-level structures, one blocking build per mesh ---
        let mut blas = Vec::with_capacity(meshes.len());
        for mesh in meshes {
            blas.push(build_blas(ctx, arena, mesh)?);
        }

        // --- 2. Host-visible instance records, persistently mapped ---
        let instance_count = blas.len() as u32;
        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        let (instance_buffer, instance_allocation) = create_buffer(
            ctx,
            arena,
            (instance_count as usize * instance_size) as vk::DeviceSize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            true,
        )?;

        let instances = instance_allocation
            .mapped
            .ok_or("Instance buffer is not mapped")?
            as *mut vk::AccelerationStructureInstanceKHR;

        for (index, entry) in blas.iter().enumerate() {
            let instance = vk::AccelerationStructureInstanceKHR {
                transform: vk::TransformMatrixKHR {
                    matrix: transform_rows(&Mat4::IDENTITY),
                },
                instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xFF),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    0,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: entry.device_address,
                },
            };
            unsafe {
                instances.add(index).write(instance);
            }
        }

        let instance_address = buffer_device_address(&ctx.device, instance_buffer);

        // --- 3. Size the top-level structure ---
        let geometry = tlas_geometry(instance_address);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            ctx.accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut build_sizes,
            );
        }

        info!(
            "TLAS sizes: structure={}, scratch={} ({} instances)",
            build_sizes.acceleration_structure_size,
            build_sizes.build_scratch_size,
            instance_count
        );

        // --- 4. Backing storage and structure object ---
        let (tlas_buffer, _) = create_buffer(
            ctx,
            arena,
            build_sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            false,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(tlas_buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);

        let tlas = unsafe {
            ctx.accel_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| format!("Failed to create TLAS: {:?}", e))?
        };

        let tlas_address = unsafe {
            ctx.accel_loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(tlas),
            )
        };

        // --- 5. Persistent scratch, reused by every per-frame rebuild ---
        let scratch_alignment = ctx.scratch_offset_alignment();
        let (scratch_buffer, _) = create_buffer(
            ctx,
            arena,
            build_sizes.build_scratch_size + scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            false,
        )?;
        let scratch_address = aligned_scratch_address(
            buffer_device_address(&ctx.device, scratch_buffer),
            scratch_alignment,
        );

        let accel = SceneAccel {
            blas,
            tlas,
            tlas_buffer,
            tlas_address,
            scratch_buffer,
            scratch_address,
            instance_buffer,
            instance_address,
            instances,
            instance_count,
        };

        // --- 6. Initial build ---
        let cmd = ctx.begin_one_shot()?;
        accel.record_top_level_build(ctx, cmd);
        ctx.submit_one_shot(cmd)?;

        info!(
            "Accelerator built: {} BLAS, TLAS address 0x{:016X}",
            accel.blas.len(),
            tlas_address
        );

        Ok(accel)
    }

    pub fn tlas(&self) -> vk::AccelerationStructureKHR {
        self.tlas
    }

    pub fn tlas_device_address(&self) -> vk::DeviceAddress {
        self.tlas_address
    }

    pub fn blas_entries(&self) -> &[BlasEntry] {
        &self.blas
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Overwrite one instance's transform in the mapped instance record.
    /// Takes effect at the next `rebuild_top_level`.
    pub fn update_instance(&mut self, index: usize, transform: &Mat4) -> Result<(), String> {
        if index >= self.instance_count as usize {
            return Err(format!(
                "Instance index {} out of range ({} instances)",
                index, self.instance_count
            ));
        }
        unsafe {
            (*self.instances.add(index)).transform = vk::TransformMatrixKHR {
                matrix: transform_rows(transform),
            };
        }
        Ok(())
    }

    /// Re-issue the top-level build inside the caller's already-recording
    /// per-frame command buffer, then make the result visible to the ray
    /// tracing stage.
    ///
    /// The barrier is mandatory: without it the build's writes race the
    /// subsequent trace dispatch's reads.
    pub fn rebuild_top_level(&self, ctx: &RenderContext, cmd: vk::CommandBuffer) {
        self.record_top_level_build(ctx, cmd);

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
            );

        unsafe {
            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn record_top_level_build(&self, ctx: &RenderContext, cmd: vk::CommandBuffer) {
        let geometry = tlas_geometry(self.instance_address);

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.tlas)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.scratch_address,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.instance_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        unsafe {
            ctx.accel_loader.cmd_build_acceleration_structures(
                cmd,
                &[build_info],
                &[std::slice::from_ref(&build_range)],
            );
        }
    }

    /// Destroy every structure and buffer owned by the accelerator: BLAS
    /// entries first, then the TLAS, its scratch, and the instance buffer.
    /// Safe to call more than once; handles are nulled after destruction.
    pub fn destroy(&mut self, ctx: &RenderContext) {
        for entry in self.blas.drain(..) {
            unsafe {
                ctx.accel_loader
                    .destroy_acceleration_structure(entry.structure, None);
                ctx.device.destroy_buffer(entry.buffer, None);
            }
        }

        if self.tlas != vk::AccelerationStructureKHR::null() {
            unsafe {
                ctx.accel_loader
                    .destroy_acceleration_structure(self.tlas, None);
            }
            self.tlas = vk::AccelerationStructureKHR::null();
        }
        if self.tlas_buffer != vk::Buffer::null() {
            unsafe {
                ctx.device.destroy_buffer(self.tlas_buffer, None);
            }
            self.tlas_buffer = vk::Buffer::null();
        }
        if self.scratch_buffer != vk::Buffer::null() {
            unsafe {
                ctx.device.destroy_buffer(self.scratch_buffer, None);
            }
            self.scratch_buffer = vk::Buffer::null();
        }
        if self.instance_buffer != vk::Buffer::null() {
            unsafe {
                ctx.device.destroy_buffer(self.instance_buffer, None);
            }
            self.instance_buffer = vk::Buffer::null();
        }

        self.instances = std::ptr::null_mut();
        self.instance_count = 0;
    }
}

/// Build a bottom-level structure for one mesh via a blocking one-shot
/// submission. The transient scratch is released as soon as the build
/// completes; bottom-level builds happen once at load time, never per frame.
fn build_blas(
    ctx: &RenderContext,
    arena: &mut DeviceArena,
    mesh: &MeshGeometry,
) -> Result<BlasEntry, String> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.vertex_address,
        })
        .vertex_stride(mesh.vertex_stride)
        .max_vertex(mesh.vertex_count - 1)
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.index_address,
        });

    let geometry = vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

    let primitive_count = mesh.index_count / 3;
    let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        | vk::BuildAccelerationStructureFlagsKHR::ALLOW_DATA_ACCESS;

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry));

    let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        ctx.accel_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut build_sizes,
        );
    }

    info!(
        "BLAS sizes: structure={}, scratch={} ({} triangles)",
        build_sizes.acceleration_structure_size, build_sizes.build_scratch_size, primitive_count
    );

    let (blas_buffer, _) = create_buffer(
        ctx,
        arena,
        build_sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        false,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(blas_buffer)
        .offset(0)
        .size(build_sizes.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

    let structure = unsafe {
        ctx.accel_loader
            .create_acceleration_structure(&create_info, None)
            .map_err(|e| format!("Failed to create BLAS: {:?}", e))?
    };

    // Transient scratch on a dedicated allocation so the memory actually
    // returns to the driver once the build is done.
    let scratch_alignment = ctx.scratch_offset_alignment();
    let scratch_info = vk::BufferCreateInfo::default()
        .size(build_sizes.build_scratch_size + scratch_alignment)
        .usage(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let scratch_buffer = unsafe {
        ctx.device
            .create_buffer(&scratch_info, None)
            .map_err(|e| format!("Failed to create BLAS scratch buffer: {:?}", e))?
    };
    let scratch_requirements = unsafe { ctx.device.get_buffer_memory_requirements(scratch_buffer) };
    let scratch_memory = arena.allocate_dedicated(&ctx.device, scratch_requirements, false)?;
    unsafe {
        ctx.device
            .bind_buffer_memory(scratch_buffer, scratch_memory.memory, 0)
            .map_err(|e| format!("Failed to bind BLAS scratch memory: {:?}", e))?;
    }
    let scratch_address = aligned_scratch_address(
        buffer_device_address(&ctx.device, scratch_buffer),
        scratch_alignment,
    );

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(structure)
        .geometries(std::slice::from_ref(&geometry))
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });

    let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(primitive_count)
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0);

    let cmd = ctx.begin_one_shot()?;
    unsafe {
        ctx.accel_loader.cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&build_range)],
        );
    }
    ctx.submit_one_shot(cmd)?;

    unsafe {
        ctx.device.destroy_buffer(scratch_buffer, None);
    }
    arena.free_dedicated(&ctx.device, scratch_memory);

    let device_address = unsafe {
        ctx.accel_loader.get_acceleration_structure_device_address(
            &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                .acceleration_structure(structure),
        )
    };

    info!("BLAS built, device address 0x{:016X}", device_address);

    Ok(BlasEntry {
        structure,
        buffer: blas_buffer,
        device_address,
    })
}

fn tlas_geometry<'a>(instance_address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'a> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

/// Create an arena-backed buffer and bind its memory.
fn create_buffer(
    ctx: &RenderContext,
    arena: &mut DeviceArena,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
) -> Result<(vk::Buffer, Allocation), String> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        ctx.device
            .create_buffer(&buffer_info, None)
            .map_err(|e| format!("Failed to create buffer of {} bytes: {:?}", size, e))?
    };

    let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
    let allocation = arena.allocate(&ctx.device, requirements, host_visible)?;

    unsafe {
        ctx.device
            .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
            .map_err(|e| format!("Failed to bind buffer memory: {:?}", e))?;
    }

    Ok((buffer, allocation))
}

fn buffer_device_address(device: &ash::Device, buffer: vk::Buffer) -> vk::DeviceAddress {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { device.get_buffer_device_address(&info) }
}

/// The buffer's base address rounded up to the device-reported scratch
/// alignment. Scratch buffers carry `alignment` bytes of slack so the
/// rounded address always stays in bounds.
fn aligned_scratch_address(base: vk::DeviceAddress, alignment: u64) -> vk::DeviceAddress {
    align_up(base, alignment)
}

/// Reject degenerate build input before any device work happens.
fn validate_meshes(meshes: &[MeshGeometry]) -> Result<(), String> {
    if meshes.is_empty() {
        return Err("Accelerator build requires at least one mesh".to_string());
    }
    for (index, mesh) in meshes.iter().enumerate() {
        if mesh.vertex_count == 0 {
            return Err(format!("Mesh {}: vertex count is zero", index));
        }
        if mesh.index_count == 0 || mesh.index_count % 3 != 0 {
            return Err(format!(
                "Mesh {}: index count {} is not a positive multiple of 3",
                index, mesh.index_count
            ));
        }
        if mesh.vertex_address == 0 || mesh.index_address == 0 {
            return Err(format!("Mesh {}: null vertex or index address", index));
        }
    }
    Ok(())
}

/// The top three rows of a column-major matrix, laid out row-major as the
/// instance record expects.
fn transform_rows(m: &Mat4) -> [f32; 12] {
    let cols = m.to_cols_array_2d();
    let mut rows = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            rows[row * 4 + col] = cols[col][row];
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn triangle_mesh() -> MeshGeometry {
        MeshGeometry {
            vertex_address: 0x1000,
            index_address: 0x2000,
            vertex_count: 3,
            index_count: 3,
            vertex_stride: 12,
        }
    }

    #[test]
    fn identity_transform_rows() {
        let rows = transform_rows(&Mat4::IDENTITY);
        #[rustfmt::skip]
        let expected = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        ];
        assert_eq!(rows, expected);
    }

    #[test]
    fn translation_lands_in_the_fourth_column() {
        let rows = transform_rows(&Mat4::from_translation(Vec3::new(2.0, 3.0, 4.0)));
        assert_eq!(rows[3], 2.0);
        assert_eq!(rows[7], 3.0);
        assert_eq!(rows[11], 4.0);
        // Rotation part stays identity.
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[5], 1.0);
        assert_eq!(rows[10], 1.0);
    }

    #[test]
    fn instance_record_is_64_bytes() {
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            64
        );
    }

    #[test]
    fn instance_packing_splits_low24_and_high8() {
        let packed = vk::Packed24_8::new(7, 0xFF);
        assert_eq!(packed.low_24(), 7);
        assert_eq!(packed.high_8(), 0xFF);

        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8;
        let packed = vk::Packed24_8::new(0, flags);
        assert_eq!(packed.low_24(), 0);
        assert_eq!(packed.high_8(), 0x01);
    }

    #[test]
    fn scratch_address_is_aligned_and_within_slack() {
        for &base in &[0x1000u64, 0x1001, 0x10FF, 0xABCDE] {
            for &alignment in &[64u64, 128, 256] {
                let size = 4096u64;
                let buffer_size = size + alignment;
                let aligned = aligned_scratch_address(base, alignment);
                assert_eq!(aligned % alignment, 0);
                assert!(aligned >= base);
                assert!(aligned + size <= base + buffer_size);
            }
        }
    }

    #[test]
    fn empty_mesh_list_is_rejected() {
        assert!(validate_meshes(&[]).is_err());
    }

    #[test]
    fn zero_primitive_counts_are_rejected() {
        let mut mesh = triangle_mesh();
        mesh.index_count = 0;
        assert!(validate_meshes(&[mesh]).is_err());

        let mut mesh = triangle_mesh();
        mesh.vertex_count = 0;
        assert!(validate_meshes(&[mesh]).is_err());

        let mut mesh = triangle_mesh();
        mesh.index_count = 4;
        assert!(validate_meshes(&[mesh]).is_err());
    }

    #[test]
    fn well_formed_meshes_pass_validation() {
        assert!(validate_meshes(&[triangle_mesh(), triangle_mesh()]).is_ok());
    }
}
