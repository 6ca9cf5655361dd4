//! Vulkan initialization: instance, device, queue, command pool, and the
//! typed ray-tracing extension loader tables every other component depends on.

use ash::vk;
use log::{info, warn};
use std::ffi::{CStr, CString};

/// Holds the core device state, passed by reference into every component.
///
/// Fields are ordered so that Rust's drop order (top-to-bottom declaration)
/// destroys resources before the device/instance they depend on.
pub struct RenderContext {
    // Extension entry points, resolved once at creation (no drop needed,
    // just fn pointers).
    pub accel_loader: ash::khr::acceleration_structure::Device,
    pub rt_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,
    pub accel_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,
    pub rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,

    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_properties: vk::PhysicalDeviceProperties,

    pub command_pool: vk::CommandPool,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    // Debug utils (only in debug builds), destroyed before the instance.
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    /// Whether destroy() has been called explicitly.
    destroyed: bool,
}

const REQUIRED_DEVICE_EXTENSIONS: &[&str] = &[
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
    "VK_KHR_buffer_device_address",
    "VK_KHR_ray_tracing_position_fetch",
];

impl RenderContext {
    /// Create a context on the first suitable GPU.
    ///
    /// Hardware ray tracing is a hard requirement: a device without the KHR
    /// acceleration structure and ray tracing pipeline extensions is a fatal
    /// configuration error, not a fallback.
    pub fn new() -> Result<Self, String> {
        // --- Entry ---
        let entry =
            unsafe { ash::Entry::load().map_err(|e| format!("Failed to load Vulkan: {}", e))? };

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"prism")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"prism")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut layer_names: Vec<CString> = Vec::new();
        let mut extension_names: Vec<CString> = Vec::new();

        let enable_validation = cfg!(debug_assertions);
        if enable_validation {
            let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer.as_c_str()
            });
            if has_validation {
                layer_names.push(validation_layer);
                extension_names.push(CString::new("VK_EXT_debug_utils").unwrap());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();
        let extension_name_ptrs: Vec<*const i8> =
            extension_names.iter().map(|n| n.as_ptr()).collect();

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_name_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if enable_validation
            && extension_names
                .iter()
                .any(|n| n.as_c_str() == c"VK_EXT_debug_utils")
        {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));

            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };

            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Physical device selection ---
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?
        };

        if physical_devices.is_empty() {
            return Err("No Vulkan-capable GPUs found".to_string());
        }

        let mut selected: Option<(vk::PhysicalDevice, u32, bool)> = None;

        for &phys_dev in &physical_devices {
            let props = unsafe { instance.get_physical_device_properties(phys_dev) };
            let api_version = props.api_version;

            if vk::api_version_major(api_version) < 1
                || (vk::api_version_major(api_version) == 1
                    && vk::api_version_minor(api_version) < 2)
            {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS));

            let Some((family_idx, _)) = graphics_family else {
                continue;
            };

            let dev_extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(phys_dev)
                    .unwrap_or_default()
            };
            let ext_names: Vec<String> = dev_extensions
                .iter()
                .map(|e| {
                    unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();

            let has_rt = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .all(|required| ext_names.iter().any(|name| name == required));
            if !has_rt {
                continue;
            }

            let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;

            if selected.is_none() || (is_discrete && !selected.map_or(false, |(_, _, d)| d)) {
                selected = Some((phys_dev, family_idx as u32, is_discrete));

                let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(
                    "Selected GPU: {} (Vulkan {}.{})",
                    dev_name.to_string_lossy(),
                    vk::api_version_major(api_version),
                    vk::api_version_minor(api_version),
                );
            }
        }

        let (physical_device, queue_family, _) = selected.ok_or(
            "No suitable GPU found (need Vulkan 1.2+ with a graphics queue and \
             VK_KHR_ray_tracing_pipeline + VK_KHR_acceleration_structure)",
        )?;

        // --- Device creation ---
        let queue_priority = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority);
        let queue_create_infos = [queue_create_info];

        let device_extensions: Vec<CString> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| CString::new(*name).unwrap())
            .collect();
        let device_ext_ptrs: Vec<*const i8> =
            device_extensions.iter().map(|n| n.as_ptr()).collect();

        let mut vulkan_12_features =
            vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut position_fetch_features =
            vk::PhysicalDeviceRayTracingPositionFetchFeaturesKHR::default()
                .ray_tracing_position_fetch(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_pipeline_features)
            .push_next(&mut position_fetch_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| format!("Failed to create logical device: {:?}", e))?
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // --- Command pool ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };

        // --- Extension loaders and cached properties ---
        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);

        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut accel_props)
            .push_next(&mut rt_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }

        info!(
            "Ray tracing properties: handle_size={}, scratch_alignment={}, max_instances={}",
            rt_props.shader_group_handle_size,
            accel_props.min_acceleration_structure_scratch_offset_alignment,
            accel_props.max_instance_count,
        );

        // The properties structs are plain-old-data; safe to transmute the lifetime.
        let accel_props_static: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static> =
            unsafe { std::mem::transmute(accel_props) };
        let rt_props_static: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> =
            unsafe { std::mem::transmute(rt_props) };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };

        info!("Render context initialized");

        Ok(RenderContext {
            accel_loader,
            rt_pipeline_loader,
            accel_properties: accel_props_static,
            rt_properties: rt_props_static,
            memory_properties,
            device_properties,
            command_pool,
            queue,
            queue_family,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            instance,
            entry,
            destroyed: false,
        })
    }

    /// Device-reported scratch buffer alignment for acceleration structure
    /// builds. Must be queried, never hardcoded.
    pub fn scratch_offset_alignment(&self) -> u64 {
        self.accel_properties
            .min_acceleration_structure_scratch_offset_alignment as u64
    }

    /// Nanoseconds per timestamp tick on the selected device.
    pub fn timestamp_period(&self) -> f32 {
        self.device_properties.limits.timestamp_period
    }

    /// Allocate and begin a one-shot command buffer.
    ///
    /// For initialization-time work only (acceleration structure builds,
    /// texture uploads); the per-frame path records into an externally owned
    /// command buffer instead.
    pub fn begin_one_shot(&self) -> Result<vk::CommandBuffer, String> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| format!("Failed to begin command buffer: {:?}", e))?;
        }

        Ok(cmd)
    }

    /// End, submit, and block until a one-shot command buffer completes.
    pub fn submit_one_shot(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| format!("Failed to create fence: {:?}", e))?
        };

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;

            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| format!("Failed to wait for fence: {:?}", e))?;

            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.command_pool, &[cmd]);
        }

        Ok(())
    }

    /// Explicitly destroy the context in the correct order.
    ///
    /// All registries, staging arenas, and accelerators created against this
    /// context must be destroyed first. The Drop impl calls this if it has
    /// not been called yet.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
        }

        if self.command_pool != vk::CommandPool::null() {
            unsafe {
                self.device.destroy_command_pool(self.command_pool, None);
            }
            self.command_pool = vk::CommandPool::null();
        }

        unsafe {
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}
