//! Vulkan Core - instance and physical device selection.

use ash::{Entry, Instance, vk};
use glint_core::log;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

use crate::error::{RhiError, RhiResult};
use crate::surface::SurfaceWindow;

/// Validation layers to enable in debug builds.
#[cfg(feature = "validation")]
const VALIDATION_LAYERS: &[&str] = &["VK_LAYER_KHRONOS_validation"];

/// Scoring weights for physical device selection.
const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;
const SCORE_VULKAN_1_2: u32 = 200;

/// A selected adapter and the queue family layout discovered on it.
#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,

    graphics_queue_family: u32,
    present_queue_family: u32,
    compute_queue_family: Option<u32>,
    transfer_queue_family: Option<u32>,
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn graphics_queue_family(&self) -> u32 { self.graphics_queue_family }

    pub fn present_queue_family(&self) -> u32 { self.present_queue_family }

    /// Dedicated compute family, if the adapter exposes one apart from graphics.
    pub fn compute_queue_family(&self) -> Option<u32> { self.compute_queue_family }

    /// Dedicated transfer family, if the adapter exposes one apart from graphics.
    pub fn transfer_queue_family(&self) -> Option<u32> { self.transfer_queue_family }

    /// Capability flags of one queue family, from the cached family list.
    pub fn queue_family_flags(&self, family: u32) -> vk::QueueFlags {
        self.queue_family_properties
            .get(family as usize)
            .map(|p| p.queue_flags)
            .unwrap_or_default()
    }
}

/// This is the global entry point for Vulkan initialization.
pub struct RhiCore {
    entry: Entry,
    instance: Instance,

    /// Debug messenger (only in debug builds with validation).
    #[cfg(feature = "validation")]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    #[cfg(feature = "validation")]
    debug_utils: Option<ash::ext::debug_utils::Instance>,
}

impl RhiCore {
    /// Create the Vulkan entry and instance for the given display.
    #[profiling::function]
    pub fn new(display_handle: RawDisplayHandle) -> Result<Self, anyhow::Error> {
        // Load Vulkan dynamically
        let entry = unsafe { Entry::load()? };

        let instance = create_instance(&entry, display_handle)?;

        #[cfg(feature = "validation")]
        let (debug_utils, debug_messenger) = setup_debug_messenger(&entry, &instance)?;

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_messenger,
            #[cfg(feature = "validation")]
            debug_utils,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for RhiCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Get required instance extensions based on platform.
fn get_required_instance_extensions(display_handle: RawDisplayHandle) -> Vec<*const std::ffi::c_char> {
    let mut extensions = vec![
        // Surface extension (always needed)
        ash::khr::surface::NAME.as_ptr(),
    ];

    // Platform-specific surface extension
    #[cfg(target_os = "windows")]
    {
        let _ = display_handle;
        extensions.push(ash::khr::win32_surface::NAME.as_ptr());
    }

    #[cfg(target_os = "linux")]
    {
        match display_handle {
            RawDisplayHandle::Xlib(_) => {
                extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
            }
            RawDisplayHandle::Xcb(_) => {
                extensions.push(ash::khr::xcb_surface::NAME.as_ptr());
            }
            RawDisplayHandle::Wayland(_) => {
                extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
            }
            _ => {}
        }
    }

    #[cfg(target_os = "macos")]
    {
        let _ = display_handle;
        extensions.push(ash::ext::metal_surface::NAME.as_ptr());
    }

    // Debug utils (for validation layers)
    #[cfg(feature = "validation")]
    extensions.push(ash::ext::debug_utils::NAME.as_ptr());

    extensions
}

/// Create Vulkan instance with required extensions and validation layers.
fn create_instance(entry: &Entry, display_handle: RawDisplayHandle) -> Result<Instance, vk::Result> {
    let app_name = CString::new("Glint Application").unwrap_or_default();
    let engine_name = CString::new("Glint").unwrap_or_default();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let extensions = get_required_instance_extensions(display_handle);

    #[cfg(feature = "validation")]
    let layer_names: Vec<CString> = VALIDATION_LAYERS
        .iter()
        .filter_map(|&s| CString::new(s).ok())
        .collect();

    #[cfg(feature = "validation")]
    let layer_pointers: Vec<*const std::ffi::c_char> =
        layer_names.iter().map(|s| s.as_ptr()).collect();

    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    #[cfg(feature = "validation")]
    {
        create_info = create_info.enabled_layer_names(&layer_pointers);
    }

    unsafe { entry.create_instance(&create_info, None) }
}

/// Setup debug messenger for validation layers.
#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>), vk::Result> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

    Ok((Some(debug_utils), Some(messenger)))
}

/// Vulkan debug callback function.
#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("Vulkan {}: {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("Vulkan {}: {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("Vulkan {}: {}", type_str, message);
        }
        _ => {
            log::debug!("Vulkan {}: {}", type_str, message);
        }
    }

    vk::FALSE
}

/// Queue family layout found on one adapter.
struct QueueFamilies {
    graphics: Option<u32>,
    present: Option<u32>,
    dedicated_compute: Option<u32>,
    dedicated_transfer: Option<u32>,
}

/// Find queue families that support graphics, present, and any dedicated
/// compute/transfer families.
fn find_queue_families(
    queue_families: &[vk::QueueFamilyProperties],
    physical_device: vk::PhysicalDevice,
    surface_window: &SurfaceWindow,
) -> QueueFamilies {
    let mut families = QueueFamilies {
        graphics: None,
        present: None,
        dedicated_compute: None,
        dedicated_transfer: None,
    };

    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && families.graphics.is_none() {
            families.graphics = Some(index);
        }

        // Dedicated families skip anything that also does graphics.
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && families.dedicated_compute.is_none()
        {
            families.dedicated_compute = Some(index);
        }

        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family
                .queue_flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            && families.dedicated_transfer.is_none()
        {
            families.dedicated_transfer = Some(index);
        }

        let present_support = unsafe {
            surface_window
                .surface_loader()
                .get_physical_device_surface_support(physical_device, index, surface_window.surface())
                .unwrap_or(false)
        };

        if present_support && families.present.is_none() {
            families.present = Some(index);
        }
    }

    families
}

/// Preference weight of an adapter type alone: discrete > integrated >
/// virtual > CPU > other.
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    }
}

/// Calculate a score for the physical device (higher is better).
fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    has_required_queues: bool,
) -> u32 {
    if !has_required_queues {
        return 0; // Unusable device
    }

    let mut score = device_type_rank(properties.device_type);

    // API version scoring
    let api_version = properties.api_version;
    if api_version >= vk::make_api_version(0, 1, 4, 0) {
        score += SCORE_VULKAN_1_4;
    } else if api_version >= vk::API_VERSION_1_3 {
        score += SCORE_VULKAN_1_3;
    } else if api_version >= vk::API_VERSION_1_2 {
        score += SCORE_VULKAN_1_2;
    }

    // VRAM scoring (total device-local memory)
    let vram_bytes: u64 = memory_properties.memory_heaps
        [..memory_properties.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();

    let vram_gb = (vram_bytes / (1024 * 1024 * 1024)) as u32;
    score += vram_gb * SCORE_PER_GB_VRAM;

    score
}

/// Select the best adapter able to draw to the given surface.
pub fn select_physical_device(
    instance: &Instance,
    surface_window: &SurfaceWindow,
) -> RhiResult<PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    if physical_devices.is_empty() {
        return Err(RhiError::Usage("no Vulkan-capable GPU found".into()));
    }

    let mut best_device = None;
    let mut best_device_score = 0u32;

    for device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let families = find_queue_families(&queue_family_properties, device, surface_window);
        let has_required_queues = families.graphics.is_some() && families.present.is_some();
        let score = score_physical_device(&properties, &memory_properties, has_required_queues);

        let device_name =
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy() };

        log::info!(
            "Found GPU: {} (score: {}, type: {:?})",
            device_name, score, properties.device_type
        );

        if score > best_device_score {
            let (Some(graphics_queue_family), Some(present_queue_family)) =
                (families.graphics, families.present)
            else {
                continue;
            };
            best_device = Some(PhysicalDevice {
                handle: device,
                properties,
                memory_properties,
                queue_family_properties,
                graphics_queue_family,
                present_queue_family,
                compute_queue_family: families.dedicated_compute,
                transfer_queue_family: families.dedicated_transfer,
            });
            best_device_score = score;
        }
    }

    best_device.ok_or_else(|| RhiError::Usage("no suitable GPU found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(
        device_type: vk::PhysicalDeviceType,
        api_version: u32,
        vram_gb: u64,
    ) -> (
        vk::PhysicalDeviceProperties,
        vk::PhysicalDeviceMemoryProperties,
    ) {
        let properties = vk::PhysicalDeviceProperties {
            device_type,
            api_version,
            ..Default::default()
        };
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heap_count = 1;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: vram_gb * 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        (properties, memory_properties)
    }

    #[test]
    fn device_type_rank_prefers_discrete() {
        assert!(
            device_type_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_rank(vk::PhysicalDeviceType::VIRTUAL_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::CPU)
                > device_type_rank(vk::PhysicalDeviceType::OTHER)
        );
    }

    #[test]
    fn missing_required_queues_zeroes_the_score() {
        let (properties, memory_properties) =
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3, 8);
        assert_eq!(
            score_physical_device(&properties, &memory_properties, false),
            0
        );
    }

    #[test]
    fn discrete_outscores_integrated_regardless_of_vram() {
        let (discrete_props, discrete_mem) =
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_2, 2);
        let (integrated_props, integrated_mem) =
            adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::API_VERSION_1_3, 32);

        assert!(
            score_physical_device(&discrete_props, &discrete_mem, true)
                > score_physical_device(&integrated_props, &integrated_mem, true)
        );
    }
}
