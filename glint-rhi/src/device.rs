//! Vulkan Device - logical device creation and introspection.

use ash::{Device, Instance, vk};
use glint_core::log;
use std::collections::HashSet;
use std::ffi::{CStr, CString};

use crate::core::PhysicalDevice;
use crate::queue::QueueHandle;

/// Device-creation parameters retained by the bundle.
///
/// Feature structs are stored with their extension chains severed so the
/// copies stay self-contained after the caller's originals are gone.
#[derive(Clone)]
pub struct DeviceDesc {
    pub extensions: Vec<CString>,
    /// Creation flags applied to every requested queue (e.g. PROTECTED).
    pub queue_flags: vk::DeviceQueueCreateFlags,
    pub features: vk::PhysicalDeviceFeatures,
    pub features_11: Option<vk::PhysicalDeviceVulkan11Features<'static>>,
    pub features_12: Option<vk::PhysicalDeviceVulkan12Features<'static>>,
    pub features_13: Option<vk::PhysicalDeviceVulkan13Features<'static>>,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            queue_flags: vk::DeviceQueueCreateFlags::empty(),
            features: vk::PhysicalDeviceFeatures::default(),
            features_11: None,
            features_12: None,
            features_13: Some(
                vk::PhysicalDeviceVulkan13Features::default()
                    .dynamic_rendering(true)
                    .synchronization2(true),
            ),
        }
    }
}

/// Logical device paired with its adapter and retained creation parameters.
///
/// Immutable once constructed; extension queries are answered from a sorted
/// local copy of the enabled names without touching the API.
pub struct DeviceBundle {
    physical_device: PhysicalDevice,
    device: Device,

    enabled_extensions: Vec<CString>,
    queue_create_flags: vk::DeviceQueueCreateFlags,
    features: vk::PhysicalDeviceFeatures,
    features_11: Option<vk::PhysicalDeviceVulkan11Features<'static>>,
    features_12: Option<vk::PhysicalDeviceVulkan12Features<'static>>,
    features_13: Option<vk::PhysicalDeviceVulkan13Features<'static>>,
}

impl DeviceBundle {
    /// Create a logical device on the adapter, requesting one queue per
    /// unique family discovered on it.
    #[profiling::function]
    pub fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        desc: &DeviceDesc,
    ) -> Result<Self, vk::Result> {
        let mut unique_families: HashSet<u32> = [
            physical_device.graphics_queue_family(),
            physical_device.present_queue_family(),
        ]
        .into_iter()
        .collect();
        unique_families.extend(physical_device.compute_queue_family());
        unique_families.extend(physical_device.transfer_queue_family());

        let queue_priority = 1.0f32;

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .flags(desc.queue_flags)
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_pointers: Vec<*const std::ffi::c_char> =
            desc.extensions.iter().map(|e| e.as_ptr()).collect();

        // Local feature copies with p_next severed; the chain below links the
        // locals, never the caller's structs.
        let features = desc.features;
        let mut features_11 = desc.features_11.map(|f| vk::PhysicalDeviceVulkan11Features {
            p_next: std::ptr::null_mut(),
            ..f
        });
        let mut features_12 = desc.features_12.map(|f| vk::PhysicalDeviceVulkan12Features {
            p_next: std::ptr::null_mut(),
            ..f
        });
        let mut features_13 = desc.features_13.map(|f| vk::PhysicalDeviceVulkan13Features {
            p_next: std::ptr::null_mut(),
            ..f
        });

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_pointers)
            .enabled_features(&features);

        if let Some(f) = features_11.as_mut() {
            create_info = create_info.push_next(f);
        }
        if let Some(f) = features_12.as_mut() {
            create_info = create_info.push_next(f);
        }
        if let Some(f) = features_13.as_mut() {
            create_info = create_info.push_next(f);
        }

        let device =
            unsafe { instance.create_device(physical_device.handle(), &create_info, None)? };

        let mut enabled_extensions = desc.extensions.clone();
        enabled_extensions.sort_unstable();

        log::debug!(
            "logical device created ({} extensions, {} queue families)",
            enabled_extensions.len(),
            queue_create_infos.len()
        );

        Ok(Self {
            physical_device: physical_device.clone(),
            device,
            enabled_extensions,
            queue_create_flags: desc.queue_flags,
            features,
            features_11: features_11.map(strip_11),
            features_12: features_12.map(strip_12),
            features_13: features_13.map(strip_13),
        })
    }

    /// Get a reference to the logical device.
    #[inline]
    pub fn handle(&self) -> &Device {
        &self.device
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.physical_device.memory_properties()
    }

    /// Whether the named device extension was enabled at creation.
    ///
    /// Binary search over the locally-owned sorted list; no API round trip.
    pub fn extension_enabled(&self, name: &CStr) -> bool {
        extension_listed(&self.enabled_extensions, name)
    }

    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    pub fn enabled_features_11(&self) -> Option<&vk::PhysicalDeviceVulkan11Features<'static>> {
        self.features_11.as_ref()
    }

    pub fn enabled_features_12(&self) -> Option<&vk::PhysicalDeviceVulkan12Features<'static>> {
        self.features_12.as_ref()
    }

    pub fn enabled_features_13(&self) -> Option<&vk::PhysicalDeviceVulkan13Features<'static>> {
        self.features_13.as_ref()
    }

    /// Creation flags the device's queues were requested with.
    pub fn queue_create_flags(&self) -> vk::DeviceQueueCreateFlags {
        self.queue_create_flags
    }

    /// Build a queue handle for a queue retrieved from this device.
    pub fn queue_handle(&self, family: u32, index: u32) -> QueueHandle {
        let queue = unsafe { self.device.get_device_queue(family, index) };
        QueueHandle::new(
            self.device.clone(),
            queue,
            family,
            Some(index),
            self.physical_device.queue_family_flags(family),
            queue_protected(self.queue_create_flags),
            family == self.physical_device.present_queue_family(),
        )
    }

    pub fn graphics_queue(&self) -> QueueHandle {
        self.queue_handle(self.physical_device.graphics_queue_family(), 0)
    }

    pub fn present_queue(&self) -> QueueHandle {
        self.queue_handle(self.physical_device.present_queue_family(), 0)
    }

    pub fn compute_queue(&self) -> Option<QueueHandle> {
        self.physical_device
            .compute_queue_family()
            .map(|family| self.queue_handle(family, 0))
    }

    pub fn transfer_queue(&self) -> Option<QueueHandle> {
        self.physical_device
            .transfer_queue_family()
            .map(|family| self.queue_handle(family, 0))
    }

    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }

    /// Explicit teardown; equivalent to dropping the bundle.
    pub fn destroy(self) {}
}

impl Drop for DeviceBundle {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

fn queue_protected(flags: vk::DeviceQueueCreateFlags) -> bool {
    flags.contains(vk::DeviceQueueCreateFlags::PROTECTED)
}

fn extension_listed(sorted: &[CString], name: &CStr) -> bool {
    sorted
        .binary_search_by(|entry| entry.as_c_str().cmp(name))
        .is_ok()
}

fn strip_11(f: vk::PhysicalDeviceVulkan11Features<'static>) -> vk::PhysicalDeviceVulkan11Features<'static> {
    vk::PhysicalDeviceVulkan11Features {
        p_next: std::ptr::null_mut(),
        ..f
    }
}

fn strip_12(f: vk::PhysicalDeviceVulkan12Features<'static>) -> vk::PhysicalDeviceVulkan12Features<'static> {
    vk::PhysicalDeviceVulkan12Features {
        p_next: std::ptr::null_mut(),
        ..f
    }
}

fn strip_13(f: vk::PhysicalDeviceVulkan13Features<'static>) -> vk::PhysicalDeviceVulkan13Features<'static> {
    vk::PhysicalDeviceVulkan13Features {
        p_next: std::ptr::null_mut(),
        ..f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(names: &[&str]) -> Vec<CString> {
        let mut out: Vec<CString> = names
            .iter()
            .map(|n| CString::new(*n).unwrap())
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn extension_lookup_hits_and_misses() {
        let list = sorted(&[
            "VK_KHR_swapchain",
            "VK_KHR_maintenance4",
            "VK_EXT_descriptor_indexing",
        ]);

        assert!(extension_listed(&list, c"VK_KHR_swapchain"));
        assert!(extension_listed(&list, c"VK_EXT_descriptor_indexing"));
        assert!(!extension_listed(&list, c"VK_KHR_ray_tracing_pipeline"));
        assert!(!extension_listed(&list, c""));
    }

    #[test]
    fn extension_lookup_on_empty_list() {
        assert!(!extension_listed(&[], c"VK_KHR_swapchain"));
    }

    #[test]
    fn queue_protection_follows_creation_flags() {
        assert!(!queue_protected(DeviceDesc::default().queue_flags));
        assert!(queue_protected(vk::DeviceQueueCreateFlags::PROTECTED));
        assert!(!queue_protected(vk::DeviceQueueCreateFlags::empty()));
    }
}
