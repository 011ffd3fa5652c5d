//! Device memory allocator - buffer/image creation with hint-based memory
//! type selection and binding in one call.

use ash::{Device, vk};
use enumflags2::{BitFlags, bitflags};
use glint_core::log;

use crate::device::DeviceBundle;
use crate::utility::find_memory_type;

/// Host-access intents attached to an allocation request.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationCreate {
    /// Map the allocation at creation and keep it mapped.
    Mapped,
    /// Host reads and writes in no particular pattern.
    HostAccessRandom,
    /// Host writes front-to-back only (uploads, staging).
    HostAccessSequentialWrite,
    /// Only accept host-coherent memory types.
    RequireCoherent,
}

/// Broad placement preference for an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryUsage {
    #[default]
    Auto,
    PreferDevice,
    PreferHost,
}

/// Hints driving memory type selection.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationCreateInfo {
    pub usage: MemoryUsage,
    pub flags: BitFlags<AllocationCreate>,
    pub required_flags: vk::MemoryPropertyFlags,
    pub preferred_flags: vk::MemoryPropertyFlags,
}

impl AllocationCreateInfo {
    pub fn device_local() -> Self {
        Self {
            usage: MemoryUsage::PreferDevice,
            ..Default::default()
        }
    }

    pub fn host_staging() -> Self {
        Self {
            usage: MemoryUsage::PreferHost,
            flags: AllocationCreate::Mapped | AllocationCreate::HostAccessSequentialWrite,
            ..Default::default()
        }
    }

    /// Whether any host-access intent or explicit host-visible requirement is
    /// present.
    pub fn wants_host_access(&self) -> bool {
        self.flags.intersects(
            AllocationCreate::Mapped
                | AllocationCreate::HostAccessRandom
                | AllocationCreate::HostAccessSequentialWrite,
        ) || self
            .required_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// One bound device-memory allocation.
///
/// The default value is the canonical invalid state (null memory handle).
pub struct Allocation {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    /// Property flags of the memory type actually granted.
    property_flags: vk::MemoryPropertyFlags,
    mapped_ptr: *mut u8,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            size: 0,
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::empty(),
            mapped_ptr: std::ptr::null_mut(),
        }
    }
}

impl Allocation {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    pub fn is_null(&self) -> bool {
        self.memory == vk::DeviceMemory::null()
    }

    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Host address, null unless currently mapped.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped_ptr
    }
}

/// Memory allocator bound to one logical device.
///
/// Cheap to clone; clones are non-owning handles onto the same device. All
/// creation calls select a memory type from the request hints, allocate,
/// and bind in one step.
#[derive(Clone)]
pub struct DeviceAllocator {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceAllocator {
    pub fn new(device: &DeviceBundle) -> Self {
        Self {
            device: device.handle().clone(),
            memory_properties: *device.memory_properties(),
        }
    }

    pub fn from_parts(
        device: Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        Self {
            device,
            memory_properties,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Create a buffer, pick a memory type from the hints, allocate, bind,
    /// and (for [`AllocationCreate::Mapped`]) map.
    pub fn create_buffer(
        &self,
        buffer_info: &vk::BufferCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> Result<(vk::Buffer, Allocation), vk::Result> {
        let buffer = unsafe { self.device.create_buffer(buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate_and_map(&requirements, alloc_info) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, allocation.memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(allocation.memory, None);
            }
            return Err(err);
        }

        log::trace!("buffer allocated ({} bytes)", requirements.size);
        Ok((buffer, allocation))
    }

    /// Image counterpart of [`create_buffer`](Self::create_buffer).
    pub fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> Result<(vk::Image, Allocation), vk::Result> {
        let image = unsafe { self.device.create_image(image_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate_and_map(&requirements, alloc_info) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { self.device.bind_image_memory(image, allocation.memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(allocation.memory, None);
            }
            return Err(err);
        }

        Ok((image, allocation))
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, allocation: &mut Allocation) {
        unsafe {
            if buffer != vk::Buffer::null() {
                self.device.destroy_buffer(buffer, None);
            }
            if !allocation.is_null() {
                // Freeing implicitly unmaps.
                self.device.free_memory(allocation.memory, None);
            }
        }
        *allocation = Allocation::default();
    }

    pub fn destroy_image(&self, image: vk::Image, allocation: &mut Allocation) {
        unsafe {
            if image != vk::Image::null() {
                self.device.destroy_image(image, None);
            }
            if !allocation.is_null() {
                self.device.free_memory(allocation.memory, None);
            }
        }
        *allocation = Allocation::default();
    }

    /// Map the whole allocation. Returns the existing address when already
    /// mapped.
    pub fn map(&self, allocation: &mut Allocation) -> Result<*mut u8, vk::Result> {
        if !allocation.mapped_ptr.is_null() {
            return Ok(allocation.mapped_ptr);
        }

        let ptr = unsafe {
            self.device.map_memory(
                allocation.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        allocation.mapped_ptr = ptr as *mut u8;
        Ok(allocation.mapped_ptr)
    }

    pub fn unmap(&self, allocation: &mut Allocation) {
        if !allocation.mapped_ptr.is_null() {
            unsafe { self.device.unmap_memory(allocation.memory) };
            allocation.mapped_ptr = std::ptr::null_mut();
        }
    }

    pub fn flush(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory)
            .offset(offset)
            .size(size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
    }

    pub fn invalidate(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory)
            .offset(offset)
            .size(size);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
    }

    fn allocate_and_map(
        &self,
        requirements: &vk::MemoryRequirements,
        alloc_info: &AllocationCreateInfo,
    ) -> Result<Allocation, vk::Result> {
        let (memory_type_index, property_flags) = pick_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            alloc_info,
        )
        .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };

        let mut allocation = Allocation {
            memory,
            size: requirements.size,
            memory_type_index,
            property_flags,
            mapped_ptr: std::ptr::null_mut(),
        };

        if alloc_info.flags.contains(AllocationCreate::Mapped) {
            if let Err(err) = self.map(&mut allocation) {
                unsafe { self.device.free_memory(memory, None) };
                return Err(err);
            }
        }

        Ok(allocation)
    }
}

/// Translate the allocation hints into memory property flags and search the
/// adapter's memory types: first required-plus-preferred, then required
/// alone.
fn pick_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    alloc_info: &AllocationCreateInfo,
) -> Option<(u32, vk::MemoryPropertyFlags)> {
    let mut required = alloc_info.required_flags;
    if alloc_info.flags.intersects(
        AllocationCreate::Mapped
            | AllocationCreate::HostAccessRandom
            | AllocationCreate::HostAccessSequentialWrite,
    ) {
        required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
    }
    if alloc_info.flags.contains(AllocationCreate::RequireCoherent) {
        required |= vk::MemoryPropertyFlags::HOST_COHERENT;
    }

    let mut preferred = alloc_info.preferred_flags;
    match alloc_info.usage {
        MemoryUsage::PreferDevice => preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryUsage::PreferHost => preferred |= vk::MemoryPropertyFlags::HOST_COHERENT,
        MemoryUsage::Auto => {}
    }

    let lookup = |flags: vk::MemoryPropertyFlags| {
        find_memory_type(memory_properties, type_bits, flags).map(|index| {
            (
                index,
                memory_properties.memory_types[index as usize].property_flags,
            )
        })
    };

    lookup(required | preferred).or_else(|| lookup(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut out = vk::PhysicalDeviceMemoryProperties::default();
        out.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            out.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        out
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn host_visible() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE
    }

    fn host_coherent() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn host_access_hints_require_host_visible() {
        let props = props(&[DEVICE_LOCAL, host_coherent()]);
        let info = AllocationCreateInfo {
            flags: AllocationCreate::HostAccessSequentialWrite.into(),
            ..Default::default()
        };

        let (index, granted) = pick_memory_type(&props, 0b11, &info).unwrap();
        assert_eq!(index, 1);
        assert!(granted.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    }

    #[test]
    fn require_coherent_rejects_incoherent_types() {
        let props = props(&[host_visible()]);
        let info = AllocationCreateInfo {
            flags: AllocationCreate::HostAccessRandom | AllocationCreate::RequireCoherent,
            ..Default::default()
        };

        assert!(pick_memory_type(&props, 0b1, &info).is_none());
    }

    #[test]
    fn prefer_device_falls_back_when_no_device_local_type() {
        let props = props(&[host_coherent()]);
        let info = AllocationCreateInfo {
            usage: MemoryUsage::PreferDevice,
            ..Default::default()
        };

        // Preferred pass finds nothing device-local; required pass succeeds.
        let (index, _) = pick_memory_type(&props, 0b1, &info).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn prefer_device_picks_device_local_over_host() {
        let props = props(&[host_coherent(), DEVICE_LOCAL]);
        let info = AllocationCreateInfo::device_local();

        let (index, granted) = pick_memory_type(&props, 0b11, &info).unwrap();
        assert_eq!(index, 1);
        assert!(granted.contains(DEVICE_LOCAL));
    }

    #[test]
    fn wants_host_access_detects_explicit_requirement() {
        let explicit = AllocationCreateInfo {
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            ..Default::default()
        };
        assert!(explicit.wants_host_access());

        let none = AllocationCreateInfo::default();
        assert!(!none.wants_host_access());
    }
}
