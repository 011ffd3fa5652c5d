//! Vulkan Buffer - device buffer, host-mappable buffer, and staged-upload
//! buffer built on a common base.

use ash::vk;
use enumflags2::{BitFlags, bitflags};
use glint_core::log;
use std::ops::Deref;

use crate::alloc::{
    Allocation, AllocationCreate, AllocationCreateInfo, DeviceAllocator, MemoryUsage,
};
use crate::error::{RhiError, RhiResult};
use crate::queue::QueueHandle;

/// Host-access intents for a [`MappableBuffer`].
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapFlag {
    /// Map at construction and stay mapped for the buffer's lifetime.
    CreateMapped,
    /// Host reads and writes in no particular pattern.
    RandomAccess,
    /// Host writes front-to-back only.
    SequentialWrite,
    /// Only accept host-coherent memory.
    RequireCoherent,
}

pub type MapFlags = BitFlags<MapFlag>;

/// Plain device buffer with its bound allocation.
///
/// The default value is the canonical invalid state; `reset` always returns
/// to it. Ownership moves through [`take`](Buffer::take), never copies.
#[derive(Default)]
pub struct Buffer {
    allocator: Option<DeviceAllocator>,
    buffer: vk::Buffer,
    allocation: Allocation,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Create a device-local buffer of `size` bytes.
    pub fn new(
        allocator: &DeviceAllocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RhiResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        Self::with_info(allocator, &buffer_info, &AllocationCreateInfo::device_local())
    }

    /// Create from full creation parameters.
    pub fn with_info(
        allocator: &DeviceAllocator,
        buffer_info: &vk::BufferCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> RhiResult<Self> {
        let (buffer, allocation) = allocator.create_buffer(buffer_info, alloc_info)?;

        Ok(Self {
            allocator: Some(allocator.clone()),
            buffer,
            allocation,
            size: buffer_info.size,
            usage: buffer_info.usage,
        })
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Byte size; zero exactly when invalid.
    #[inline]
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags; empty exactly when invalid.
    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn allocator(&self) -> Option<&DeviceAllocator> {
        self.allocator.as_ref()
    }

    /// Allocation details; errors on an invalid buffer.
    pub fn alloc_info(&self) -> RhiResult<&Allocation> {
        if !self.is_valid() {
            return Err(RhiError::InvalidResource("buffer has no allocation"));
        }
        Ok(&self.allocation)
    }

    /// Destroy the underlying buffer and allocation, returning to the
    /// default state. Safe on an already-invalid buffer.
    pub fn reset(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            if self.buffer != vk::Buffer::null() || !self.allocation.is_null() {
                allocator.destroy_buffer(self.buffer, &mut self.allocation);
            }
        }
        self.buffer = vk::Buffer::null();
        self.allocation = Allocation::default();
        self.size = 0;
        self.usage = vk::BufferUsageFlags::empty();
    }

    /// Transfer ownership out, leaving `self` in the default state.
    pub fn take(&mut self) -> Buffer {
        std::mem::take(self)
    }

    /// Hand the raw buffer and allocation to the caller, who becomes
    /// responsible for destroying them.
    pub fn release(mut self) -> (vk::Buffer, Allocation) {
        self.allocator = None;
        let buffer = self.buffer;
        self.buffer = vk::Buffer::null();
        let allocation = std::mem::take(&mut self.allocation);
        (buffer, allocation)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Host-mappable buffer with explicit map/unmap and cache-maintenance
/// semantics.
///
/// Construction requires a host-access intent; a mappable buffer that could
/// never be mapped is a configuration error.
pub struct MappableBuffer {
    buf: Buffer,
    map_flags: MapFlags,
    coherent: bool,
    mapped: *mut u8,
}

impl Default for MappableBuffer {
    fn default() -> Self {
        Self {
            buf: Buffer::default(),
            map_flags: MapFlags::empty(),
            coherent: false,
            mapped: std::ptr::null_mut(),
        }
    }
}

impl MappableBuffer {
    pub fn new(
        allocator: &DeviceAllocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: MapFlags,
    ) -> RhiResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_info = AllocationCreateInfo {
            usage: MemoryUsage::Auto,
            flags: map_flags_to_alloc(flags),
            ..Default::default()
        };
        Self::with_info(allocator, &buffer_info, &alloc_info)
    }

    /// Create from full creation parameters. The allocation hints must carry
    /// a host-access intent or an explicit host-visible requirement.
    pub fn with_info(
        allocator: &DeviceAllocator,
        buffer_info: &vk::BufferCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> RhiResult<Self> {
        if !alloc_info.wants_host_access() {
            return Err(RhiError::Usage(
                "mappable buffer requested without any host-access intent".into(),
            ));
        }

        let buf = Buffer::with_info(allocator, buffer_info, alloc_info)?;
        let coherent = buf.allocation.is_coherent();
        let mapped = buf.allocation.mapped_ptr();

        Ok(Self {
            buf,
            map_flags: alloc_flags_to_map(alloc_info.flags),
            coherent,
            mapped,
        })
    }

    pub fn map_flags(&self) -> MapFlags {
        self.map_flags
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn is_persistently_mapped(&self) -> bool {
        self.map_flags.contains(MapFlag::CreateMapped)
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    /// Current host address, null unless mapped.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    /// Map the buffer. Idempotent: an already-mapped buffer returns the
    /// existing address.
    pub fn map(&mut self) -> RhiResult<*mut u8> {
        if !self.buf.is_valid() {
            return Err(RhiError::InvalidResource("cannot map an invalid buffer"));
        }
        if !self.mapped.is_null() {
            return Ok(self.mapped);
        }

        let Buffer {
            allocator,
            allocation,
            ..
        } = &mut self.buf;
        let allocator = allocator
            .as_ref()
            .ok_or(RhiError::InvalidResource("buffer has no allocator"))?;

        self.mapped = allocator.map(allocation)?;
        Ok(self.mapped)
    }

    /// Unmap the buffer. No-op for persistently-mapped buffers; non-coherent
    /// memory is flushed and invalidated first.
    pub fn unmap(&mut self) -> RhiResult<()> {
        if self.is_persistently_mapped() || self.mapped.is_null() {
            return Ok(());
        }
        if !self.coherent {
            self.flush_and_invalidate_pages()?;
        }

        let Buffer {
            allocator,
            allocation,
            ..
        } = &mut self.buf;
        if let Some(allocator) = allocator.as_ref() {
            allocator.unmap(allocation);
        }
        self.mapped = std::ptr::null_mut();
        Ok(())
    }

    /// Flush host writes toward the device. No-op on invalid buffers and on
    /// coherent memory.
    pub fn flush(&self) -> RhiResult<()> {
        if !self.buf.is_valid() || self.coherent {
            return Ok(());
        }
        if let Some(allocator) = self.buf.allocator.as_ref() {
            allocator.flush(&self.buf.allocation, 0, vk::WHOLE_SIZE)?;
        }
        Ok(())
    }

    /// Invalidate host caches for device writes. No-op on invalid buffers
    /// and on coherent memory.
    pub fn invalidate_pages(&self) -> RhiResult<()> {
        if !self.buf.is_valid() || self.coherent {
            return Ok(());
        }
        if let Some(allocator) = self.buf.allocator.as_ref() {
            allocator.invalidate(&self.buf.allocation, 0, vk::WHOLE_SIZE)?;
        }
        Ok(())
    }

    pub fn flush_and_invalidate_pages(&self) -> RhiResult<()> {
        self.flush()?;
        self.invalidate_pages()
    }

    pub fn reset(&mut self) {
        self.buf.reset();
        self.map_flags = MapFlags::empty();
        self.coherent = false;
        self.mapped = std::ptr::null_mut();
    }

    /// Transfer ownership out, leaving `self` in the default state.
    pub fn take(&mut self) -> MappableBuffer {
        std::mem::take(self)
    }

    /// Unmap and convert into a plain buffer.
    pub fn into_buffer(mut self) -> Buffer {
        if let Err(err) = self.unmap() {
            log::warn!("unmap during buffer conversion failed: {err}");
        }
        self.buf.take()
    }
}

impl Deref for MappableBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buf
    }
}

impl From<MappableBuffer> for Buffer {
    fn from(buffer: MappableBuffer) -> Self {
        buffer.into_buffer()
    }
}

/// Device-local buffer paired with a hidden host staging area.
///
/// The device buffer always carries transfer-destination usage; the staging
/// area is persistently mapped with sequential-write semantics and matches
/// the device buffer's size.
#[derive(Default)]
pub struct StagedBuffer {
    device_buf: Buffer,
    staging: MappableBuffer,
}

impl StagedBuffer {
    /// Create a device-local buffer plus matching staging area.
    /// Transfer-destination usage is added if absent.
    pub fn new(
        allocator: &DeviceAllocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RhiResult<Self> {
        let device_buf = Buffer::new(allocator, size, usage | vk::BufferUsageFlags::TRANSFER_DST)?;
        Self::attach_stage(device_buf)
    }

    /// Wrap an existing device buffer. Fails with a usage error when the
    /// buffer lacks transfer-destination usage.
    pub fn from_buffer(device_buf: Buffer) -> RhiResult<Self> {
        if !device_buf.usage().contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(RhiError::Usage(
                "staged buffer requires TRANSFER_DST usage on the device buffer".into(),
            ));
        }
        Self::attach_stage(device_buf)
    }

    fn attach_stage(device_buf: Buffer) -> RhiResult<Self> {
        let allocator = device_buf
            .allocator()
            .ok_or(RhiError::InvalidResource("device buffer has no allocator"))?
            .clone();
        let staging = MappableBuffer::new(
            &allocator,
            device_buf.buffer_size(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MapFlag::CreateMapped | MapFlag::SequentialWrite,
        )?;

        Ok(Self {
            device_buf,
            staging,
        })
    }

    pub fn stage(&self) -> &MappableBuffer {
        &self.staging
    }

    /// Copy `data` into the staging area and flush it. Lengths greater than
    /// the buffer size fail out-of-range with no partial copy.
    pub fn stage_data(&mut self, data: &[u8]) -> RhiResult<()> {
        if !self.staging.is_mapped() {
            return Err(RhiError::InvalidResource("staging area is not mapped"));
        }
        let len = data.len() as vk::DeviceSize;
        if len > self.device_buf.buffer_size() {
            return Err(RhiError::OutOfRange {
                requested: len,
                capacity: self.device_buf.buffer_size(),
            });
        }

        // SAFETY: the staging area is persistently mapped and at least
        // `buffer_size` bytes long; `len` was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.staging.mapped_ptr(), data.len());
        }
        self.staging.flush()
    }

    /// Record a full-size copy from the staging area to the device buffer.
    pub fn rec_upload(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let allocator = self
            .device_buf
            .allocator()
            .ok_or(RhiError::InvalidResource("upload from an invalid buffer"))?;

        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(self.device_buf.buffer_size());
        unsafe {
            allocator.device().cmd_copy_buffer(
                cmd,
                self.staging.handle(),
                self.device_buf.handle(),
                &[region],
            );
        }
        Ok(())
    }

    /// Record the barrier making the uploaded range visible to later
    /// commands at the given stage/access scope.
    pub fn rec_upload_barrier(
        &self,
        cmd: vk::CommandBuffer,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> RhiResult<()> {
        let allocator = self
            .device_buf
            .allocator()
            .ok_or(RhiError::InvalidResource("barrier on an invalid buffer"))?;

        let barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.device_buf.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE);

        let dependency =
            vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            allocator.device().cmd_pipeline_barrier2(cmd, &dependency);
        }
        Ok(())
    }

    /// Submit the staged contents through `queue` and block until the copy
    /// completes.
    pub fn upload_now(&self, queue: &mut QueueHandle) -> RhiResult<()> {
        let cmd = queue.begin_single_submit(None)?;
        if let Err(err) = self.rec_upload(cmd) {
            // Close the sequence so the queue handle is reusable.
            let _ = queue.end_single_submit_and_flush(cmd);
            return Err(err);
        }
        queue.end_single_submit_and_flush(cmd)
    }

    /// Stage `data` and upload it in one blocking call.
    pub fn upload_now_with(&mut self, data: &[u8], queue: &mut QueueHandle) -> RhiResult<()> {
        self.stage_data(data)?;
        self.upload_now(queue)
    }

    /// Discard the staging area, keeping the device-local buffer.
    pub fn drop_stage(mut self) -> Buffer {
        self.staging.reset();
        self.device_buf.take()
    }

    pub fn reset(&mut self) {
        self.staging.reset();
        self.device_buf.reset();
    }

    /// Transfer ownership out, leaving `self` in the default state.
    pub fn take(&mut self) -> StagedBuffer {
        std::mem::take(self)
    }
}

impl Deref for StagedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.device_buf
    }
}

fn map_flags_to_alloc(flags: MapFlags) -> BitFlags<AllocationCreate> {
    let mut out = BitFlags::empty();
    if flags.contains(MapFlag::CreateMapped) {
        out |= AllocationCreate::Mapped;
    }
    if flags.contains(MapFlag::RandomAccess) {
        out |= AllocationCreate::HostAccessRandom;
    }
    if flags.contains(MapFlag::SequentialWrite) {
        out |= AllocationCreate::HostAccessSequentialWrite;
    }
    if flags.contains(MapFlag::RequireCoherent) {
        out |= AllocationCreate::RequireCoherent;
    }
    out
}

fn alloc_flags_to_map(flags: BitFlags<AllocationCreate>) -> MapFlags {
    let mut out = MapFlags::empty();
    if flags.contains(AllocationCreate::Mapped) {
        out |= MapFlag::CreateMapped;
    }
    if flags.contains(AllocationCreate::HostAccessRandom) {
        out |= MapFlag::RandomAccess;
    }
    if flags.contains(AllocationCreate::HostAccessSequentialWrite) {
        out |= MapFlag::SequentialWrite;
    }
    if flags.contains(AllocationCreate::RequireCoherent) {
        out |= MapFlag::RequireCoherent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    /// A buffer with a fabricated handle and no allocator; drop and reset
    /// are no-ops beyond clearing fields.
    fn fake_buffer(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Buffer {
        Buffer {
            allocator: None,
            buffer: vk::Buffer::from_raw(0xdead_beef),
            allocation: Allocation::default(),
            size,
            usage,
        }
    }

    fn fake_staged(backing: &mut [u8]) -> StagedBuffer {
        let size = backing.len() as vk::DeviceSize;
        StagedBuffer {
            device_buf: fake_buffer(size, vk::BufferUsageFlags::TRANSFER_DST),
            staging: MappableBuffer {
                buf: fake_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC),
                map_flags: MapFlag::CreateMapped | MapFlag::SequentialWrite,
                coherent: true,
                mapped: backing.as_mut_ptr(),
            },
        }
    }

    #[test]
    fn default_buffer_is_invalid_with_empty_metadata() {
        let buffer = Buffer::default();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.buffer_size(), 0);
        assert_eq!(buffer.usage(), vk::BufferUsageFlags::empty());
        assert!(matches!(
            buffer.alloc_info(),
            Err(RhiError::InvalidResource(_))
        ));
    }

    #[test]
    fn reset_on_invalid_buffer_is_safe() {
        let mut buffer = Buffer::default();
        buffer.reset();
        buffer.reset();
        assert!(!buffer.is_valid());
    }

    #[test]
    fn take_moves_identity_and_invalidates_source() {
        let mut source = fake_buffer(256, vk::BufferUsageFlags::VERTEX_BUFFER);
        let handle = source.handle();

        let moved = source.take();
        assert!(!source.is_valid());
        assert_eq!(source.buffer_size(), 0);
        assert_eq!(source.usage(), vk::BufferUsageFlags::empty());

        assert!(moved.is_valid());
        assert_eq!(moved.handle(), handle);
        assert_eq!(moved.buffer_size(), 256);
        assert_eq!(moved.usage(), vk::BufferUsageFlags::VERTEX_BUFFER);
    }

    #[test]
    fn persistent_mapping_survives_unmap() {
        let mut backing = [0u8; 16];
        let mut staged = fake_staged(&mut backing);
        let ptr = staged.staging.mapped_ptr();

        assert!(staged.staging.is_mapped());
        staged.staging.unmap().unwrap();
        assert!(staged.staging.is_mapped());
        assert_eq!(staged.staging.mapped_ptr(), ptr);
    }

    #[test]
    fn map_on_invalid_buffer_errors() {
        let mut buffer = MappableBuffer::default();
        assert!(matches!(
            buffer.map(),
            Err(RhiError::InvalidResource(_))
        ));
    }

    #[test]
    fn flush_is_noop_on_invalid_buffer() {
        let buffer = MappableBuffer::default();
        assert!(buffer.flush().is_ok());
        assert!(buffer.invalidate_pages().is_ok());
        assert!(buffer.flush_and_invalidate_pages().is_ok());
    }

    #[test]
    fn stage_data_copies_exact_bytes() {
        let mut backing = [0u8; 8];
        let pattern = [1u8, 2, 3, 4, 5];
        {
            let mut staged = fake_staged(&mut backing);
            staged.stage_data(&pattern).unwrap();
        }
        assert_eq!(&backing[..5], &pattern);
        assert_eq!(&backing[5..], &[0, 0, 0]);
    }

    #[test]
    fn stage_data_out_of_range_copies_nothing() {
        let mut backing = [0u8; 4];
        let oversized = [9u8; 8];
        {
            let mut staged = fake_staged(&mut backing);
            let err = staged.stage_data(&oversized).unwrap_err();
            assert!(matches!(
                err,
                RhiError::OutOfRange {
                    requested: 8,
                    capacity: 4
                }
            ));
        }
        assert_eq!(backing, [0u8; 4]);
    }

    #[test]
    fn from_buffer_requires_transfer_dst() {
        let plain = fake_buffer(64, vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(matches!(
            StagedBuffer::from_buffer(plain),
            Err(RhiError::Usage(_))
        ));
    }

    #[test]
    fn drop_stage_keeps_device_buffer() {
        let mut backing = [0u8; 4];
        let staged = fake_staged(&mut backing);
        let handle = staged.device_buf.handle();

        let device_buf = staged.drop_stage();
        assert!(device_buf.is_valid());
        assert_eq!(device_buf.handle(), handle);
        assert_eq!(device_buf.buffer_size(), 4);
    }

    #[test]
    fn map_flag_translation_round_trips() {
        let flags = MapFlag::CreateMapped | MapFlag::RequireCoherent;
        let alloc = map_flags_to_alloc(flags);
        assert!(alloc.contains(AllocationCreate::Mapped));
        assert!(alloc.contains(AllocationCreate::RequireCoherent));
        assert!(!alloc.contains(AllocationCreate::HostAccessRandom));
        assert_eq!(alloc_flags_to_map(alloc), flags);
    }
}
