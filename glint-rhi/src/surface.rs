//! Vulkan Surface - presentation surface, swapchain, and frame protocol.

use std::sync::Arc;

use ash::{Device, Instance, vk};
use glint_core::log;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use crate::alloc::{Allocation, AllocationCreateInfo, DeviceAllocator};
use crate::core::RhiCore;
use crate::device::DeviceBundle;
use crate::error::{RhiError, RhiResult};
use crate::queue::QueueHandle;

/// Default bound on the in-flight fence wait before frame acquisition.
pub const DEFAULT_IN_FLIGHT_TIMEOUT_NS: u64 = 3_000_000_000;

/// Universally-supported fallback when a preferred depth format is not.
const FALLBACK_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// A native window and the drawable surface created on it.
pub struct SurfaceWindow {
    window: Arc<Window>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Drop for SurfaceWindow {
    fn drop(&mut self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

impl SurfaceWindow {
    pub fn new(window: Arc<Window>, core: &RhiCore) -> RhiResult<Self> {
        let display_handle = window
            .display_handle()
            .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?
            .as_raw();

        let surface_loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        let surface = unsafe {
            ash_window::create_surface(
                core.entry(),
                core.instance(),
                display_handle,
                window_handle,
                None,
            )?
        };

        Ok(Self {
            window,
            surface_loader,
            surface,
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

/// Per-frame synchronization handed out by
/// [`PresentationSurface::acquire_next_frame_bundle`].
#[derive(Clone, Copy, Debug)]
pub struct FrameBundle {
    pub image_index: u32,
    pub acquire_semaphore: vk::Semaphore,
    pub render_semaphore: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

/// An allocator-backed image attachment (depth or multisample color).
struct AttachmentImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
}

impl AttachmentImage {
    fn destroy(mut self, device: &Device, allocator: &DeviceAllocator) {
        unsafe { device.destroy_image_view(self.view, None) };
        allocator.destroy_image(self.image, &mut self.allocation);
    }
}

/// Presentation surface: window surface, swapchain, per-image
/// synchronization, and optional depth/multisample attachments.
///
/// Per-image views, acquire/render semaphores, and in-flight fences are
/// created and destroyed together as one unit; the frame index advances
/// modulo the image count.
pub struct PresentationSurface {
    instance: Instance,
    device: Device,
    physical_device: vk::PhysicalDevice,
    allocator: Option<DeviceAllocator>,
    samples: vk::SampleCountFlags,

    window: Option<SurfaceWindow>,

    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    swapchain_info: vk::SwapchainCreateInfoKHR<'static>,

    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    acquire_semaphores: Vec<vk::Semaphore>,
    render_semaphores: Vec<vk::Semaphore>,
    in_flight_fences: Vec<vk::Fence>,

    current_frame: usize,
    suboptimal: bool,
    in_flight_timeout_ns: u64,

    depth_info: Option<vk::ImageCreateInfo<'static>>,
    depth: Option<AttachmentImage>,
    multisample_info: Option<vk::ImageCreateInfo<'static>>,
    multisample: Option<AttachmentImage>,
}

impl PresentationSurface {
    /// A surface with no window yet; see
    /// [`open_window_and_surface`](Self::open_window_and_surface).
    pub fn new(
        core: &RhiCore,
        device: &DeviceBundle,
        allocator: Option<DeviceAllocator>,
        samples: vk::SampleCountFlags,
    ) -> Self {
        let swapchain_loader =
            ash::khr::swapchain::Device::new(core.instance(), device.handle());

        Self {
            instance: core.instance().clone(),
            device: device.handle().clone(),
            physical_device: device.physical_device().handle(),
            allocator,
            samples,
            window: None,
            swapchain_loader,
            swapchain: vk::SwapchainKHR::null(),
            swapchain_info: vk::SwapchainCreateInfoKHR::default(),
            images: Vec::new(),
            views: Vec::new(),
            acquire_semaphores: Vec::new(),
            render_semaphores: Vec::new(),
            in_flight_fences: Vec::new(),
            current_frame: 0,
            suboptimal: false,
            in_flight_timeout_ns: DEFAULT_IN_FLIGHT_TIMEOUT_NS,
            depth_info: None,
            depth: None,
            multisample_info: None,
            multisample: None,
        }
    }

    /// Attach the native window and create its drawable surface. No-op if a
    /// window is already open.
    pub fn open_window_and_surface(
        &mut self,
        core: &RhiCore,
        window: Arc<Window>,
    ) -> RhiResult<()> {
        if self.window.is_some() {
            return Ok(());
        }
        self.window = Some(SurfaceWindow::new(window, core)?);
        Ok(())
    }

    /// Adopt an already-created window surface (for example the one used
    /// during adapter selection). No-op if a window is already open.
    pub fn adopt_window_and_surface(&mut self, window: SurfaceWindow) {
        if self.window.is_none() {
            self.window = Some(window);
        }
    }

    /// Derive (or refresh) the stored swapchain creation parameters from
    /// current surface state.
    ///
    /// Unsupported preferences fall back with a diagnostic: format to the
    /// first reported format, present mode to FIFO. The image count is
    /// clamped into the surface's supported range. With `reset == false`
    /// only extent, format, color space, and image count are refreshed,
    /// preserving other caller customizations to the stored parameters.
    pub fn populate_swapchain_info(
        &mut self,
        preferred_format: vk::SurfaceFormatKHR,
        preferred_present_mode: vk::PresentModeKHR,
        preferred_len: u32,
        reset: bool,
    ) -> RhiResult<()> {
        let window = self
            .window
            .as_ref()
            .ok_or(RhiError::InvalidResource("surface has no window"))?;

        let capabilities = unsafe {
            window
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, window.surface)?
        };
        let formats = unsafe {
            window
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, window.surface)?
        };
        let present_modes = unsafe {
            window
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, window.surface)?
        };

        let format = choose_surface_format(&formats, preferred_format)?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        let extent = clamp_swapchain_extent(&capabilities, window.framebuffer_extent());
        let image_count = clamp_image_count(&capabilities, preferred_len);

        if reset {
            self.swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(window.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);
        } else {
            self.swapchain_info.min_image_count = image_count;
            self.swapchain_info.image_format = format.format;
            self.swapchain_info.image_color_space = format.color_space;
            self.swapchain_info.image_extent = extent;
        }

        Ok(())
    }

    /// Create (or recreate) the swapchain and its per-image resource unit
    /// from the stored creation parameters.
    ///
    /// A prior swapchain is passed as the old-swapchain hint and destroyed
    /// immediately after the new one exists.
    #[profiling::function]
    pub fn create_swapchain(&mut self) -> RhiResult<()> {
        if self.window.is_none() || self.swapchain_info.surface == vk::SurfaceKHR::null() {
            return Err(RhiError::InvalidResource(
                "swapchain parameters have not been populated",
            ));
        }

        self.destroy_per_image_resources();

        let old_swapchain = self.swapchain;
        let create_info = self.swapchain_info.old_swapchain(old_swapchain);

        log::info!(
            "creating swapchain: {:?} {:?}, {}x{}, {} images, {:?}",
            create_info.image_format,
            create_info.image_color_space,
            create_info.image_extent.width,
            create_info.image_extent.height,
            create_info.min_image_count,
            create_info.present_mode
        );

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.swapchain_info = self.swapchain_info.old_swapchain(vk::SwapchainKHR::null());

        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        let mut views = Vec::with_capacity(images.len());
        for image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.swapchain_info.image_format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            views.push(unsafe { self.device.create_image_view(&view_info, None)? });
        }

        let mut acquire_semaphores = Vec::with_capacity(images.len());
        let mut render_semaphores = Vec::with_capacity(images.len());
        let mut in_flight_fences = Vec::with_capacity(images.len());

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info =
            vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..images.len() {
            unsafe {
                acquire_semaphores.push(self.device.create_semaphore(&semaphore_info, None)?);
                render_semaphores.push(self.device.create_semaphore(&semaphore_info, None)?);
                in_flight_fences.push(self.device.create_fence(&fence_info, None)?);
            }
        }

        self.images = images;
        self.views = views;
        self.acquire_semaphores = acquire_semaphores;
        self.render_semaphores = render_semaphores;
        self.in_flight_fences = in_flight_fences;
        self.current_frame = 0;
        self.suboptimal = false;

        Ok(())
    }

    /// Derive depth-attachment creation parameters from the current
    /// swapchain extent, falling back across tiling modes and finally to a
    /// universally-supported format.
    pub fn populate_depth_info(&mut self, preferred_format: vk::Format) -> RhiResult<()> {
        if self.swapchain_info.surface == vk::SurfaceKHR::null() {
            return Err(RhiError::InvalidResource(
                "swapchain parameters have not been populated",
            ));
        }

        let (format, tiling) = pick_depth_format(
            |format| unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            },
            preferred_format,
        );

        let extent = self.swapchain_info.image_extent;
        self.depth_info = Some(
            vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(self.samples)
                .tiling(tiling)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED),
        );
        Ok(())
    }

    /// Derive multisample color-attachment parameters mirroring the
    /// swapchain's format and extent.
    pub fn populate_multisample_info(&mut self) -> RhiResult<()> {
        if self.swapchain_info.surface == vk::SurfaceKHR::null() {
            return Err(RhiError::InvalidResource(
                "swapchain parameters have not been populated",
            ));
        }

        let extent = self.swapchain_info.image_extent;
        self.multisample_info = Some(
            vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(self.swapchain_info.image_format)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(self.samples)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                )
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED),
        );
        Ok(())
    }

    /// Allocate the depth attachment and its view. Requires the surface to
    /// have been configured for depth.
    pub fn create_depth_buffer(&mut self) -> RhiResult<()> {
        let info = self.depth_info.ok_or_else(|| {
            RhiError::Usage("surface was not configured with a depth attachment".into())
        })?;
        let allocator = self.allocator.clone().ok_or_else(|| {
            RhiError::Usage("depth attachment requires an allocator".into())
        })?;

        if let Some(old) = self.depth.take() {
            old.destroy(&self.device, &allocator);
        }

        let (image, allocation) =
            allocator.create_image(&info, &AllocationCreateInfo::device_local())?;
        let view = self.create_attachment_view(image, info.format, depth_aspect(info.format))?;

        self.depth = Some(AttachmentImage {
            image,
            view,
            allocation,
        });
        Ok(())
    }

    /// Allocate the multisample color attachment and its view. Requires the
    /// surface to have been configured for multisampling.
    pub fn create_multisample_color_image(&mut self) -> RhiResult<()> {
        let info = self.multisample_info.ok_or_else(|| {
            RhiError::Usage("surface was not configured for multisampling".into())
        })?;
        let allocator = self.allocator.clone().ok_or_else(|| {
            RhiError::Usage("multisample attachment requires an allocator".into())
        })?;

        if let Some(old) = self.multisample.take() {
            old.destroy(&self.device, &allocator);
        }

        let (image, allocation) =
            allocator.create_image(&info, &AllocationCreateInfo::device_local())?;
        let view =
            self.create_attachment_view(image, info.format, vk::ImageAspectFlags::COLOR)?;

        self.multisample = Some(AttachmentImage {
            image,
            view,
            allocation,
        });
        Ok(())
    }

    /// Wait on the current slot's in-flight fence, acquire the next image,
    /// and hand out its synchronization bundle.
    ///
    /// A suboptimal acquire sets the surface flag but still succeeds. On
    /// failure nothing advances. On success the slot's fence is reset and
    /// the frame index advances modulo the image count.
    #[profiling::function]
    pub fn acquire_next_frame_bundle(&mut self) -> RhiResult<FrameBundle> {
        self.acquire_next_frame_bundle_with(self.in_flight_timeout_ns, vk::Fence::null())
    }

    /// `timeout_ns` bounds only the image acquisition; the in-flight fence
    /// wait is bounded by the configured surface timeout.
    pub fn acquire_next_frame_bundle_with(
        &mut self,
        timeout_ns: u64,
        acquire_fence: vk::Fence,
    ) -> RhiResult<FrameBundle> {
        if self.swapchain == vk::SwapchainKHR::null() {
            return Err(RhiError::InvalidResource("surface has no swapchain"));
        }

        let slot = self.current_frame;
        let in_flight_fence = self.in_flight_fences[slot];
        let acquire_semaphore = self.acquire_semaphores[slot];
        let render_semaphore = self.render_semaphores[slot];

        match unsafe {
            self.device
                .wait_for_fences(&[in_flight_fence], true, self.in_flight_timeout_ns)
        } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return Err(RhiError::Timeout(self.in_flight_timeout_ns)),
            Err(err) => return Err(err.into()),
        }

        let (image_index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                acquire_semaphore,
                acquire_fence,
            )?
        };
        if suboptimal {
            self.suboptimal = true;
        }

        unsafe { self.device.reset_fences(&[in_flight_fence])? };
        self.current_frame = next_frame_index(self.current_frame, self.images.len());

        Ok(FrameBundle {
            image_index,
            acquire_semaphore,
            render_semaphore,
            in_flight_fence,
        })
    }

    /// Present the bundle's image, waiting on its render semaphore.
    ///
    /// Only the bundle handed out by the most recent acquire may be
    /// presented; anything else is a usage error. A suboptimal present sets
    /// the flag and reports success; out-of-date or any other failure is
    /// returned as an error with no side effects beyond the flag.
    #[profiling::function]
    pub fn submit_next_frame_bundle(
        &mut self,
        present_queue: &QueueHandle,
        bundle: &FrameBundle,
    ) -> RhiResult<()> {
        if self.swapchain == vk::SwapchainKHR::null() {
            return Err(RhiError::InvalidResource("surface has no swapchain"));
        }
        if !bundle_precedes_frame(bundle.image_index, self.images.len(), self.current_frame) {
            return Err(RhiError::Usage(
                "frame bundle is not the one most recently acquired".into(),
            ));
        }

        let swapchains = [self.swapchain];
        let image_indices = [bundle.image_index];
        let wait_semaphores = [bundle.render_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        if let Some(window) = &self.window {
            window.window.pre_present_notify();
        }

        let result = unsafe {
            self.swapchain_loader
                .queue_present(present_queue.handle(), &present_info)
        };

        match result {
            Ok(true) => {
                self.suboptimal = true;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => {
                if err == vk::Result::ERROR_OUT_OF_DATE_KHR {
                    self.suboptimal = true;
                }
                Err(err.into())
            }
        }
    }

    /// Rebuild the swapchain and configured attachments after invalidation
    /// or resize. The old swapchain handle is kept alive for recycling.
    #[profiling::function]
    pub fn recreate_render_resources(&mut self) -> RhiResult<()> {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        self.destroy_attachments();
        self.destroy_per_image_resources();

        let format = vk::SurfaceFormatKHR {
            format: self.swapchain_info.image_format,
            color_space: self.swapchain_info.image_color_space,
        };
        let present_mode = self.swapchain_info.present_mode;
        let image_count = self.swapchain_info.min_image_count;
        self.populate_swapchain_info(format, present_mode, image_count, false)?;

        self.create_swapchain()?;

        if let Some(info) = self.depth_info {
            self.populate_depth_info(info.format)?;
            self.create_depth_buffer()?;
        }
        if self.multisample_info.is_some() {
            self.populate_multisample_info()?;
            self.create_multisample_color_image()?;
        }

        Ok(())
    }

    /// Tear down in dependency order: multisample attachment, depth
    /// attachment, swapchain and its per-image unit, then surface and
    /// window. Safe to call repeatedly and on partially-constructed
    /// surfaces.
    pub fn close(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        self.destroy_attachments();
        self.destroy_per_image_resources();

        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.swapchain = vk::SwapchainKHR::null();
        }

        self.depth_info = None;
        self.multisample_info = None;
        self.swapchain_info = vk::SwapchainCreateInfoKHR::default();
        self.window = None;
    }

    pub fn window(&self) -> Option<&SurfaceWindow> {
        self.window.as_ref()
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn acquire_semaphores(&self) -> &[vk::Semaphore] {
        &self.acquire_semaphores
    }

    pub fn render_semaphores(&self) -> &[vk::Semaphore] {
        &self.render_semaphores
    }

    pub fn in_flight_fences(&self) -> &[vk::Fence] {
        &self.in_flight_fences
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain_info.image_extent
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain_info.image_format
    }

    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }

    pub fn in_flight_timeout(&self) -> u64 {
        self.in_flight_timeout_ns
    }

    pub fn set_in_flight_timeout(&mut self, timeout_ns: u64) {
        self.in_flight_timeout_ns = timeout_ns;
    }

    /// Stored swapchain creation parameters.
    pub fn swapchain_info(&self) -> &vk::SwapchainCreateInfoKHR<'static> {
        &self.swapchain_info
    }

    /// Mutable access for customizations that
    /// [`populate_swapchain_info`](Self::populate_swapchain_info) preserves
    /// when `reset == false`.
    pub fn swapchain_info_mut(&mut self) -> &mut vk::SwapchainCreateInfoKHR<'static> {
        &mut self.swapchain_info
    }

    pub fn depth_info_mut(&mut self) -> Option<&mut vk::ImageCreateInfo<'static>> {
        self.depth_info.as_mut()
    }

    pub fn multisample_info_mut(&mut self) -> Option<&mut vk::ImageCreateInfo<'static>> {
        self.multisample_info.as_mut()
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|a| a.view)
    }

    pub fn multisample_view(&self) -> Option<vk::ImageView> {
        self.multisample.as_ref().map(|a| a.view)
    }

    fn create_attachment_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&view_info, None)? })
    }

    /// Destroy the per-image unit (views, semaphores, fences) as a whole,
    /// keeping the swapchain handle for recycling.
    fn destroy_per_image_resources(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            for semaphore in self.acquire_semaphores.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for semaphore in self.render_semaphores.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for fence in self.in_flight_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }
        }
        self.images.clear();
        self.current_frame = 0;
    }

    fn destroy_attachments(&mut self) {
        if let Some(allocator) = self.allocator.clone() {
            if let Some(multisample) = self.multisample.take() {
                multisample.destroy(&self.device, &allocator);
            }
            if let Some(depth) = self.depth.take() {
                depth.destroy(&self.device, &allocator);
            }
        }
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        self.close();
    }
}

/// Assembles the optional parameters of a [`PresentationSurface`] and
/// validates their combination before any GPU object exists.
pub struct PresentationSurfaceBuilder<'a> {
    core: &'a RhiCore,
    device: &'a DeviceBundle,
    allocator: Option<DeviceAllocator>,

    title: Option<String>,
    dimensions: Option<(u32, u32)>,
    with_depth_buffer: bool,
    samples: vk::SampleCountFlags,
    preferred_swapchain_length: u32,
    preferred_present_mode: vk::PresentModeKHR,
    preferred_surface_format: vk::SurfaceFormatKHR,
    preferred_depth_format: vk::Format,
    in_flight_timeout_ns: u64,
}

impl<'a> PresentationSurfaceBuilder<'a> {
    pub fn new(core: &'a RhiCore, device: &'a DeviceBundle) -> Self {
        Self {
            core,
            device,
            allocator: None,
            title: None,
            dimensions: None,
            with_depth_buffer: false,
            samples: vk::SampleCountFlags::TYPE_1,
            preferred_swapchain_length: 2,
            preferred_present_mode: vk::PresentModeKHR::FIFO,
            preferred_surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            preferred_depth_format: vk::Format::D24_UNORM_S8_UINT,
            in_flight_timeout_ns: DEFAULT_IN_FLIGHT_TIMEOUT_NS,
        }
    }

    /// Required when a depth buffer or multisampling is requested.
    pub fn allocator(mut self, allocator: DeviceAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    pub fn with_depth_buffer(mut self, enable: bool) -> Self {
        self.with_depth_buffer = enable;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn swapchain_length(mut self, length: u32) -> Self {
        self.preferred_swapchain_length = length;
        self
    }

    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.preferred_present_mode = mode;
        self
    }

    pub fn surface_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.preferred_surface_format = format;
        self
    }

    pub fn depth_format(mut self, format: vk::Format) -> Self {
        self.preferred_depth_format = format;
        self
    }

    pub fn in_flight_timeout(mut self, timeout_ns: u64) -> Self {
        self.in_flight_timeout_ns = timeout_ns;
        self
    }

    fn multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    /// Non-failing readiness check; problems are logged as warnings.
    pub fn is_build_ready(&self) -> bool {
        let mut ready = true;
        if (self.with_depth_buffer || self.multisampled()) && self.allocator.is_none() {
            log::warn!("surface builder: depth/multisample attachments require an allocator");
            ready = false;
        }
        if self.preferred_swapchain_length == 0 {
            log::warn!("surface builder: swapchain length of zero requested");
            ready = false;
        }
        ready
    }

    /// Create the surface on `window`.
    ///
    /// With `defer_render_resources` the swapchain parameters are populated
    /// but no swapchain or attachment is created; the caller runs
    /// `create_swapchain` (and attachment creation) later.
    pub fn build(
        self,
        window: Arc<Window>,
        defer_render_resources: bool,
    ) -> RhiResult<PresentationSurface> {
        let surface_window = SurfaceWindow::new(window, self.core)?;
        self.build_with(surface_window, defer_render_resources)
    }

    /// Like [`build`](Self::build), reusing a surface already created on the
    /// window (typically the one used for adapter selection).
    pub fn build_with(
        self,
        surface_window: SurfaceWindow,
        defer_render_resources: bool,
    ) -> RhiResult<PresentationSurface> {
        if !self.is_build_ready() {
            return Err(RhiError::Usage(
                "presentation surface builder is not build-ready".into(),
            ));
        }

        let window = surface_window.window();
        if let Some(title) = &self.title {
            window.set_title(title);
        }
        if let Some((width, height)) = self.dimensions {
            let _ = window.request_inner_size(winit::dpi::PhysicalSize::new(width, height));
        }

        let mut surface = PresentationSurface::new(
            self.core,
            self.device,
            self.allocator.clone(),
            self.samples,
        );
        surface.set_in_flight_timeout(self.in_flight_timeout_ns);
        surface.adopt_window_and_surface(surface_window);
        surface.populate_swapchain_info(
            self.preferred_surface_format,
            self.preferred_present_mode,
            self.preferred_swapchain_length,
            true,
        )?;

        if self.with_depth_buffer {
            surface.populate_depth_info(self.preferred_depth_format)?;
        }
        if self.multisampled() {
            surface.populate_multisample_info()?;
        }

        if !defer_render_resources {
            surface.create_swapchain()?;
            if self.with_depth_buffer {
                surface.create_depth_buffer()?;
            }
            if self.multisampled() {
                surface.create_multisample_color_image()?;
            }
        }

        Ok(surface)
    }
}

/// Pick the preferred surface format, falling back (with a diagnostic) to
/// the first reported one. A surface with no formats is a hard error.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> RhiResult<vk::SurfaceFormatKHR> {
    let Some(first) = formats.first() else {
        return Err(RhiError::NoSurfaceFormats);
    };

    match formats
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
    {
        Some(found) => Ok(*found),
        None => {
            log::warn!(
                "surface format {:?}/{:?} unsupported, using {:?}/{:?}",
                preferred.format,
                preferred.color_space,
                first.format,
                first.color_space
            );
            Ok(*first)
        }
    }
}

/// Pick the preferred present mode, falling back to FIFO (always available).
fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        log::warn!("present mode {:?} unsupported, using FIFO", preferred);
        vk::PresentModeKHR::FIFO
    }
}

/// Drawable extent: the surface's current extent when well-defined,
/// otherwise the framebuffer size clamped to the supported range.
fn clamp_swapchain_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: framebuffer_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Clamp the requested image count into `[min, max(min, max)]`; a reported
/// max of zero means unbounded.
fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, preferred: u32) -> u32 {
    let mut count = preferred.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count = count.min(
            capabilities
                .max_image_count
                .max(capabilities.min_image_count),
        );
    }
    count
}

/// Two-step depth format fallback: preferred with optimal tiling, preferred
/// with linear tiling, then the universal fallback format.
fn pick_depth_format(
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
    preferred: vk::Format,
) -> (vk::Format, vk::ImageTiling) {
    let props = format_properties(preferred);
    if props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    {
        return (preferred, vk::ImageTiling::OPTIMAL);
    }

    log::warn!(
        "depth format {:?} unsupported with optimal tiling, trying linear",
        preferred
    );
    if props
        .linear_tiling_features
        .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    {
        return (preferred, vk::ImageTiling::LINEAR);
    }

    log::warn!(
        "depth format {:?} unsupported with linear tiling, using {:?}",
        preferred,
        FALLBACK_DEPTH_FORMAT
    );
    (FALLBACK_DEPTH_FORMAT, vk::ImageTiling::OPTIMAL)
}

/// Advance the cyclic frame slot; the image count is never zero while a
/// swapchain exists.
fn next_frame_index(current: usize, image_count: usize) -> usize {
    (current + 1) % image_count
}

/// The most recently acquired bundle is the one whose image index sits one
/// slot behind the cyclic frame counter.
fn bundle_precedes_frame(image_index: u32, image_count: usize, next_frame: usize) -> bool {
    image_count > 0 && (image_index as usize + 1) % image_count == next_frame
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        min_count: u32,
        max_count: u32,
        current: Option<vk::Extent2D>,
        min_extent: vk::Extent2D,
        max_extent: vk::Extent2D,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: current.unwrap_or(vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            }),
            min_image_extent: min_extent,
            max_image_extent: max_extent,
            ..Default::default()
        }
    }

    const SRGB: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    const UNORM: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[test]
    fn image_count_respects_surface_minimum() {
        let caps = capabilities(
            3,
            8,
            None,
            vk::Extent2D::default(),
            vk::Extent2D::default(),
        );
        assert_eq!(clamp_image_count(&caps, 2), 3);
    }

    #[test]
    fn image_count_respects_surface_maximum() {
        let caps = capabilities(
            2,
            3,
            None,
            vk::Extent2D::default(),
            vk::Extent2D::default(),
        );
        assert_eq!(clamp_image_count(&caps, 10), 3);
    }

    #[test]
    fn image_count_unbounded_when_max_is_zero() {
        let caps = capabilities(
            2,
            0,
            None,
            vk::Extent2D::default(),
            vk::Extent2D::default(),
        );
        assert_eq!(clamp_image_count(&caps, 16), 16);
    }

    #[test]
    fn extent_uses_current_when_defined() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let caps = capabilities(
            2,
            0,
            Some(current),
            vk::Extent2D::default(),
            vk::Extent2D::default(),
        );
        let requested = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        assert_eq!(clamp_swapchain_extent(&caps, requested), current);
    }

    #[test]
    fn extent_clamps_framebuffer_size_when_undefined() {
        let caps = capabilities(
            2,
            0,
            None,
            vk::Extent2D {
                width: 100,
                height: 100,
            },
            vk::Extent2D {
                width: 500,
                height: 500,
            },
        );
        let clamped = clamp_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 50,
                height: 900,
            },
        );
        assert_eq!(clamped.width, 100);
        assert_eq!(clamped.height, 500);
    }

    #[test]
    fn surface_format_prefers_exact_match() {
        let formats = [UNORM, SRGB];
        assert_eq!(choose_surface_format(&formats, SRGB).unwrap(), SRGB);
    }

    #[test]
    fn surface_format_falls_back_to_first_reported() {
        let formats = [UNORM];
        assert_eq!(choose_surface_format(&formats, SRGB).unwrap(), UNORM);
    }

    #[test]
    fn empty_format_list_is_a_hard_error() {
        assert!(matches!(
            choose_surface_format(&[], SRGB),
            Err(RhiError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn depth_format_ladder_optimal_linear_fallback() {
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;

        let optimal = |_: vk::Format| vk::FormatProperties {
            optimal_tiling_features: depth,
            ..Default::default()
        };
        assert_eq!(
            pick_depth_format(optimal, vk::Format::D24_UNORM_S8_UINT),
            (vk::Format::D24_UNORM_S8_UINT, vk::ImageTiling::OPTIMAL)
        );

        let linear_only = |_: vk::Format| vk::FormatProperties {
            linear_tiling_features: depth,
            ..Default::default()
        };
        assert_eq!(
            pick_depth_format(linear_only, vk::Format::D24_UNORM_S8_UINT),
            (vk::Format::D24_UNORM_S8_UINT, vk::ImageTiling::LINEAR)
        );

        let unsupported = |_: vk::Format| vk::FormatProperties::default();
        assert_eq!(
            pick_depth_format(unsupported, vk::Format::D24_UNORM_S8_UINT),
            (FALLBACK_DEPTH_FORMAT, vk::ImageTiling::OPTIMAL)
        );
    }

    #[test]
    fn present_accepts_only_the_bundle_just_acquired() {
        // Acquiring image 0 of 3 leaves the frame counter at 1.
        assert!(bundle_precedes_frame(0, 3, 1));
        // Wraparound: image 2 of 3 leaves the counter back at 0.
        assert!(bundle_precedes_frame(2, 3, 0));

        assert!(!bundle_precedes_frame(0, 3, 2));
        assert!(!bundle_precedes_frame(1, 3, 1));
        assert!(!bundle_precedes_frame(0, 0, 0));
    }

    #[test]
    fn frame_index_cycles_through_every_slot() {
        let mut index = 0;
        let mut visited = Vec::new();
        for _ in 0..3 {
            visited.push(index);
            index = next_frame_index(index, 3);
        }
        assert_eq!(visited, vec![0, 1, 2]);
        assert_eq!(index, 0);
    }

    #[test]
    fn depth_aspect_includes_stencil_for_combined_formats() {
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
    }
}
