//! Minimal frame-loop application exercising the Glint RHI: device setup,
//! a staged vertex upload, and the acquire/present/recreate cycle.

use std::sync::Arc;

use anyhow::Context;
use glint_core::cli::LaunchArgs;
use glint_core::log;
use glint_rhi::{
    Buffer, DeviceAllocator, DeviceBundle, DeviceDesc, PresentationSurface,
    PresentationSurfaceBuilder, QueueHandle, RhiCore, RhiError, RuntimeScope, StagedBuffer,
    SurfaceWindow, select_physical_device, vk,
};
use raw_window_handle::HasDisplayHandle;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

struct Renderer {
    // Field order matters for drop: the surface and queues must go before
    // the scope releases the device.
    surface: PresentationSurface,
    graphics_queue: QueueHandle,
    present_queue: QueueHandle,
    _vertex_buffer: Buffer,
    scope: RuntimeScope,
    _core: RhiCore,
}

impl Renderer {
    fn new(window: Arc<Window>) -> anyhow::Result<Self> {
        let core = RhiCore::new(window.display_handle()?.as_raw())?;
        let surface_window = SurfaceWindow::new(window, &core)?;

        let physical_device = select_physical_device(core.instance(), &surface_window)?;
        let device = DeviceBundle::new(core.instance(), &physical_device, &DeviceDesc::default())?;
        let allocator = DeviceAllocator::new(&device);

        let mut graphics_queue = device.graphics_queue();
        let present_queue = device.present_queue();

        // One-time staged upload, then drop the staging area.
        let pattern: Vec<u8> = (0..64u8).collect();
        let mut staged =
            StagedBuffer::new(&allocator, 64, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        staged.upload_now_with(&pattern, &mut graphics_queue)?;
        let vertex_buffer = staged.drop_stage();

        let surface = PresentationSurfaceBuilder::new(&core, &device)
            .allocator(allocator.clone())
            .title("glint sandbox")
            .with_depth_buffer(true)
            .build_with(surface_window, false)?;

        let mut scope = RuntimeScope::new();
        scope.set_allocator(allocator);
        scope.set_graphics_queue(graphics_queue.clone());
        scope.set_present_queue(present_queue.clone());
        scope.set_device(device);

        Ok(Self {
            surface,
            graphics_queue,
            present_queue,
            _vertex_buffer: vertex_buffer,
            scope,
            _core: core,
        })
    }

    #[profiling::function]
    fn draw(&mut self) -> anyhow::Result<()> {
        let extent = self.surface.extent();
        if extent.width == 0 || extent.height == 0 {
            return Ok(());
        }

        let bundle = match self.surface.acquire_next_frame_bundle() {
            Ok(bundle) => bundle,
            Err(RhiError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                self.surface.recreate_render_resources()?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let device = self
            .scope
            .device()
            .context("runtime scope has no device")?
            .handle()
            .clone();
        let image = self.surface.images()[bundle.image_index as usize];

        let cmd = self.graphics_queue.begin_single_submit(None)?;
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };

        self.graphics_queue.end_single_submit(
            cmd,
            bundle.in_flight_fence,
            &[bundle.acquire_semaphore],
            &[vk::PipelineStageFlags::TOP_OF_PIPE],
            &[bundle.render_semaphore],
        )?;

        let present_result = self
            .surface
            .submit_next_frame_bundle(&self.present_queue, &bundle);

        // Bound the frame before releasing the transient commands.
        unsafe { device.wait_for_fences(&[bundle.in_flight_fence], true, u64::MAX)? };
        self.graphics_queue.signal_single_submit_complete();

        match present_result {
            Ok(()) => {}
            Err(RhiError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                self.surface.recreate_render_resources()?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if self.surface.is_suboptimal() {
            self.surface.recreate_render_resources()?;
        }
        Ok(())
    }
}

struct Sandbox {
    args: LaunchArgs,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
}

impl ApplicationHandler for Sandbox {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let attributes = Window::default_attributes()
            .with_title("glint sandbox")
            .with_inner_size(LogicalSize::new(self.args.width, self.args.height));

        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("window creation failed: {err}");
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(window.clone()) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window.clone());
                window.request_redraw();
            }
            Err(err) => {
                log::error!("renderer setup failed: {err:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    if let Some(renderer) = self.renderer.as_mut() {
                        if let Err(err) = renderer.surface.recreate_render_resources() {
                            log::error!("swapchain recreation failed: {err}");
                            event_loop.exit();
                        }
                    }
                }
            }
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(err) = renderer.draw() {
                        log::error!("frame failed: {err:#}");
                        event_loop.exit();
                        return;
                    }
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
                profiling::finish_frame!();
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = LaunchArgs::parse_args();
    log::initialize(args.log_level.into())?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = Sandbox {
        args,
        window: None,
        renderer: None,
    };
    event_loop.run_app(&mut app)?;
    Ok(())
}
