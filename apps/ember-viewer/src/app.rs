//! Viewer application.

use ash::vk;
use ember_app::{AppContext, EmberApp, FrameContext};
use ember_gpu::{GpuImage, LayoutTransition};
use gpu_allocator::MemoryLocation;
use tracing::{info, warn};

const TEXTURE_SIZE: u32 = 64;
const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Clears the swapchain with a slowly cycling color.
pub struct Viewer {
    render_pass: vk::RenderPass,
    texture: Option<GpuImage>,
    elapsed: f32,
}

impl EmberApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let render_pass = unsafe {
            create_render_pass(ctx.device(), ctx.render.image_format(), ctx.render.depth_format())?
        };

        // SAFETY: The render pass matches the swapchain color and depth formats
        if let Err(e) = unsafe { ctx.render.attach_render_pass(render_pass) } {
            unsafe { ctx.device().destroy_render_pass(render_pass, None) };
            return Err(e.into());
        }

        let texture = match upload_texture(ctx) {
            Ok(texture) => Some(texture),
            Err(e) => {
                warn!("Startup texture upload failed: {e:#}");
                None
            }
        };

        info!(
            "Viewer initialized: {}x{}, color {:?}, depth {:?}",
            ctx.width(),
            ctx.height(),
            ctx.render.image_format(),
            ctx.render.depth_format()
        );

        Ok(Self {
            render_pass,
            texture,
            elapsed: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.elapsed += dt;
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let framebuffer = frame
            .framebuffer
            .ok_or_else(|| anyhow::anyhow!("No framebuffer for image {}", frame.image_index))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color(self.elapsed),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(frame.render_area())
            .clear_values(&clear_values);

        // SAFETY: The command buffer is recording and the framebuffer belongs
        // to the acquired image
        unsafe {
            ctx.device().cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
            ctx.device().cmd_end_render_pass(frame.command_buffer);
        }

        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(mut texture) = self.texture.take() {
            if let Err(e) = ctx.render.context().allocator().lock().free_image(&mut texture) {
                warn!("Failed to free texture: {e}");
            }
        }

        if let Err(e) = ctx.render.detach_render_pass() {
            warn!("Failed to detach render pass: {e}");
        }
        // SAFETY: The device is idle and no framebuffer references the pass
        unsafe { ctx.device().destroy_render_pass(self.render_pass, None) };
    }
}

/// Color cycling through hues over time.
pub fn clear_color(t: f32) -> [f32; 4] {
    let phase = |offset: f32| 0.5 + 0.5 * (t * 0.5 + offset).sin();
    [
        phase(0.0),
        phase(std::f32::consts::TAU / 3.0),
        phase(2.0 * std::f32::consts::TAU / 3.0),
        1.0,
    ]
}

/// Color attachment presented at the end, plus a transient depth attachment.
///
/// # Safety
/// The device must be valid.
unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> anyhow::Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref)];

    // Acquire waits at color output; order the attachment writes after it
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    // SAFETY: Caller guarantees the device is valid
    Ok(unsafe { device.create_render_pass(&create_info, None)? })
}

/// Create a small sampled image, clear it on the GPU and leave it ready for
/// shader reads.
fn upload_texture(ctx: &AppContext) -> anyhow::Result<GpuImage> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(TEXTURE_FORMAT)
        .extent(vk::Extent3D {
            width: TEXTURE_SIZE,
            height: TEXTURE_SIZE,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let allocator = ctx.render.context().allocator();
    let mut texture = allocator
        .lock()
        .create_image(&create_info, MemoryLocation::GpuOnly, "viewer texture")?;

    if let Err(e) = record_upload(ctx, &texture) {
        let _ = allocator.lock().free_image(&mut texture);
        return Err(e);
    }

    info!("Uploaded {TEXTURE_SIZE}x{TEXTURE_SIZE} startup texture");
    Ok(texture)
}

fn record_upload(ctx: &AppContext, texture: &GpuImage) -> anyhow::Result<()> {
    let image = texture.image;

    // SAFETY: The image was just created on this device
    unsafe {
        ctx.render.transition_image_layout(
            image,
            TEXTURE_FORMAT,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
    }

    let to_shader_read = LayoutTransition::resolve(
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;

    let clear = vk::ClearColorValue {
        float32: [0.9, 0.4, 0.1, 1.0],
    };
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);

    ctx.render.execute_one_shot(|device, cmd| {
        // SAFETY: The command buffer is recording and the image is in
        // TRANSFER_DST_OPTIMAL
        unsafe {
            device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                std::slice::from_ref(&range),
            );
            to_shader_read.record(device, cmd, image, TEXTURE_FORMAT);
        }
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn clear_color_stays_in_range() {
        for step in 0..100 {
            let color = clear_color(step as f32 * 0.37);
            for channel in color {
                assert!((0.0..=1.0).contains(&channel));
            }
            assert_relative_eq!(color[3], 1.0);
        }
    }

    #[test]
    fn clear_color_starts_mid_red() {
        let color = clear_color(0.0);
        assert_relative_eq!(color[0], 0.5);
        assert_relative_eq!(color[1], 0.5 + 0.5 * (std::f32::consts::TAU / 3.0).sin());
    }
}
