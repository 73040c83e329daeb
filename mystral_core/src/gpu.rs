//! WebGPU context.
//!
//! Bridges a platform surface (or an offscreen color texture) into a
//! swapchain-style render target. Two init modes: *windowed* builds a
//! surface from the raw native handles the platform layer produced;
//! *headless* renders into an offscreen texture of the requested size.
//! Per frame the host acquires the current target, the frame's passes
//! execute, and the target presents. The scripts' own passes come from the
//! external bindings layer; the context itself clears the target to the
//! canvas clear color so presented contents are always defined.

pub mod screenshot;

use crate::platform::NativeWindow;
use crate::prelude::*;

enum GpuTarget {
  Surface(wgpu::Surface<'static>),
  Offscreen { texture: wgpu::Texture },
}

/// What one frame produced.
pub struct FrameOutcome {
  pub presented: bool,
  /// RGBA8 readback when a capture was requested.
  pub capture: Option<Vec<u8>>,
}

pub struct GpuContext {
  instance: wgpu::Instance,
  adapter: wgpu::Adapter,
  pub device: wgpu::Device,
  pub queue: wgpu::Queue,
  target: GpuTarget,
  pub format: wgpu::TextureFormat,
  pub width: u32,
  pub height: u32,
  /// Recorded at device init for scripts to query.
  pub indirect_first_instance: bool,
  /// Raised on surface/device loss; the host attempts one reinit, then
  /// treats the loss as fatal.
  pub lost: bool,
}

impl GpuContext {
  /// Windowed mode: surface from the platform layer's raw handles.
  pub fn windowed(window: &NativeWindow) -> AnyResult<Self> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let surface = unsafe {
      instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
        raw_display_handle: window.raw_display_handle,
        raw_window_handle: window.raw_window_handle,
      })
    }
    .map_err(|e| TheErr::Gpu(e.to_string()))?;

    Self::init(instance, Some(surface), window.width, window.height)
  }

  /// Headless mode: no surface; an offscreen color texture is the target.
  pub fn headless(width: u32, height: u32) -> AnyResult<Self> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    Self::init(instance, None, width, height)
  }

  fn init(
    instance: wgpu::Instance,
    surface: Option<wgpu::Surface<'static>>,
    width: u32,
    height: u32,
  ) -> AnyResult<Self> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
      power_preference: wgpu::PowerPreference::HighPerformance,
      compatible_surface: surface.as_ref(),
      force_fallback_adapter: false,
    }))
    .map_err(|e| TheErr::Gpu(format!("no compatible adapter: {e}")))?;

    let mut required_features = wgpu::Features::empty();
    let indirect_first_instance = adapter
      .features()
      .contains(wgpu::Features::INDIRECT_FIRST_INSTANCE);
    if indirect_first_instance {
      required_features |= wgpu::Features::INDIRECT_FIRST_INSTANCE;
    }

    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
      label: Some("mystral-device"),
      required_features,
      ..Default::default()
    }))
    .map_err(|e| TheErr::Gpu(format!("device request failed: {e}")))?;

    let (target, format) = match surface {
      Some(surface) => {
        let mut config = surface
          .get_default_config(&adapter, width.max(1), height.max(1))
          .ok_or_else(|| TheErr::Gpu("surface is incompatible with the adapter".into()))?;
        // Screenshots copy out of the presented target.
        config.usage |= wgpu::TextureUsages::COPY_SRC;
        surface.configure(&device, &config);
        let format = config.format;
        (GpuTarget::Surface(surface), format)
      }
      None => {
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let texture = Self::offscreen_texture(&device, width, height, format);
        (GpuTarget::Offscreen { texture }, format)
      }
    };

    debug!(
      "GPU context ready ({}x{}, {:?}, indirect-first-instance: {})",
      width, height, format, indirect_first_instance
    );

    Ok(GpuContext {
      instance,
      adapter,
      device,
      queue,
      target,
      format,
      width: width.max(1),
      height: height.max(1),
      indirect_first_instance,
      lost: false,
    })
  }

  fn offscreen_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
  ) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
      label: Some("mystral-offscreen-target"),
      size: wgpu::Extent3d {
        width: width.max(1),
        height: height.max(1),
        depth_or_array_layers: 1,
      },
      mip_level_count: 1,
      sample_count: 1,
      dimension: wgpu::TextureDimension::D2,
      format,
      usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
      view_formats: &[],
    })
  }

  /// Reconfigure for new dimensions; old textures are invalidated.
  pub fn resize(&mut self, width: u32, height: u32) {
    self.width = width.max(1);
    self.height = height.max(1);
    match &mut self.target {
      GpuTarget::Surface(surface) => {
        if let Some(mut config) =
          surface.get_default_config(&self.adapter, self.width, self.height)
        {
          config.usage |= wgpu::TextureUsages::COPY_SRC;
          surface.configure(&self.device, &config);
        }
      }
      GpuTarget::Offscreen { texture } => {
        *texture = Self::offscreen_texture(&self.device, self.width, self.height, self.format);
      }
    }
  }

  /// One reinit attempt after a loss. Surface-backed contexts reconfigure;
  /// offscreen contexts rebuild their texture.
  pub fn try_reinit(&mut self) -> bool {
    self.resize(self.width, self.height);
    self.lost = false;
    true
  }

  /// Acquire, clear to `clear_color`, optionally read back, present.
  ///
  /// The encoder is constructed and submitted within this call on the main
  /// thread; script callbacks never overlap pass recording.
  pub fn frame(&mut self, clear_color: [f64; 4], capture: bool) -> AnyResult<FrameOutcome> {
    let color = wgpu::Color {
      r: clear_color[0],
      g: clear_color[1],
      b: clear_color[2],
      a: clear_color[3],
    };

    match &self.target {
      GpuTarget::Offscreen { texture } => {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.encode_clear(&view, color);
        let capture = if capture {
          Some(self.read_back(texture)?)
        } else {
          None
        };
        Ok(FrameOutcome {
          presented: false,
          capture,
        })
      }
      GpuTarget::Surface(surface) => {
        let reconfigure = |surface: &wgpu::Surface<'static>| {
          if let Some(mut config) =
            surface.get_default_config(&self.adapter, self.width, self.height)
          {
            config.usage |= wgpu::TextureUsages::COPY_SRC;
            surface.configure(&self.device, &config);
          }
        };

        let frame = match surface.get_current_texture() {
          Ok(frame) => frame,
          Err(wgpu::SurfaceError::Outdated) => {
            // Stale configuration (resize in flight): reconfigure and skip.
            reconfigure(surface);
            return Ok(FrameOutcome {
              presented: false,
              capture: None,
            });
          }
          Err(wgpu::SurfaceError::Timeout) => {
            return Ok(FrameOutcome {
              presented: false,
              capture: None,
            });
          }
          Err(e) => {
            self.lost = true;
            anyhow::bail!(TheErr::Gpu(format!("surface lost: {e}")));
          }
        };

        let suboptimal = frame.suboptimal;
        let view = frame
          .texture
          .create_view(&wgpu::TextureViewDescriptor::default());
        self.encode_clear(&view, color);
        let capture = if capture {
          Some(self.read_back(&frame.texture)?)
        } else {
          None
        };
        frame.present();

        if suboptimal {
          reconfigure(surface);
        }

        Ok(FrameOutcome {
          presented: true,
          capture,
        })
      }
    }
  }

  fn encode_clear(&self, view: &wgpu::TextureView, color: wgpu::Color) {
    let mut encoder = self
      .device
      .create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("mystral-present"),
      });
    {
      let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("mystral-clear"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
          view,
          depth_slice: None,
          resolve_target: None,
          ops: wgpu::Operations {
            load: wgpu::LoadOp::Clear(color),
            store: wgpu::StoreOp::Store,
          },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
      });
    }
    self.queue.submit([encoder.finish()]);
  }

  /// Copies the target into a CPU buffer (row-aligned), maps it, and
  /// returns unpadded RGBA8 bytes.
  fn read_back(&self, texture: &wgpu::Texture) -> AnyResult<Vec<u8>> {
    let bytes_per_row = screenshot::padded_bytes_per_row(self.width);
    let buffer_size = bytes_per_row as u64 * self.height as u64;

    let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
      label: Some("mystral-readback"),
      size: buffer_size,
      usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
      mapped_at_creation: false,
    });

    let mut encoder = self
      .device
      .create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("mystral-readback"),
      });
    encoder.copy_texture_to_buffer(
      wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect: wgpu::TextureAspect::All,
      },
      wgpu::TexelCopyBufferInfo {
        buffer: &buffer,
        layout: wgpu::TexelCopyBufferLayout {
          offset: 0,
          bytes_per_row: Some(bytes_per_row),
          rows_per_image: Some(self.height),
        },
      },
      wgpu::Extent3d {
        width: self.width,
        height: self.height,
        depth_or_array_layers: 1,
      },
    );
    self.queue.submit([encoder.finish()]);

    let (tx, rx) = std::sync::mpsc::channel();
    let slice = buffer.slice(..);
    slice.map_async(wgpu::MapMode::Read, move |result| {
      let _ = tx.send(result);
    });
    self
      .device
      .poll(wgpu::PollType::Wait {
        submission_index: None,
        timeout: None,
      })
      .map_err(|e| TheErr::Gpu(format!("readback poll failed: {e:?}")))?;
    rx.recv()
      .map_err(|_| TheErr::Gpu("readback callback dropped".into()))?
      .map_err(|e| TheErr::Gpu(format!("readback map failed: {e:?}")))?;

    let padded = slice.get_mapped_range().to_vec();
    buffer.unmap();

    let mut rgba =
      screenshot::unpad_rows(&padded, bytes_per_row as usize, self.width, self.height);
    if screenshot::is_bgra(self.format) {
      screenshot::bgra_to_rgba(&mut rgba);
    }
    Ok(rgba)
  }

  /// Keep the instance alive for as long as the context.
  pub fn instance(&self) -> &wgpu::Instance {
    &self.instance
  }
}
