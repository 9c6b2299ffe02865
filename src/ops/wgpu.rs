//! GPU-accelerated kernels using WGPU.
//!
//! This module runs convolution forward as a WGSL compute shader. It handles
//! GPU context initialization, shader precompilation (via `lazy_static`) and
//! compute dispatch. Every other kernel, and any GPU failure, falls back to
//! the CPU backend through [`super::dispatch`].
//!
//! The context is created once per process. When no adapter is found the GPU
//! engine count is zero and GPU engines cannot be created.

use briny::prelude::*;
use wgpu::util::DeviceExt;

use super::Kernel;
use crate::desc::ConvolutionDesc;

const CONV: &str = include_str!("shaders/conv.wgsl");
const WORKGROUP: u32 = 64;
const MAX_GROUPS: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// An error in requesting the device.
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// Shader source rejected before compilation.
    #[error("shader `{0}` failed validation")]
    Validation(&'static str),
    /// Mapping or polling a buffer failed.
    #[error("buffer readback failed: {0}")]
    Readback(String),
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// # Errors
    /// [`GpuError::Adapter`] or [`GpuError::Device`] when no usable GPU exists.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_dnn"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;
        log::debug!("GPU context ready on {:?}", adapter.get_info().name);
        Ok(Self { device, queue })
    }
}

/// Wrapper for WGSL source code that must pass validation before compiling.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        let forbidden = ["import", "#include", "asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Validates and compiles a WGSL shader.
///
/// # Errors
/// [`GpuError::Validation`] when the source is rejected.
pub fn load_shader(device: &wgpu::Device, label: &'static str, source: &str) -> Result<wgpu::ShaderModule, GpuError> {
    WgslSource(source)
        .validate()
        .map_err(|_| GpuError::Validation(label))?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compiled convolution pipeline.
pub struct ConvPipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl ConvPipeline {
    fn new(ctx: &GpuContext) -> Result<Self, GpuError> {
        let module = load_shader(&ctx.device, "conv", CONV)?;
        let read = wgpu::BufferBindingType::Storage { read_only: true };
        let layout = ctx.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("conv_bgl"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, read),
                buffer_entry(2, read),
                buffer_entry(3, read),
                buffer_entry(4, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
        let pipeline_layout = ctx.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("conv_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("conv_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        Ok(Self { layout, pipeline })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = GpuContext::new()
        .map_err(|e| log::warn!("no GPU available: {e}"))
        .ok();
    static ref CONV_PIPELINE: Option<ConvPipeline> = GPU_CONTEXT
        .as_ref()
        .and_then(|ctx| ConvPipeline::new(ctx).map_err(|e| log::warn!("{e}")).ok());
}

/// Whether a GPU device could be initialized.
pub fn gpu_available() -> bool {
    GPU_CONTEXT.is_some()
}

/// Runs `kernel` on the GPU, `None` when it is not implemented here or failed.
pub fn run(kernel: &Kernel<'_>, inputs: &[Vec<f32>]) -> Option<Vec<Vec<f32>>> {
    let Kernel::ConvForward(conv) = *kernel else {
        return None;
    };
    let (ctx, pipeline) = (GPU_CONTEXT.as_ref()?, CONV_PIPELINE.as_ref()?);
    let bias = inputs.get(2).map(Vec::as_slice);
    match pollster::block_on(conv_forward(ctx, pipeline, conv, inputs.first()?, inputs.get(1)?, bias)) {
        Ok(dst) => Some(vec![dst]),
        Err(e) => {
            log::warn!("GPU convolution failed, falling back to CPU: {e}");
            None
        }
    }
}

fn to_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

async fn conv_forward(
    ctx: &GpuContext,
    pipeline: &ConvPipeline,
    conv: &ConvolutionDesc,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
) -> Result<Vec<f32>, GpuError> {
    let (s, w, d) = (conv.src.dims(), conv.weights.dims(), conv.dst.dims());
    let total = d.iter().product::<usize>();
    if total == 0 || src.is_empty() || weights.is_empty() {
        return Err(GpuError::Readback("empty tensors are left to the CPU".into()));
    }
    let win = conv.window;
    let params: Vec<u32> = [
        s[0], s[1], s[2], s[3],
        d[1], d[2], d[3], usize::from(bias.is_some()),
        w[2], w[3], win.strides[0], win.strides[1],
        win.padding_l[0], win.padding_l[1], total, 0,
    ]
    .iter()
    .map(|&v| v as u32)
    .collect();
    let params: Vec<u8> = params.iter().flat_map(|v| v.to_ne_bytes()).collect();

    let device = &ctx.device;
    let init = |label, contents: &[u8], usage| {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage,
        })
    };
    let params_buffer = init("conv_params", &params, wgpu::BufferUsages::UNIFORM);
    let src_buffer = init("conv_src", &to_bytes(src), wgpu::BufferUsages::STORAGE);
    let weights_buffer = init("conv_weights", &to_bytes(weights), wgpu::BufferUsages::STORAGE);
    let bias_buffer = init(
        "conv_bias",
        &to_bytes(bias.unwrap_or(&[0.0])),
        wgpu::BufferUsages::STORAGE,
    );
    let size = (total * 4) as u64;
    let dst_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("conv_dst"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("conv_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("conv_bind_group"),
        layout: &pipeline.layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: params_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: src_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: weights_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: bias_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: dst_buffer.as_entire_binding() },
        ],
    });

    let groups = (total as u32).div_ceil(WORKGROUP);
    let groups_x = groups.min(MAX_GROUPS);
    let groups_y = groups.div_ceil(groups_x);

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("conv_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("conv_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups_x, groups_y, 1);
    }
    encoder.copy_buffer_to_buffer(&dst_buffer, 0, &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let (tx, rx) = std::sync::mpsc::channel();
    let slice = staging.slice(..);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| GpuError::Readback(e.to_string()))?;
    rx.recv()
        .map_err(|e| GpuError::Readback(e.to_string()))?
        .map_err(|e| GpuError::Readback(e.to_string()))?;

    let data = slice.get_mapped_range();
    let dst = data
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    drop(data);
    staging.unmap();
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_shader_passes_validation() {
        assert!(WgslSource(CONV).validate().is_ok());
        assert!(WgslSource("fn main() { let p: ptr<function, f32>; }").validate().is_err());
    }
}
