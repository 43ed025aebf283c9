//! GPU-accelerated L1 attention kernels using WGPU.
//!
//! This module implements the four L1 attention kernels as WGSL compute
//! shaders. It handles GPU context initialization, shader precompilation
//! (once, via `lazy_static`) and compute dispatch:
//!
//! - `l1attn_fwd`: general forward, one invocation per score
//! - `l1attn_fwd_tiled`: forward over 16 x 16 tiles held in workgroup memory
//! - `l1attn_bwd`: general backward, run once per gradient
//! - `l1attn_bwd_tiled`: backward over 16-row tiles, run once per gradient
//!
//! Tensor data is uploaded for every call and read back into host memory, so
//! outputs are ordinary tensors tagged [`Backend::Wgpu`].

use super::dispatch::{TILE, TILED_WIDTHS};
use super::{data, dims4, expect_shape, L1AttnKernels};
use crate::backend::Backend;
use crate::error::{L1AttnError, Result};
use crate::tensors::Ten32;
use briny::raw::{slice_from_bytes, slice_to_bytes};
use briny::BrinyError;
use thiserror::Error;
use wgpu::util::DeviceExt;

const L1ATTN_FWD: &str = include_str!("shaders/l1attn_fwd.wgsl");
const L1ATTN_FWD_TILED: &str = include_str!("shaders/l1attn_fwd_tiled.wgsl");
const L1ATTN_BWD: &str = include_str!("shaders/l1attn_bwd.wgsl");
const L1ATTN_BWD_TILED: &str = include_str!("shaders/l1attn_bwd_tiled.wgsl");

/// Threads per workgroup in the general shaders.
const WORKGROUP: usize = 64;

/// Largest workgroup count per dispatch dimension.
const MAX_GROUPS: u32 = 65_535;

/// Errors raised by the GPU backend.
#[derive(Error, Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// An error in requesting the device.
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// The shared context failed to initialize earlier.
    #[error("gpu context unavailable: {0}")]
    Unavailable(String),
    /// Waiting on the device failed.
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    /// The staging buffer could not be mapped.
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    /// Mapped bytes could not be viewed as `f32`s.
    #[error("readback buffer is not a valid f32 slice")]
    Readback,
    /// A size does not fit the device limits or the 32-bit shader indices.
    #[error("{0} exceeds the device limits")]
    TooLarge(usize),
}

impl From<BrinyError> for GpuError {
    fn from(_: BrinyError) -> Self {
        Self::Readback
    }
}

/// Holds the WGPU device, queue and the compiled L1 attention pipelines.
///
/// Initialized once globally and reused for all operations via `lazy_static`.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
    forward_layout: wgpu::BindGroupLayout,
    backward_layout: wgpu::BindGroupLayout,
    forward: wgpu::ComputePipeline,
    forward_tiled: wgpu::ComputePipeline,
    backward: wgpu::ComputePipeline,
    backward_tiled: wgpu::ComputePipeline,
}

impl GpuContext {
    /// Selects the default adapter, creates a device and queue and compiles
    /// every pipeline.
    ///
    /// # Errors
    /// [`GpuError::Adapter`] or [`GpuError::Device`] if acquisition fails.
    pub fn new() -> std::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("l1attn"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        // uniform dims, then the read-only inputs, then the output
        let forward_layout = bind_group_layout(&device, "l1attn_fwd_bgl", 2);
        let backward_layout = bind_group_layout(&device, "l1attn_bwd_bgl", 3);
        let forward = pipeline(&device, "l1attn_fwd", L1ATTN_FWD, &forward_layout);
        let forward_tiled = pipeline(&device, "l1attn_fwd_tiled", L1ATTN_FWD_TILED, &forward_layout);
        let backward = pipeline(&device, "l1attn_bwd", L1ATTN_BWD, &backward_layout);
        let backward_tiled =
            pipeline(&device, "l1attn_bwd_tiled", L1ATTN_BWD_TILED, &backward_layout);
        log::info!("gpu context ready: {:?}", adapter.get_info().name);

        Ok(Self {
            device,
            queue,
            forward_layout,
            backward_layout,
            forward,
            forward_tiled,
            backward,
            backward_tiled,
        })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: std::result::Result<GpuContext, String> =
        GpuContext::new().map_err(|e| {
            log::error!("wgpu backend unavailable: {e}");
            e.to_string()
        });
}

/// The shared context, initializing it on first use.
///
/// # Errors
/// [`GpuError::Unavailable`] if initialization failed.
pub fn context() -> std::result::Result<&'static GpuContext, GpuError> {
    match &*GPU_CONTEXT {
        Ok(ctx) => Ok(ctx),
        Err(e) => Err(GpuError::Unavailable(e.clone())),
    }
}

fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn bind_group_layout(device: &wgpu::Device, label: &str, inputs: u32) -> wgpu::BindGroupLayout {
    let buffer = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let mut entries = vec![buffer(0, wgpu::BufferBindingType::Uniform)];
    entries.extend(
        (1..=inputs).map(|b| buffer(b, wgpu::BufferBindingType::Storage { read_only: true })),
    );
    entries.push(buffer(
        inputs + 1,
        wgpu::BufferBindingType::Storage { read_only: false },
    ));
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

fn pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let module = load_shader(device, label, source);
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    })
}

fn to_u32(n: usize) -> std::result::Result<u32, GpuError> {
    u32::try_from(n).map_err(|_| GpuError::TooLarge(n))
}

/// Spreads `groups` workgroups over x and y when x alone would overflow.
fn grid(groups: u32) -> [u32; 3] {
    if groups <= MAX_GROUPS {
        [groups, 1, 1]
    } else {
        [MAX_GROUPS, groups.div_ceil(MAX_GROUPS), 1]
    }
}

/// One shader launch: uniform dims, inputs and the grid.
struct Launch<'a> {
    label: &'a str,
    pipeline: &'a wgpu::ComputePipeline,
    layout: &'a wgpu::BindGroupLayout,
    /// `[batch, n_ctx, heads, width, mode]`
    dims: [usize; 5],
    inputs: &'a [&'a [f32]],
    out_len: usize,
    groups: [u32; 3],
}

/// Checks storage buffers of `lens` elements against `limits` before any
/// upload. Element counts must also fit the `u32` indices of the shaders.
fn check_sizes(
    limits: &wgpu::Limits,
    lens: impl IntoIterator<Item = usize>,
) -> std::result::Result<(), GpuError> {
    let max_bytes = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    for len in lens {
        to_u32(len)?;
        let bytes = len
            .checked_mul(size_of::<f32>())
            .and_then(|b| u64::try_from(b).ok())
            .ok_or(GpuError::TooLarge(len))?;
        if bytes > max_bytes {
            return Err(GpuError::TooLarge(len));
        }
    }
    Ok(())
}

fn run(ctx: &GpuContext, launch: &Launch<'_>) -> std::result::Result<Vec<f32>, GpuError> {
    let device = &ctx.device;
    let queue = &ctx.queue;
    check_sizes(
        &device.limits(),
        launch.inputs.iter().map(|input| input.len()).chain([launch.out_len]),
    )?;

    let mut dims = [0u32; 8];
    for (slot, &d) in dims.iter_mut().zip(&launch.dims) {
        *slot = to_u32(d)?;
    }
    let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("dims"),
        contents: slice_to_bytes(&dims),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let input_buffers: Vec<wgpu::Buffer> = launch
        .inputs
        .iter()
        .map(|input| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(launch.label),
                contents: slice_to_bytes(input),
                usage: wgpu::BufferUsages::STORAGE,
            })
        })
        .collect();
    let size = (launch.out_len * size_of::<f32>()) as u64;
    let out_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("out"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: dims_buffer.as_entire_binding(),
    }];
    for (binding, buffer) in (1..).zip(input_buffers.iter().chain([&out_buffer])) {
        entries.push(wgpu::BindGroupEntry {
            binding,
            resource: buffer.as_entire_binding(),
        });
    }
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(launch.label),
        layout: launch.layout,
        entries: &entries,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(launch.label),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(launch.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(launch.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = launch.groups;
        pass.dispatch_workgroups(x, y, z);
    }

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    encoder.copy_buffer_to_buffer(&out_buffer, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::PollType::Wait)?;
    rx.recv()
        .map_err(|_| GpuError::Unavailable("map callback dropped".into()))??;

    let mapped = slice.get_mapped_range();
    let out = slice_from_bytes::<f32>(&mapped)?.to_vec();
    drop(mapped);
    staging.unmap();
    Ok(out)
}

fn workgroups(total: usize) -> std::result::Result<[u32; 3], GpuError> {
    let groups = to_u32(total.div_ceil(WORKGROUP))?;
    if groups.div_ceil(MAX_GROUPS) > MAX_GROUPS {
        return Err(GpuError::TooLarge(total));
    }
    Ok(grid(groups))
}

/// `[b, h, n, w]` of a tiled operand, checking the tile constraints.
fn tiled_dims(q: &Ten32) -> Result<[usize; 4]> {
    let dims @ [bs, n_heads, n_ctx, width] = dims4(q, "q")?;
    if n_ctx % TILE != 0 {
        return Err(L1AttnError::invalid(
            "q",
            format!("a context length divisible by {TILE}, got {n_ctx}"),
        ));
    }
    if !TILED_WIDTHS.contains(&width) {
        return Err(L1AttnError::UnsupportedWidth(width));
    }
    if bs * n_heads > MAX_GROUPS as usize || (n_ctx / TILE).pow(2) > MAX_GROUPS as usize {
        return Err(GpuError::TooLarge(bs * n_heads * n_ctx).into());
    }
    Ok(dims)
}

fn nonzero_width(width: usize) -> Result<()> {
    if width == 0 {
        return Err(L1AttnError::invalid("q", "of non-zero width"));
    }
    Ok(())
}

fn on_gpu(shape: Vec<usize>, data: Vec<f32>) -> Ten32 {
    Ten32::new(shape, data).to_backend(Backend::Wgpu)
}

/// WGSL implementation of the four L1 attention kernels.
///
/// Every call blocks until its results are back in host memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuKernels;

impl L1AttnKernels for WgpuKernels {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn forward_general(&self, q: &Ten32, k: &Ten32) -> Result<Ten32> {
        let [bs, n_ctx, n_heads, width] = dims4(q, "q")?;
        expect_shape(k, "k", [bs, n_ctx, n_heads, width])?;
        let shape = vec![bs, n_ctx, n_ctx, n_heads];
        let total = bs * n_ctx * n_ctx * n_heads;
        if total == 0 {
            return Ok(on_gpu(shape, Vec::new()));
        }
        nonzero_width(width)?;

        let ctx = context()?;
        let out = run(
            ctx,
            &Launch {
                label: "l1attn_fwd",
                pipeline: &ctx.forward,
                layout: &ctx.forward_layout,
                dims: [bs, n_ctx, n_heads, width, 0],
                inputs: &[data(q, "q")?, data(k, "k")?],
                out_len: total,
                groups: workgroups(total)?,
            },
        )?;
        Ok(on_gpu(shape, out))
    }

    fn forward_tiled(&self, q: &Ten32, k: &Ten32) -> Result<Ten32> {
        let [bs, n_heads, n_ctx, width] = tiled_dims(q)?;
        expect_shape(k, "k", [bs, n_heads, n_ctx, width])?;
        let shape = vec![bs, n_ctx, n_ctx, n_heads];
        let total = bs * n_ctx * n_ctx * n_heads;
        if total == 0 {
            return Ok(on_gpu(shape, Vec::new()));
        }

        let ctx = context()?;
        let tiles = n_ctx / TILE;
        let out = run(
            ctx,
            &Launch {
                label: "l1attn_fwd_tiled",
                pipeline: &ctx.forward_tiled,
                layout: &ctx.forward_layout,
                dims: [bs, n_ctx, n_heads, width, 0],
                inputs: &[data(q, "q")?, data(k, "k")?],
                out_len: total,
                groups: [to_u32(tiles * tiles)?, 1, to_u32(bs * n_heads)?],
            },
        )?;
        Ok(on_gpu(shape, out))
    }

    fn backward_general(
        &self,
        d_attn_q: &Ten32,
        d_attn_k: &Ten32,
        q: &Ten32,
        k: &Ten32,
    ) -> Result<(Ten32, Ten32)> {
        let [bs, width, n_heads, n_ctx] = dims4(q, "q")?;
        expect_shape(k, "k", [bs, width, n_heads, n_ctx])?;
        expect_shape(d_attn_q, "d_attn_q", [bs, n_ctx, n_heads, n_ctx])?;
        expect_shape(d_attn_k, "d_attn_k", [bs, n_ctx, n_heads, n_ctx])?;
        let shape = vec![bs, n_ctx, n_heads, width];
        let total = bs * n_ctx * n_heads * width;
        if total == 0 {
            return Ok((on_gpu(shape.clone(), Vec::new()), on_gpu(shape, Vec::new())));
        }

        let ctx = context()?;
        let (q_data, k_data) = (data(q, "q")?, data(k, "k")?);
        let mut grads = [("d_attn_q", d_attn_q), ("d_attn_k", d_attn_k)]
            .into_iter()
            .enumerate()
            .map(|(mode, (name, d))| -> Result<Vec<f32>> {
                Ok(run(
                    ctx,
                    &Launch {
                        label: "l1attn_bwd",
                        pipeline: &ctx.backward,
                        layout: &ctx.backward_layout,
                        dims: [bs, n_ctx, n_heads, width, mode],
                        inputs: &[data(d, name)?, q_data, k_data],
                        out_len: total,
                        groups: workgroups(total)?,
                    },
                )?)
            })
            .collect::<Result<Vec<_>>>()?;
        let dk = grads.pop().unwrap_or_default();
        let dq = grads.pop().unwrap_or_default();
        Ok((on_gpu(shape.clone(), dq), on_gpu(shape, dk)))
    }

    fn backward_tiled(&self, d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
        let [bs, n_heads, n_ctx, width] = tiled_dims(q)?;
        expect_shape(k, "k", [bs, n_heads, n_ctx, width])?;
        expect_shape(d_attn, "d_attn", [bs, n_heads, n_ctx, n_ctx])?;
        let shape = vec![bs, n_ctx, n_heads, width];
        let total = bs * n_ctx * n_heads * width;
        if total == 0 {
            return Ok((on_gpu(shape.clone(), Vec::new()), on_gpu(shape, Vec::new())));
        }

        let ctx = context()?;
        let inputs = [data(d_attn, "d_attn")?, data(q, "q")?, data(k, "k")?];
        let groups = [to_u32(n_ctx / TILE)?, 1, to_u32(bs * n_heads)?];
        let mut launch = Launch {
            label: "l1attn_bwd_tiled",
            pipeline: &ctx.backward_tiled,
            layout: &ctx.backward_layout,
            dims: [bs, n_ctx, n_heads, width, 0],
            inputs: &inputs,
            out_len: total,
            groups,
        };
        let dq = run(ctx, &launch)?;
        launch.dims[4] = 1;
        let dk = run(ctx, &launch)?;
        Ok((on_gpu(shape.clone(), dq), on_gpu(shape, dk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::assert_close;
    use crate::ops::cpu::CpuKernels;
    use crate::ops::dispatch::Dispatcher;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(shape: [usize; 4], rng: &mut StdRng) -> Ten32 {
        let n = shape.iter().product();
        let data = (0..n).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        Ten32::new(shape.to_vec(), data)
    }

    /// Runs the same call on both backends and compares the results. Skips
    /// when no adapter is present.
    fn agree(shape: [usize; 4]) {
        if context().is_err() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(23);
        let [b, n, h, _] = shape;
        let q = random(shape, &mut rng).to_backend(Backend::Cpu);
        let k = random(shape, &mut rng).to_backend(Backend::Cpu);
        let d_attn = random([b, n, n, h], &mut rng).to_backend(Backend::Cpu);
        let cpu = Dispatcher::new(CpuKernels);
        let gpu = Dispatcher::new(WgpuKernels);
        let on = |t: &Ten32| t.to_backend(Backend::Wgpu);

        let expected = cpu.forward(&q, &k).unwrap();
        let got = gpu.forward(&on(&q), &on(&k)).unwrap();
        assert_eq!(got.backend(), Backend::Wgpu);
        assert_close(&got.to_vec(), &expected.to_vec());

        let (dq, dk) = cpu.backward(&d_attn, &q, &k).unwrap();
        let (gq, gk) = gpu.backward(&on(&d_attn), &on(&q), &on(&k)).unwrap();
        assert_close(&gq.to_vec(), &dq.to_vec());
        assert_close(&gk.to_vec(), &dk.to_vec());
    }

    #[test]
    fn general_kernels_match_cpu() {
        agree([2, 5, 3, 7]);
    }

    #[test]
    fn tiled_kernels_match_cpu() {
        for width in TILED_WIDTHS {
            agree([2, 32, 2, width]);
        }
    }

    #[test]
    fn grid_spills_into_y() {
        assert_eq!(grid(10), [10, 1, 1]);
        assert_eq!(grid(MAX_GROUPS + 1), [MAX_GROUPS, 2, 1]);
    }

    #[test]
    fn buffers_past_the_binding_limit_are_refused() {
        let limits = wgpu::Limits::default();
        let max = limits.max_storage_buffer_binding_size as usize / size_of::<f32>();

        // [16, 512, 512, 8] attention scores fill the default binding exactly
        let at_limit = 16 * 512 * 512 * 8;
        assert_eq!(at_limit, max);
        assert!(check_sizes(&limits, [16 * 512 * 8 * 64, at_limit]).is_ok());

        let over = 16 * 1024 * 1024 * 8;
        assert!(matches!(
            check_sizes(&limits, [16 * 1024 * 8 * 64, over]),
            Err(GpuError::TooLarge(n)) if n == over
        ));
        // element counts past u32 are refused even under generous limits
        let generous = wgpu::Limits {
            max_storage_buffer_binding_size: u32::MAX,
            max_buffer_size: u64::MAX,
            ..wgpu::Limits::default()
        };
        assert!(matches!(
            check_sizes(&generous, [1usize << 33]),
            Err(GpuError::TooLarge(_))
        ));
        assert!(check_sizes(&generous, [max + 1]).is_ok());
    }

    #[test]
    fn empty_batch_skips_the_device() {
        let q = Ten32::zeros(vec![0, 4, 1, 8]);
        let attn = WgpuKernels.forward_general(&q, &q).unwrap();
        assert_eq!(attn.shape(), &[0, 4, 4, 1]);
    }
}
