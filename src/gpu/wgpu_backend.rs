//! # wgpu Backend
//!
//! Drives a headless wgpu device through the [`GpuDevice`] boundary.
//!
//! ## Queues
//!
//! wgpu exposes a single hardware queue. The three logical queues still run on their
//! own threads, and a GPU-side `wait` blocks its logical queue until the matching
//! signal has been *submitted* on another logical queue. Since the hardware queue
//! retires in submission order, everything submitted after the wait executes after the
//! work the signal covers.
//!
//! ## Fences
//!
//! A signal registers `Queue::on_submitted_work_done` and advances the fence from the
//! callback. Callbacks fire from `Device::poll`, which a dedicated poll thread calls
//! continuously.
//!
//! ## Presentation
//!
//! There is no window. Three offscreen render targets stand in for the swap chain; the
//! renderer blits its final image into the current one and `present` rotates them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use web_time::Instant;
use wgpu::util::DeviceExt;

use super::{
    command_list::{GpuCommand, PassDesc, SkinningDispatch},
    layout::GpuVertex,
    queue_thread::{QueueBackend, QueueOp, QueueThreads},
    BlendMode, BufferDesc, BufferId, BufferKind, CommandList, CullMode, Fence, GpuDevice, GpuError,
    PassKind, PipelineId, QueueKind, RenderStateKey, TextureDesc, TextureId, TextureKind,
    SWAP_CHAIN_LENGTH,
};

/// Format of color render targets and swap-chain images.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Format of depth targets and shadow maps.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const SKINNING_WORKGROUP_SIZE: u32 = 64;
const VSYNC_INTERVAL: Duration = Duration::from_micros(16_667);

/// Analytics data for a GPU buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAnalytics {
    /// Total memory allocated for the buffer in bytes.
    pub allocated_memory: u64,
    /// Highest byte written by the CPU.
    pub used_memory: u64,
    /// Number of CPU writes.
    pub times_written: u64,
}

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    label: String,
    analytics: BufferAnalytics,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

struct Shaders {
    render: wgpu::ShaderModule,
    pass_layout: wgpu::BindGroupLayout,
    render_pipeline_layout: wgpu::PipelineLayout,
    skinning_layout: wgpu::BindGroupLayout,
    skinning_pipeline: wgpu::ComputePipeline,
}

struct SwapChain {
    images: [TextureId; SWAP_CHAIN_LENGTH],
    index: u32,
    last_present: Option<Instant>,
}

struct WgpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_id: AtomicU32,
    buffers: Mutex<HashMap<BufferId, WgpuBuffer>>,
    textures: Mutex<HashMap<TextureId, WgpuTexture>>,
    pipelines: Mutex<HashMap<PipelineId, wgpu::RenderPipeline>>,
    shaders: Shaders,
    swap_chain: Mutex<SwapChain>,
    lost: Arc<AtomicBool>,
}

/// Options of a [`WgpuGpu`].
#[derive(Debug, Clone, Copy)]
pub struct WgpuGpuOptions {
    /// Width of the offscreen swap chain.
    pub width: u32,
    /// Height of the offscreen swap chain.
    pub height: u32,
}

impl Default for WgpuGpuOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// A headless wgpu device behind the GPU service boundary.
pub struct WgpuGpu {
    state: Arc<WgpuState>,
    queues: QueueThreads,
    poller: Option<JoinHandle<()>>,
    stop_polling: Arc<AtomicBool>,
}

impl WgpuGpu {
    /// Requests an adapter and device and builds the shared pipelines.
    ///
    /// # Errors
    /// Fails when no adapter is available or the device request is rejected.
    pub fn new(options: WgpuGpuOptions) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            backend_options: wgpu::BackendOptions::from_env_or_default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| GpuError::AdapterUnavailable(err.to_string()))?;
        info!("Using adapter {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("frame-engine device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|err| GpuError::DeviceRequest(err.to_string()))?;

        device.on_uncaptured_error(Box::new(|err: wgpu::Error| {
            error!("wgpu validation error: {}", err);
        }));

        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                error!("wgpu device lost ({:?}): {}", reason, message);
                lost.store(true, Ordering::Release);
            });
        }

        let shaders = Shaders::new(&device);
        let next_id = AtomicU32::new(1);
        let mut textures = HashMap::new();
        let images = std::array::from_fn(|index| {
            let id = TextureId(next_id.fetch_add(1, Ordering::Relaxed));
            let desc = TextureDesc::new(
                format!("swap chain image {}", index),
                options.width,
                options.height,
                TextureKind::RenderTarget,
            );
            textures.insert(id, WgpuTexture::new(&device, desc));
            id
        });

        let state = Arc::new(WgpuState {
            device,
            queue,
            next_id,
            buffers: Mutex::new(HashMap::new()),
            textures: Mutex::new(textures),
            pipelines: Mutex::new(HashMap::new()),
            shaders,
            swap_chain: Mutex::new(SwapChain {
                images,
                index: 0,
                last_present: None,
            }),
            lost,
        });

        let stop_polling = Arc::new(AtomicBool::new(false));
        let poller = {
            let state = state.clone();
            let stop = stop_polling.clone();
            std::thread::Builder::new()
                .name(String::from("wgpu-poll"))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if let Err(err) = state.device.poll(wgpu::PollType::Poll) {
                            error!("Polling the wgpu device failed, poll thread stopping: {}", err);
                            break;
                        }
                        std::thread::sleep(Duration::from_micros(500));
                    }
                })
                .map_err(|err| GpuError::DeviceRequest(format!("failed to spawn poll thread: {}", err)))?
        };

        let queues = QueueThreads::spawn(state.clone(), "wgpu");
        Ok(Self {
            state,
            queues,
            poller: Some(poller),
            stop_polling,
        })
    }

    /// Analytics of one buffer.
    pub fn buffer_analytics(&self, buffer: BufferId) -> Option<BufferAnalytics> {
        self.state
            .buffers
            .lock()
            .get(&buffer)
            .map(|entry| entry.analytics)
    }

    /// Sum of all buffer allocations in bytes.
    pub fn total_allocated_memory(&self) -> u64 {
        self.state
            .buffers
            .lock()
            .values()
            .map(|entry| entry.analytics.allocated_memory)
            .sum()
    }
}

impl Drop for WgpuGpu {
    fn drop(&mut self) {
        self.queues.shutdown();
        self.stop_polling.store(true, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                error!("wgpu poll thread exited by panicking");
            }
        }
    }
}

impl std::fmt::Debug for WgpuGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuGpu")
            .field("buffers", &self.state.buffers.lock().len())
            .field("allocated_memory", &self.total_allocated_memory())
            .finish()
    }
}

fn buffer_usages(kind: BufferKind) -> wgpu::BufferUsages {
    use wgpu::BufferUsages as U;
    match kind {
        BufferKind::Upload => U::COPY_SRC | U::COPY_DST,
        BufferKind::Vertex => U::VERTEX | U::STORAGE | U::COPY_DST | U::COPY_SRC,
        BufferKind::Index => U::INDEX | U::COPY_DST | U::COPY_SRC,
        BufferKind::Storage => U::STORAGE | U::COPY_DST | U::COPY_SRC,
        BufferKind::ComputeVertexOutput => U::VERTEX | U::STORAGE | U::COPY_DST | U::COPY_SRC,
    }
}

/// wgpu requires copy sizes that are multiples of four.
fn aligned_size(size: u64) -> u64 {
    size.max(wgpu::COPY_BUFFER_ALIGNMENT)
        .div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
        * wgpu::COPY_BUFFER_ALIGNMENT
}

impl WgpuTexture {
    fn new(device: &wgpu::Device, desc: TextureDesc) -> Self {
        let (format, usage) = match desc.kind {
            TextureKind::RenderTarget => (
                COLOR_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
            ),
            TextureKind::DepthStencil | TextureKind::ShadowMap => (
                DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            ),
        };

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            desc,
        }
    }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl Shaders {
    fn new(device: &wgpu::Device) -> Self {
        let render = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Render Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/render.wgsl").into()),
        });
        let skinning = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Skinning Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/skinning.wgsl").into()),
        });

        let render_stages = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
        let pass_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Pass Bind Group Layout"),
            entries: &[
                storage_entry(0, render_stages, true),
                storage_entry(1, render_stages, true),
                storage_entry(2, render_stages, true),
                storage_entry(3, render_stages, true),
                storage_entry(4, render_stages, true),
            ],
        });
        let render_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Render Pipeline Layout"),
            bind_group_layouts: &[&pass_layout],
            push_constant_ranges: &[],
        });

        let compute = wgpu::ShaderStages::COMPUTE;
        let skinning_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Skinning Bind Group Layout"),
            entries: &[
                storage_entry(0, compute, true),
                storage_entry(1, compute, true),
                storage_entry(2, compute, true),
                storage_entry(3, compute, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: compute,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let skinning_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Skinning Pipeline Layout"),
            bind_group_layouts: &[&skinning_layout],
            push_constant_ranges: &[],
        });
        let skinning_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Skinning Pipeline"),
            layout: Some(&skinning_pipeline_layout),
            module: &skinning,
            entry_point: Some("cs_skin"),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            render,
            pass_layout,
            render_pipeline_layout,
            skinning_layout,
            skinning_pipeline,
        }
    }

    fn create_render_pipeline(&self, device: &wgpu::Device, key: &RenderStateKey) -> wgpu::RenderPipeline {
        let cull_mode = match key.cull {
            CullMode::None => None,
            CullMode::Back => Some(wgpu::Face::Back),
            CullMode::Front => Some(wgpu::Face::Front),
        };
        let blend = match key.blend {
            BlendMode::Opaque => wgpu::BlendState::REPLACE,
            BlendMode::AlphaBlend => wgpu::BlendState::ALPHA_BLENDING,
            BlendMode::Additive => wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent::OVER,
            },
        };

        let color_targets = [Some(wgpu::ColorTargetState {
            format: COLOR_FORMAT,
            blend: Some(blend),
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let (vertex_entry, fragment) = match key.pass {
            PassKind::Shadow => ("vs_shadow", None),
            PassKind::Forward => (
                "vs_main",
                Some(wgpu::FragmentState {
                    module: &self.render,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &color_targets,
                }),
            ),
        };

        let label = format!("{:?} pipeline", key);
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: Some(&self.render_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.render,
                entry_point: Some(vertex_entry),
                compilation_options: Default::default(),
                buffers: &[GpuVertex::desc()],
            },
            fragment,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: !key.blend.is_transparent(),
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: Default::default(),
            multiview: None,
            cache: None,
        })
    }
}

impl WgpuState {
    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn encode(&self, list: &CommandList) -> Result<wgpu::CommandBuffer, GpuError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(list.label()),
            });
        let buffers = self.buffers.lock();
        let textures = self.textures.lock();
        let pipelines = self.pipelines.lock();

        let lookup_buffer = |id: BufferId| {
            buffers
                .get(&id)
                .map(|entry| &entry.buffer)
                .ok_or(GpuError::UnknownBuffer(id))
        };
        let lookup_texture = |id: TextureId| textures.get(&id).ok_or(GpuError::UnknownTexture(id));

        let commands = list.commands();
        let mut index = 0;
        while index < commands.len() {
            match &commands[index] {
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(
                        lookup_buffer(*src)?,
                        *src_offset,
                        lookup_buffer(*dst)?,
                        *dst_offset,
                        *size,
                    );
                }
                GpuCommand::Dispatch(dispatch) => {
                    self.encode_skinning(&mut encoder, dispatch, &lookup_buffer)?;
                }
                GpuCommand::BeginPass(pass) => {
                    let end = commands[index + 1..]
                        .iter()
                        .position(|command| matches!(command, GpuCommand::EndPass))
                        .map_or(commands.len(), |offset| index + 1 + offset);
                    let body = &commands[index + 1..end];

                    let color = pass.color.map(lookup_texture).transpose()?;
                    let depth = lookup_texture(pass.depth)?;
                    let bind_group = self.pass_bind_group(pass, body, &lookup_buffer)?;

                    let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color
                        .map(|target| wgpu::RenderPassColorAttachment {
                            view: &target.view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color {
                                    r: pass.clear_color[0] as f64,
                                    g: pass.clear_color[1] as f64,
                                    b: pass.clear_color[2] as f64,
                                    a: pass.clear_color[3] as f64,
                                }),
                                store: wgpu::StoreOp::Store,
                            },
                        })
                        .into_iter()
                        .map(Some)
                        .collect();

                    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(&pass.label),
                        color_attachments: &color_attachments,
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &depth.view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Clear(1.0),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    render_pass.set_bind_group(0, &bind_group, &[]);

                    let mut draw_slot = 0u32;
                    for command in body {
                        match command {
                            GpuCommand::SetPipeline(pipeline) => {
                                let pipeline = pipelines
                                    .get(pipeline)
                                    .ok_or(GpuError::UnknownPipeline(*pipeline))?;
                                render_pass.set_pipeline(pipeline);
                            }
                            GpuCommand::DrawIndexed(draw) => {
                                render_pass.set_vertex_buffer(0, lookup_buffer(draw.vertex_buffer)?.slice(..));
                                render_pass.set_index_buffer(
                                    lookup_buffer(draw.index_buffer)?.slice(..),
                                    wgpu::IndexFormat::Uint32,
                                );
                                render_pass.draw_indexed(0..draw.index_count, 0, draw_slot..draw_slot + 1);
                                draw_slot += 1;
                            }
                            other => warn!("Ignoring {:?} inside render pass '{}'", other, pass.label),
                        }
                    }
                    index = end;
                }
                GpuCommand::SetPipeline(_) | GpuCommand::DrawIndexed(_) => {
                    return Err(GpuError::DrawOutsidePass);
                }
                GpuCommand::EndPass => {}
                GpuCommand::Blit { src, dst } => {
                    let source = lookup_texture(*src)?;
                    let destination = lookup_texture(*dst)?;
                    if source.desc.width != destination.desc.width
                        || source.desc.height != destination.desc.height
                    {
                        warn!(
                            "Skipping blit of '{}' into '{}': sizes differ",
                            source.desc.label, destination.desc.label
                        );
                    } else {
                        encoder.copy_texture_to_texture(
                            source.texture.as_image_copy(),
                            destination.texture.as_image_copy(),
                            source.texture.size(),
                        );
                    }
                }
            }
            index += 1;
        }

        Ok(encoder.finish())
    }

    fn encode_skinning<'a>(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        dispatch: &SkinningDispatch,
        lookup_buffer: &impl Fn(BufferId) -> Result<&'a wgpu::Buffer, GpuError>,
    ) -> Result<(), GpuError> {
        let params = [
            dispatch.bone_offset,
            dispatch.bone_count,
            dispatch.vertex_count,
            0u32,
        ];
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Skinning Params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Skinning Bind Group"),
            layout: &self.shaders.skinning_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: lookup_buffer(dispatch.source_vertices)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: lookup_buffer(dispatch.influences)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: lookup_buffer(dispatch.bone_matrices)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: lookup_buffer(dispatch.output)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Skinning Pass"),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&self.shaders.skinning_pipeline);
        compute_pass.set_bind_group(0, &bind_group, &[]);
        compute_pass.dispatch_workgroups(dispatch.vertex_count.div_ceil(SKINNING_WORKGROUP_SIZE), 1, 1);
        Ok(())
    }

    fn pass_bind_group<'a>(
        &self,
        pass: &PassDesc,
        body: &[GpuCommand],
        lookup_buffer: &impl Fn(BufferId) -> Result<&'a wgpu::Buffer, GpuError>,
    ) -> Result<wgpu::BindGroup, GpuError> {
        let mut records: Vec<[u32; 8]> = body
            .iter()
            .filter_map(|command| match command {
                GpuCommand::DrawIndexed(draw) => Some([
                    draw.transform_index,
                    draw.material_index,
                    pass.view_index,
                    pass.first_light,
                    pass.light_count,
                    0,
                    0,
                    0,
                ]),
                _ => None,
            })
            .collect();
        if records.is_empty() {
            records.push([0; 8]);
        }

        let draw_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Draw Records"),
                contents: bytemuck::cast_slice(&records),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let entries = [
            wgpu::BindGroupEntry {
                binding: 0,
                resource: lookup_buffer(pass.views)?.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: lookup_buffer(pass.transforms)?.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: lookup_buffer(pass.materials)?.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: lookup_buffer(pass.lights)?.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: draw_buffer.as_entire_binding(),
            },
        ];

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pass.label),
            layout: &self.shaders.pass_layout,
            entries: &entries,
        }))
    }
}

impl QueueBackend for WgpuState {
    fn execute(&self, queue: QueueKind, list: CommandList) {
        match self.encode(&list) {
            Ok(command_buffer) => {
                self.queue.submit([command_buffer]);
                debug!("{} queue: submitted '{}'", queue.label(), list.label());
            }
            Err(err) => error!(
                "{} queue: failed to encode '{}': {}",
                queue.label(),
                list.label(),
                err
            ),
        }
    }

    fn signal(&self, _queue: QueueKind, fence: &Fence, value: u64) {
        fence.schedule(value);
        let fence = fence.clone();
        self.queue
            .on_submitted_work_done(move || fence.signal(value));
    }

    fn wait(&self, _queue: QueueKind, fence: &Fence, value: u64) {
        fence.wait_scheduled(value);
    }
}

impl GpuDevice for WgpuGpu {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, GpuError> {
        let size = aligned_size(desc.size);
        let buffer = self.state.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size,
            usage: buffer_usages(desc.kind),
            mapped_at_creation: false,
        });

        let id = BufferId(self.state.allocate_id());
        self.state.buffers.lock().insert(
            id,
            WgpuBuffer {
                buffer,
                kind: desc.kind,
                label: desc.label.clone(),
                analytics: BufferAnalytics {
                    allocated_memory: size,
                    ..Default::default()
                },
            },
        );
        Ok(id)
    }

    fn resize_buffer(&self, buffer: BufferId, size: u64) -> Result<(), GpuError> {
        let mut buffers = self.state.buffers.lock();
        let entry = buffers.get_mut(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
        let size = aligned_size(size);
        entry.buffer = self.state.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&entry.label),
            size,
            usage: buffer_usages(entry.kind),
            mapped_at_creation: false,
        });
        entry.analytics = BufferAnalytics {
            allocated_memory: size,
            ..Default::default()
        };
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError> {
        self.state
            .buffers
            .lock()
            .get(&buffer)
            .map(|entry| entry.analytics.allocated_memory)
            .ok_or(GpuError::UnknownBuffer(buffer))
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let mut buffers = self.state.buffers.lock();
        let entry = buffers.get_mut(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
        let len = data.len() as u64;
        if offset + len > entry.analytics.allocated_memory {
            return Err(GpuError::OutOfBounds {
                buffer,
                offset,
                len,
                size: entry.analytics.allocated_memory,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        self.state.queue.write_buffer(&entry.buffer, offset, data);
        entry.analytics.used_memory = entry.analytics.used_memory.max(offset + len);
        entry.analytics.times_written += 1;
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>, GpuError> {
        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        let start = offset / align * align;
        let end = (offset + len).div_ceil(align) * align;

        let staging = {
            let buffers = self.state.buffers.lock();
            let entry = buffers.get(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
            if offset + len > entry.analytics.allocated_memory || end > entry.analytics.allocated_memory {
                return Err(GpuError::OutOfBounds {
                    buffer,
                    offset,
                    len,
                    size: entry.analytics.allocated_memory,
                });
            }
            if len == 0 {
                return Ok(Vec::new());
            }

            let staging = self.state.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Readback Staging"),
                size: end - start,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .state
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Readback"),
                });
            encoder.copy_buffer_to_buffer(&entry.buffer, start, &staging, 0, end - start);
            self.state.queue.submit([encoder.finish()]);
            staging
        };

        let (sender, receiver) = flume::bounded(1);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        let mapped = loop {
            if let Ok(result) = receiver.recv_timeout(Duration::from_millis(1)) {
                break result;
            }
            if self.state.lost.load(Ordering::Acquire) {
                return Err(GpuError::DeviceLost);
            }
        };
        if mapped.is_err() {
            return Err(GpuError::DeviceLost);
        }

        let bytes = {
            let view = staging.slice(..).get_mapped_range();
            let first = (offset - start) as usize;
            view[first..first + len as usize].to_vec()
        };
        staging.unmap();
        Ok(bytes)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        let texture = WgpuTexture::new(&self.state.device, desc.clone());
        let id = TextureId(self.state.allocate_id());
        self.state.textures.lock().insert(id, texture);
        Ok(id)
    }

    fn create_pipeline(&self, key: &RenderStateKey) -> Result<PipelineId, GpuError> {
        let pipeline = self
            .state
            .shaders
            .create_render_pipeline(&self.state.device, key);
        let id = PipelineId(self.state.allocate_id());
        self.state.pipelines.lock().insert(id, pipeline);
        Ok(id)
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        self.state.pipelines.lock().remove(&pipeline);
    }

    fn execute(&self, queue: QueueKind, list: CommandList) {
        self.queues.push(queue, QueueOp::Execute(list));
    }

    fn signal(&self, queue: QueueKind, fence: &Fence, value: u64) {
        self.queues.push(queue, QueueOp::Signal(fence.clone(), value));
    }

    fn wait(&self, queue: QueueKind, fence: &Fence, value: u64) {
        self.queues.push(queue, QueueOp::Wait(fence.clone(), value));
    }

    fn present(&self, vsync: bool) -> Result<u32, GpuError> {
        if self.state.lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost);
        }

        let mut chain = self.state.swap_chain.lock();
        if vsync {
            if let Some(last_present) = chain.last_present {
                let elapsed = last_present.elapsed();
                if elapsed < VSYNC_INTERVAL {
                    std::thread::sleep(VSYNC_INTERVAL - elapsed);
                }
            }
        }
        chain.last_present = Some(Instant::now());
        chain.index = (chain.index + 1) % SWAP_CHAIN_LENGTH as u32;
        Ok(chain.index)
    }

    fn back_buffer_index(&self) -> u32 {
        self.state.swap_chain.lock().index
    }

    fn back_buffer(&self) -> TextureId {
        let chain = self.state.swap_chain.lock();
        chain.images[chain.index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_copy_aligned() {
        assert_eq!(aligned_size(0), 4);
        assert_eq!(aligned_size(5), 8);
        assert_eq!(aligned_size(64), 64);
    }

    #[test]
    fn vertex_outputs_are_bindable_as_storage_and_vertex() {
        let usage = buffer_usages(BufferKind::ComputeVertexOutput);
        assert!(usage.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::VERTEX));
        assert!(!buffer_usages(BufferKind::Upload).contains(wgpu::BufferUsages::STORAGE));
    }
}
