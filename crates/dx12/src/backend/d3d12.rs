//! Direct3D 12 implementation of the backend traits.

use core::{any::Any, ffi::c_void, mem::ManuallyDrop, ptr, time::Duration};
use std::{sync::Arc, time::Instant};

use anyhow::{Context, bail, ensure};
use ff_common::{Format, PointSize, RectSize, Rotation};
use parking_lot::{Mutex, RwLock};
use raw_window_handle::RawWindowHandle;
use scopeguard::defer;
use tracing::{debug, info, warn};
use windows::{
    Win32::{
        Foundation::{CloseHandle, HANDLE, HWND, WAIT_OBJECT_0, WAIT_TIMEOUT},
        Graphics::{
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            Direct3D12::*,
            Dxgi::{Common::*, *},
        },
        System::Threading::{CreateEventA, WaitForSingleObject},
    },
    core::{BOOL, Interface},
};

use super::{
    AllocationInfo, ClearValue, CommandAllocatorBackend, CommandListBackend,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, DeviceBackend, FenceBackend, HeapBackend, HeapKind,
    PresentStatus, QueueBackend, QueueKind, ResourceBackend, ResourceDesc, ResourceFlags,
    ResourceStates, SwapChainBackend, SwapChainDesc, TextureFootprint,
};
use crate::error::Error;

// Cloning COM objects for ManuallyDrop<Option<T>> never decreases the ref count and leaks
unsafe fn wrap_com_manually_drop<T: Interface>(inf: &T) -> ManuallyDrop<Option<T>> {
    unsafe { core::mem::transmute_copy(inf) }
}

struct Native {
    factory: IDXGIFactory4,
    device: ID3D12Device,
}

impl Native {
    fn create(debug_layer: bool) -> anyhow::Result<(Self, String)> {
        if debug_layer {
            let mut debug: Option<ID3D12Debug> = None;
            match unsafe { D3D12GetDebugInterface(&mut debug) } {
                Ok(()) => {
                    if let Some(debug) = debug {
                        unsafe { debug.EnableDebugLayer() };
                    }
                }
                Err(err) => warn!("debug layer unavailable: {err}"),
            }
        }

        let factory: IDXGIFactory4 =
            unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0))? };
        let adapter = hardware_adapter(&factory)
            .or_else(|_| unsafe { factory.EnumWarpAdapter::<IDXGIAdapter1>() })
            .context("no usable adapter")?;
        let name = unsafe { adapter.GetDesc1() }
            .map(|desc| {
                let len = desc
                    .Description
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(desc.Description.len());
                String::from_utf16_lossy(&desc.Description[..len])
            })
            .unwrap_or_else(|_| "unknown adapter".to_string());

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device)? };
        let device = device.context("failed to create device")?;

        Ok((Self { factory, device }, name))
    }
}

fn hardware_adapter(factory: &IDXGIFactory4) -> anyhow::Result<IDXGIAdapter1> {
    for i in 0.. {
        let adapter = unsafe { factory.EnumAdapters1(i)? };
        let desc = unsafe { adapter.GetDesc1()? };
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            continue;
        }

        return Ok(adapter);
    }

    bail!("no hardware adapter")
}

/// A D3D12 device on the first hardware adapter, or WARP if there is none.
pub struct D3d12Device {
    native: RwLock<Native>,
    name: String,
    debug_layer: bool,
}

unsafe impl Send for D3d12Device {}
unsafe impl Sync for D3d12Device {}

impl D3d12Device {
    #[tracing::instrument]
    pub fn new(debug_layer: bool) -> anyhow::Result<Self> {
        let (native, name) = Native::create(debug_layer)?;
        info!("using adapter {name}");

        Ok(Self {
            native: RwLock::new(native),
            name,
            debug_layer,
        })
    }

    pub fn device(&self) -> ID3D12Device {
        self.native.read().device.clone()
    }
}

fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

fn dxgi_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Unknown => DXGI_FORMAT_UNKNOWN,
        Format::R8Unorm => DXGI_FORMAT_R8_UNORM,
        Format::R8G8Unorm => DXGI_FORMAT_R8G8_UNORM,
        Format::R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::R8G8B8A8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        Format::B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::B8G8R8A8UnormSrgb => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        Format::R16G16B16A16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        Format::R32Uint => DXGI_FORMAT_R32_UINT,
        Format::R32Float => DXGI_FORMAT_R32_FLOAT,
        Format::R32G32B32A32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        Format::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        Format::Bc1Unorm => DXGI_FORMAT_BC1_UNORM,
        Format::Bc2Unorm => DXGI_FORMAT_BC2_UNORM,
        Format::Bc3Unorm => DXGI_FORMAT_BC3_UNORM,
    }
}

fn resource_states(states: ResourceStates) -> D3D12_RESOURCE_STATES {
    D3D12_RESOURCE_STATES(states.bits() as i32)
}

fn native_desc(desc: &ResourceDesc) -> D3D12_RESOURCE_DESC {
    let buffer = desc.is_buffer();
    D3D12_RESOURCE_DESC {
        Dimension: if buffer {
            D3D12_RESOURCE_DIMENSION_BUFFER
        } else {
            D3D12_RESOURCE_DIMENSION_TEXTURE2D
        },
        Alignment: 0,
        Width: desc.width,
        Height: desc.height,
        DepthOrArraySize: desc.array_size,
        MipLevels: desc.mip_levels,
        Format: if buffer {
            DXGI_FORMAT_UNKNOWN
        } else {
            dxgi_format(desc.format)
        },
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: if buffer {
            D3D12_TEXTURE_LAYOUT_ROW_MAJOR
        } else {
            D3D12_TEXTURE_LAYOUT_UNKNOWN
        },
        Flags: D3D12_RESOURCE_FLAGS(desc.flags.bits() as i32),
    }
}

fn native_clear_value(value: &ClearValue) -> D3D12_CLEAR_VALUE {
    D3D12_CLEAR_VALUE {
        Format: dxgi_format(value.format),
        Anonymous: D3D12_CLEAR_VALUE_0 { Color: value.color },
    }
}

fn buffer_desc(size: u64) -> D3D12_RESOURCE_DESC {
    native_desc(&ResourceDesc::buffer(size))
}

fn d3d12_resource(resource: &dyn ResourceBackend) -> anyhow::Result<&ID3D12Resource> {
    resource
        .as_any()
        .downcast_ref::<D3d12Resource>()
        .map(|resource| &resource.resource)
        .context("resource was not created by the d3d12 device")
}

fn d3d12_heap(heap: &dyn HeapBackend) -> anyhow::Result<&D3d12Heap> {
    heap.as_any()
        .downcast_ref::<D3d12Heap>()
        .context("heap was not created by the d3d12 device")
}

/// The buffer spanning a CPU-visible heap, which copies address.
fn staging_buffer(heap: &dyn HeapBackend) -> anyhow::Result<&ID3D12Resource> {
    match &d3d12_heap(heap)?.memory {
        HeapMemory::Staging { buffer, .. } => Ok(buffer),
        HeapMemory::Placed(_) => bail!("heap is not CPU visible"),
    }
}

fn d3d12_fence(fence: &dyn FenceBackend) -> anyhow::Result<&ID3D12Fence> {
    fence
        .as_any()
        .downcast_ref::<D3d12Fence>()
        .map(|fence| &fence.fence)
        .context("fence was not created by the d3d12 device")
}

fn d3d12_allocator(
    allocator: &dyn CommandAllocatorBackend,
) -> anyhow::Result<&ID3D12CommandAllocator> {
    allocator
        .as_any()
        .downcast_ref::<D3d12CommandAllocator>()
        .map(|allocator| &allocator.allocator)
        .context("command allocator was not created by the d3d12 device")
}

impl DeviceBackend for D3d12Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_removed(&self) -> bool {
        unsafe { self.native.read().device.GetDeviceRemovedReason() }.is_err()
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut native = self.native.write();
        if let Err(err) = unsafe { native.device.GetDeviceRemovedReason() } {
            warn!("device removed: {err}");
        }

        let (new_native, name) = Native::create(self.debug_layer)?;
        debug!("device recreated on {name}");
        *native = new_native;
        Ok(())
    }

    fn create_queue(&self, kind: QueueKind) -> anyhow::Result<Box<dyn QueueBackend>> {
        let queue: ID3D12CommandQueue = unsafe {
            self.native
                .read()
                .device
                .CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                    Type: list_type(kind),
                    Priority: D3D12_COMMAND_QUEUE_PRIORITY_NORMAL.0,
                    Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                    NodeMask: 0,
                })?
        };

        Ok(Box::new(D3d12Queue { queue, kind }))
    }

    fn create_fence(&self, initial_value: u64) -> anyhow::Result<Box<dyn FenceBackend>> {
        let fence: ID3D12Fence = unsafe {
            self.native
                .read()
                .device
                .CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)?
        };
        let event = unsafe { CreateEventA(None, false, false, None)? };

        Ok(Box::new(D3d12Fence {
            fence,
            event: Mutex::new(event),
        }))
    }

    fn create_command_allocator(
        &self,
        kind: QueueKind,
    ) -> anyhow::Result<Box<dyn CommandAllocatorBackend>> {
        let allocator: ID3D12CommandAllocator = unsafe {
            self.native
                .read()
                .device
                .CreateCommandAllocator(list_type(kind))?
        };

        Ok(Box::new(D3d12CommandAllocator { allocator }))
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &dyn CommandAllocatorBackend,
    ) -> anyhow::Result<Box<dyn CommandListBackend>> {
        let device = self.device();
        let allocator = d3d12_allocator(allocator)?;
        let list = unsafe {
            device.CreateCommandList::<_, _, ID3D12GraphicsCommandList>(
                0,
                list_type(kind),
                allocator,
                None,
            )?
        };
        let rtv_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                NumDescriptors: 1,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })?
        };

        Ok(Box::new(D3d12CommandList {
            device,
            list,
            rtv_heap,
            error: None,
        }))
    }

    fn create_heap(&self, kind: HeapKind, size: u64) -> anyhow::Result<Box<dyn HeapBackend>> {
        let device = self.device();
        let memory = match kind {
            HeapKind::Upload | HeapKind::Readback => {
                let (heap_type, state) = if kind == HeapKind::Upload {
                    (D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ)
                } else {
                    (D3D12_HEAP_TYPE_READBACK, D3D12_RESOURCE_STATE_COPY_DEST)
                };

                let mut buffer: Option<ID3D12Resource> = None;
                unsafe {
                    device.CreateCommittedResource(
                        &D3D12_HEAP_PROPERTIES {
                            Type: heap_type,
                            ..Default::default()
                        },
                        D3D12_HEAP_FLAG_NONE,
                        &buffer_desc(size),
                        state,
                        None,
                        &mut buffer,
                    )?
                };
                let buffer = buffer.context("failed to create staging buffer")?;

                let mut mapped = ptr::null_mut::<c_void>();
                unsafe { buffer.Map(0, None, Some(&raw mut mapped))? };
                ensure!(!mapped.is_null(), "staging buffer mapped to null");

                HeapMemory::Staging {
                    buffer,
                    mapped: mapped.cast(),
                }
            }

            HeapKind::Buffers | HeapKind::Textures => {
                let flags = if kind == HeapKind::Buffers {
                    D3D12_HEAP_FLAG_ALLOW_ONLY_BUFFERS
                } else {
                    D3D12_HEAP_FLAG_ALLOW_ONLY_NON_RT_DS_TEXTURES
                };

                let mut heap: Option<ID3D12Heap> = None;
                unsafe {
                    device.CreateHeap(
                        &D3D12_HEAP_DESC {
                            SizeInBytes: size,
                            Properties: D3D12_HEAP_PROPERTIES {
                                Type: D3D12_HEAP_TYPE_DEFAULT,
                                ..Default::default()
                            },
                            Alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
                            Flags: flags,
                        },
                        &mut heap,
                    )?
                };

                HeapMemory::Placed(heap.context("failed to create heap")?)
            }
        };

        Ok(Box::new(D3d12Heap { kind, size, memory }))
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let info = unsafe {
            self.native
                .read()
                .device
                .GetResourceAllocationInfo(0, &[native_desc(desc)])
        };

        // u64::MAX size means the description is invalid
        if info.SizeInBytes == u64::MAX {
            return AllocationInfo::default();
        }

        AllocationInfo {
            size: info.SizeInBytes,
            alignment: info.Alignment,
        }
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        state: ResourceStates,
        clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        let clear_value = clear_value.map(native_clear_value);

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.native.read().device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_DEFAULT,
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &native_desc(desc),
                resource_states(state),
                clear_value.as_ref().map(|value| value as *const _),
                &mut resource,
            )?
        };

        Ok(Arc::new(D3d12Resource::new(
            resource.context("failed to create committed resource")?,
            *desc,
        )))
    }

    fn create_placed_resource(
        &self,
        heap: &dyn HeapBackend,
        offset: u64,
        desc: &ResourceDesc,
        state: ResourceStates,
        clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        let HeapMemory::Placed(ref heap) = d3d12_heap(heap)?.memory else {
            bail!("resources cannot be placed in staging heaps");
        };
        let clear_value = clear_value.map(native_clear_value);

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.native.read().device.CreatePlacedResource(
                heap,
                offset,
                &native_desc(desc),
                resource_states(state),
                clear_value.as_ref().map(|value| value as *const _),
                &mut resource,
            )?
        };

        Ok(Arc::new(D3d12Resource::new(
            resource.context("failed to create placed resource")?,
            *desc,
        )))
    }

    fn create_swap_chain(
        &self,
        queue: &dyn QueueBackend,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> anyhow::Result<Box<dyn SwapChainBackend>> {
        let RawWindowHandle::Win32(handle) = window else {
            bail!("unsupported window handle {window:?}");
        };
        let hwnd = HWND(handle.hwnd.get() as *mut c_void);
        let queue = queue
            .as_any()
            .downcast_ref::<D3d12Queue>()
            .context("queue was not created by the d3d12 device")?;

        let flags = DXGI_SWAP_CHAIN_FLAG_FRAME_LATENCY_WAITABLE_OBJECT.0
            | DXGI_SWAP_CHAIN_FLAG_ALLOW_MODE_SWITCH.0;
        let factory = self.native.read().factory.clone();
        let swap_chain = unsafe {
            factory.CreateSwapChainForHwnd(
                &queue.queue,
                hwnd,
                &DXGI_SWAP_CHAIN_DESC1 {
                    Width: desc.width,
                    Height: desc.height,
                    Format: dxgi_format(desc.format),
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                    BufferCount: desc.buffer_count as u32,
                    Scaling: DXGI_SCALING_STRETCH,
                    SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    AlphaMode: DXGI_ALPHA_MODE_IGNORE,
                    Flags: flags as u32,
                    ..Default::default()
                },
                None,
                None,
            )?
        }
        .cast::<IDXGISwapChain3>()?;

        // full screen transitions go through set_full_screen so they are applied on
        // the render thread
        unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER)? };

        unsafe { swap_chain.SetMaximumFrameLatency(1)? };
        let latency = unsafe { swap_chain.GetFrameLatencyWaitableObject() };

        Ok(Box::new(D3d12SwapChain {
            swap_chain,
            latency,
            flags: DXGI_SWAP_CHAIN_FLAG(flags),
            format: desc.format,
            buffer_count: desc.buffer_count,
        }))
    }
}

pub struct D3d12Queue {
    queue: ID3D12CommandQueue,
    kind: QueueKind,
}

unsafe impl Send for D3d12Queue {}
unsafe impl Sync for D3d12Queue {}

impl D3d12Queue {
    pub fn queue(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

impl QueueBackend for D3d12Queue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, lists: &[&dyn CommandListBackend]) -> anyhow::Result<()> {
        let lists = lists
            .iter()
            .map(|list| {
                list.as_any()
                    .downcast_ref::<D3d12CommandList>()
                    .map(|list| Some(list.list.clone().into()))
                    .context("command list was not created by the d3d12 device")
            })
            .collect::<anyhow::Result<Vec<Option<ID3D12CommandList>>>>()?;

        unsafe { self.queue.ExecuteCommandLists(&lists) };
        Ok(())
    }

    fn signal(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()> {
        unsafe { self.queue.Signal(d3d12_fence(fence)?, value)? };
        Ok(())
    }

    fn wait(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()> {
        unsafe { self.queue.Wait(d3d12_fence(fence)?, value)? };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct D3d12Fence {
    fence: ID3D12Fence,
    /// One completion event per fence, so waits on it are serialized.
    event: Mutex<HANDLE>,
}

unsafe impl Send for D3d12Fence {}
unsafe impl Sync for D3d12Fence {}

impl FenceBackend for D3d12Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> anyhow::Result<bool> {
        let event = self.event.lock();

        let completed = self.completed_value();
        if completed == u64::MAX {
            return Err(Error::DeviceLost.into());
        }
        if completed >= value {
            return Ok(true);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        unsafe { self.fence.SetEventOnCompletion(value, *event)? };
        loop {
            let millis = deadline.map_or(u32::MAX, |deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u32::MAX as u128 - 1) as u32
            });
            let res = unsafe { WaitForSingleObject(*event, millis) };

            let completed = self.completed_value();
            if completed == u64::MAX {
                return Err(Error::DeviceLost.into());
            }
            if completed >= value {
                return Ok(true);
            }

            if res == WAIT_TIMEOUT {
                return Ok(false);
            }
            // an earlier timed out wait can leave a stale signal behind
            ensure!(res == WAIT_OBJECT_0, "fence wait failed: {res:?}");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for D3d12Fence {
    fn drop(&mut self) {
        _ = unsafe { CloseHandle(*self.event.get_mut()) };
    }
}

pub struct D3d12CommandAllocator {
    allocator: ID3D12CommandAllocator,
}

unsafe impl Send for D3d12CommandAllocator {}

impl CommandAllocatorBackend for D3d12CommandAllocator {
    fn reset(&mut self) -> anyhow::Result<()> {
        unsafe { self.allocator.Reset()? };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct D3d12CommandList {
    device: ID3D12Device,
    list: ID3D12GraphicsCommandList,
    /// Scratch descriptor for clears. Clears read it while recording, so one is enough.
    rtv_heap: ID3D12DescriptorHeap,
    /// First recording error, reported on close.
    error: Option<anyhow::Error>,
}

unsafe impl Send for D3d12CommandList {}

impl D3d12CommandList {
    pub fn list(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }

    fn record(&mut self, f: impl FnOnce(&ID3D12GraphicsCommandList) -> anyhow::Result<()>) {
        if let Err(err) = f(&self.list) {
            if self.error.is_none() {
                self.error = Some(err);
            }
        }
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: ResourceStates,
    after: ResourceStates,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { wrap_com_manually_drop(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: resource_states(before),
                StateAfter: resource_states(after),
            }),
        },
    }
}

fn placed_footprint(
    buffer: &ID3D12Resource,
    footprint: &TextureFootprint,
) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { wrap_com_manually_drop(buffer) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: footprint.offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: dxgi_format(footprint.format),
                    Width: footprint.width,
                    Height: footprint.height,
                    Depth: 1,
                    RowPitch: footprint.row_pitch,
                },
            },
        },
    }
}

fn subresource_location(resource: &ID3D12Resource, sub_index: u32) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { wrap_com_manually_drop(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: sub_index,
        },
    }
}

impl CommandListBackend for D3d12CommandList {
    fn reset(&mut self, allocator: &dyn CommandAllocatorBackend) -> anyhow::Result<()> {
        self.error = None;
        unsafe { self.list.Reset(d3d12_allocator(allocator)?, None)? };
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let res = unsafe { self.list.Close() };
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        res?;
        Ok(())
    }

    fn barrier(
        &mut self,
        resource: &dyn ResourceBackend,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        self.record(|list| {
            let barrier = transition_barrier(d3d12_resource(resource)?, before, after);
            unsafe { list.ResourceBarrier(&[barrier]) };
            Ok(())
        });
    }

    fn aliasing_barrier(
        &mut self,
        before: Option<&dyn ResourceBackend>,
        after: &dyn ResourceBackend,
    ) {
        self.record(|list| {
            let before = match before {
                Some(before) => unsafe { wrap_com_manually_drop(d3d12_resource(before)?) },
                None => ManuallyDrop::new(None),
            };
            let barrier = D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_ALIASING,
                Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    Aliasing: ManuallyDrop::new(D3D12_RESOURCE_ALIASING_BARRIER {
                        pResourceBefore: before,
                        pResourceAfter: unsafe { wrap_com_manually_drop(d3d12_resource(after)?) },
                    }),
                },
            };

            unsafe { list.ResourceBarrier(&[barrier]) };
            Ok(())
        });
    }

    fn copy_resource(&mut self, dst: &dyn ResourceBackend, src: &dyn ResourceBackend) {
        self.record(|list| {
            unsafe { list.CopyResource(d3d12_resource(dst)?, d3d12_resource(src)?) };
            Ok(())
        });
    }

    fn copy_buffer_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        dst_offset: u64,
        src: &dyn HeapBackend,
        src_offset: u64,
        size: u64,
    ) {
        self.record(|list| {
            unsafe {
                list.CopyBufferRegion(
                    d3d12_resource(dst)?,
                    dst_offset,
                    staging_buffer(src)?,
                    src_offset,
                    size,
                )
            };
            Ok(())
        });
    }

    fn copy_buffer_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        dst_offset: u64,
        src: &dyn ResourceBackend,
        src_offset: u64,
        size: u64,
    ) {
        self.record(|list| {
            unsafe {
                list.CopyBufferRegion(
                    staging_buffer(dst)?,
                    dst_offset,
                    d3d12_resource(src)?,
                    src_offset,
                    size,
                )
            };
            Ok(())
        });
    }

    fn copy_texture_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        sub_index: u32,
        pos: PointSize,
        src: &dyn HeapBackend,
        footprint: &TextureFootprint,
    ) {
        self.record(|list| {
            let dst = subresource_location(d3d12_resource(dst)?, sub_index);
            let src = placed_footprint(staging_buffer(src)?, footprint);
            unsafe { list.CopyTextureRegion(&dst, pos.x as u32, pos.y as u32, 0, &src, None) };
            Ok(())
        });
    }

    fn copy_texture_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        footprint: &TextureFootprint,
        src: &dyn ResourceBackend,
        sub_index: u32,
        rect: RectSize,
    ) {
        self.record(|list| {
            let dst = placed_footprint(staging_buffer(dst)?, footprint);
            let src = subresource_location(d3d12_resource(src)?, sub_index);
            let src_box = D3D12_BOX {
                left: rect.left as u32,
                top: rect.top as u32,
                front: 0,
                right: rect.right as u32,
                bottom: rect.bottom as u32,
                back: 1,
            };

            unsafe { list.CopyTextureRegion(&dst, 0, 0, 0, &src, Some(&raw const src_box)) };
            Ok(())
        });
    }

    fn clear_render_target(&mut self, target: &dyn ResourceBackend, color: [f32; 4]) {
        let device = self.device.clone();
        let rtv = unsafe { self.rtv_heap.GetCPUDescriptorHandleForHeapStart() };
        self.record(|list| {
            unsafe {
                device.CreateRenderTargetView(d3d12_resource(target)?, None, rtv);
                list.ClearRenderTargetView(rtv, color.as_ptr(), None);
            }
            Ok(())
        });
    }

    fn discard_resource(&mut self, resource: &dyn ResourceBackend) {
        self.record(|list| {
            unsafe { list.DiscardResource(d3d12_resource(resource)?, None) };
            Ok(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum HeapMemory {
    /// Upload and readback memory is a single mapped buffer copies address by offset.
    Staging {
        buffer: ID3D12Resource,
        mapped: *mut u8,
    },
    Placed(ID3D12Heap),
}

pub struct D3d12Heap {
    kind: HeapKind,
    size: u64,
    memory: HeapMemory,
}

// mapped pointer stays valid until the buffer is released
unsafe impl Send for D3d12Heap {}
unsafe impl Sync for D3d12Heap {}

impl D3d12Heap {
    fn mapped(&self, offset: u64, len: usize) -> anyhow::Result<*mut u8> {
        let HeapMemory::Staging { mapped, .. } = self.memory else {
            bail!("heap is not CPU visible");
        };
        ensure!(
            offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.size),
            "heap access out of bounds"
        );

        Ok(unsafe { mapped.add(offset as usize) })
    }
}

impl HeapBackend for D3d12Heap {
    fn kind(&self) -> HeapKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let dst = self.mapped(offset, data.len())?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> anyhow::Result<()> {
        let src = self.mapped(offset, out.len())?;
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn gpu_address(&self, offset: u64) -> Option<u64> {
        match &self.memory {
            HeapMemory::Staging { buffer, .. } => {
                Some(unsafe { buffer.GetGPUVirtualAddress() } + offset)
            }
            HeapMemory::Placed(_) => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for D3d12Heap {
    fn drop(&mut self) {
        if let HeapMemory::Staging { ref buffer, .. } = self.memory {
            unsafe { buffer.Unmap(0, None) };
        }
    }
}

pub struct D3d12Resource {
    resource: ID3D12Resource,
    desc: ResourceDesc,
}

unsafe impl Send for D3d12Resource {}
unsafe impl Sync for D3d12Resource {}

impl D3d12Resource {
    fn new(resource: ID3D12Resource, desc: ResourceDesc) -> Self {
        Self { resource, desc }
    }

    pub fn resource(&self) -> &ID3D12Resource {
        &self.resource
    }
}

impl ResourceBackend for D3d12Resource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn gpu_address(&self) -> Option<u64> {
        self.desc
            .is_buffer()
            .then(|| unsafe { self.resource.GetGPUVirtualAddress() })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct D3d12SwapChain {
    swap_chain: IDXGISwapChain3,
    latency: HANDLE,
    flags: DXGI_SWAP_CHAIN_FLAG,
    format: Format,
    buffer_count: usize,
}

unsafe impl Send for D3d12SwapChain {}
unsafe impl Sync for D3d12SwapChain {}

impl SwapChainBackend for D3d12SwapChain {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer_index(&self) -> usize {
        unsafe { self.swap_chain.GetCurrentBackBufferIndex() as usize }
    }

    fn buffer(&self, index: usize) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        let buffer: ID3D12Resource = unsafe { self.swap_chain.GetBuffer(index as u32)? };
        let native = unsafe { buffer.GetDesc() };
        let desc = ResourceDesc::texture_2d(self.format, native.Width, native.Height, 1, 1)
            .with_flags(ResourceFlags::ALLOW_RENDER_TARGET);

        Ok(Arc::new(D3d12Resource::new(buffer, desc)))
    }

    fn present(&self, sync_interval: u32) -> anyhow::Result<PresentStatus> {
        let hr = unsafe { self.swap_chain.Present(sync_interval, DXGI_PRESENT(0)) };
        if hr == DXGI_ERROR_DEVICE_REMOVED || hr == DXGI_ERROR_DEVICE_RESET {
            return Ok(PresentStatus::DeviceLost);
        }
        if hr == DXGI_STATUS_OCCLUDED {
            return Ok(PresentStatus::Occluded);
        }

        hr.ok()?;
        Ok(PresentStatus::Presented)
    }

    fn resize_buffers(&self, width: u32, height: u32) -> anyhow::Result<()> {
        unsafe {
            self.swap_chain.ResizeBuffers(
                self.buffer_count as u32,
                width,
                height,
                DXGI_FORMAT_UNKNOWN,
                self.flags,
            )?
        };

        Ok(())
    }

    fn set_rotation(&self, rotation: Rotation) -> anyhow::Result<()> {
        let rotation = match rotation {
            Rotation::Rotate0 => DXGI_MODE_ROTATION_IDENTITY,
            Rotation::Rotate90 => DXGI_MODE_ROTATION_ROTATE90,
            Rotation::Rotate180 => DXGI_MODE_ROTATION_ROTATE180,
            Rotation::Rotate270 => DXGI_MODE_ROTATION_ROTATE270,
        };

        unsafe { self.swap_chain.SetRotation(rotation)? };
        Ok(())
    }

    fn wait_frame_latency(&self, timeout: Duration) -> anyhow::Result<bool> {
        if self.latency.is_invalid() {
            return Ok(true);
        }

        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
        Ok(unsafe { WaitForSingleObject(self.latency, millis) } == WAIT_OBJECT_0)
    }

    fn full_screen(&self) -> anyhow::Result<bool> {
        let mut full_screen = BOOL(0);
        unsafe {
            self.swap_chain
                .GetFullscreenState(Some(&raw mut full_screen), None)?
        };

        Ok(full_screen.as_bool())
    }

    fn set_full_screen(&self, value: bool) -> anyhow::Result<()> {
        unsafe { self.swap_chain.SetFullscreenState(value, None)? };
        Ok(())
    }
}

impl Drop for D3d12SwapChain {
    fn drop(&mut self) {
        if self.latency.is_invalid() {
            return;
        }

        let latency = self.latency;
        defer!({
            _ = unsafe { CloseHandle(latency) };
        });
        // leaving full screen is required before release
        _ = unsafe { self.swap_chain.SetFullscreenState(false, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_conversion() {
        let desc = native_desc(
            &ResourceDesc::texture_2d(Format::B8G8R8A8Unorm, 64, 32, 2, 3)
                .with_flags(ResourceFlags::ALLOW_RENDER_TARGET),
        );
        assert_eq!(desc.Dimension, D3D12_RESOURCE_DIMENSION_TEXTURE2D);
        assert_eq!(desc.Format, DXGI_FORMAT_B8G8R8A8_UNORM);
        assert_eq!(desc.Flags, D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET);
        assert_eq!(desc.DepthOrArraySize, 2);
        assert_eq!(desc.MipLevels, 3);

        let desc = buffer_desc(1024);
        assert_eq!(desc.Layout, D3D12_TEXTURE_LAYOUT_ROW_MAJOR);
        assert_eq!(desc.Format, DXGI_FORMAT_UNKNOWN);
        assert_eq!(
            resource_states(ResourceStates::COPY_DEST),
            D3D12_RESOURCE_STATE_COPY_DEST
        );
    }
}
