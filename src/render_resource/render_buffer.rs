use crate::vk_context::device::WrappedDeviceRef;
use anyhow::{anyhow, bail, Result};
use ash::vk::{Buffer, BufferCopy, BufferCreateInfo, BufferDeviceAddressInfo, BufferUsageFlags, DeviceAddress, DeviceSize, SharingMode};
use core::slice;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator as GpuAllocator, AllocatorCreateDesc};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use log::error;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::{cmp, ptr};

pub struct RenderBuffer {
    pub device: WrappedDeviceRef,
    pub gpu_allocator: GpuAllocatorRef,
    pub memory_location: MemoryLocation,
    pub size: DeviceSize,
    pub buffer: Buffer,
    pub allocation: Option<Allocation>,
}

impl RenderBuffer {
    pub fn new(device: WrappedDeviceRef, gpu_allocator: GpuAllocatorRef, memory_location: MemoryLocation, size: DeviceSize, buffer: Buffer, allocation: Allocation) -> Self {
        Self {
            device,
            gpu_allocator,
            memory_location,
            size,
            buffer,
            allocation: Some(allocation),
        }
    }

    pub fn device_addr(&self) -> DeviceAddress {
        let info = BufferDeviceAddressInfo::default().buffer(self.buffer);

        unsafe { self.device.get_buffer_device_address(&info) }
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        let allocation = self.allocation.as_ref().ok_or_else(|| anyhow!("Buffer memory already released"))?;

        Ok(allocation.mapped_ptr().ok_or_else(|| anyhow!("Failed to get mapped pointer for CPU accessible buffer"))?.as_ptr() as *mut u8)
    }
}

impl Drop for RenderBuffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_buffer(self.buffer, None) };

        if let Some(allocation) = self.allocation.take() {
            match self.gpu_allocator.lock() {
                Ok(mut gpu_allocator) => {
                    if let Err(error) = gpu_allocator.free(allocation) {
                        error!("Failed to free buffer allocation: {}", error);
                    }
                }
                Err(_) => error!("GPU allocator is poisoned, leaking buffer allocation"),
            }
        }
    }
}

pub type GpuAllocatorRef = Arc<Mutex<GpuAllocator>>;

#[derive(Clone)]
pub struct RenderBufferAllocatorRef(Arc<RenderBufferAllocator>);

impl Deref for RenderBufferAllocatorRef {
    type Target = Arc<RenderBufferAllocator>;

    fn deref(&self) -> &Arc<RenderBufferAllocator> {
        &self.0
    }
}

impl From<RenderBufferAllocator> for RenderBufferAllocatorRef {
    fn from(allocator: RenderBufferAllocator) -> Self {
        Self(Arc::new(allocator))
    }
}

pub struct RenderBufferAllocator {
    device: WrappedDeviceRef,
    gpu_allocator: GpuAllocatorRef,
}

impl RenderBufferAllocator {
    pub fn new(device: WrappedDeviceRef) -> Result<Self> {
        let debug_settings = AllocatorDebugSettings {
            log_leaks_on_shutdown: true,
            log_memory_information: false,
            log_allocations: false,
            ..Default::default()
        };

        let gpu_allocator_desc = AllocatorCreateDesc {
            instance: device.instance.clone(),
            device: device.handle.clone(),
            physical_device: device.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        };

        let gpu_allocator = GpuAllocator::new(&gpu_allocator_desc)?;

        Ok(Self {
            device,
            gpu_allocator: Arc::new(Mutex::new(gpu_allocator)),
        })
    }

    pub fn allocate(&self, size: DeviceSize, usage: BufferUsageFlags, location: MemoryLocation) -> Result<RenderBuffer> {
        self.allocate_aligned(size, usage, location, 1)
    }

    /// Allocates a buffer whose memory offset is a multiple of `alignment` on top of the driver's own requirement.
    pub fn allocate_aligned(&self, size: DeviceSize, usage: BufferUsageFlags, location: MemoryLocation, alignment: DeviceSize) -> Result<RenderBuffer> {
        if !alignment.is_power_of_two() {
            bail!("Buffer alignment {} is not a power of two", alignment);
        }

        unsafe {
            let buffer_info = BufferCreateInfo::default().size(size).usage(usage).sharing_mode(SharingMode::EXCLUSIVE);

            let buffer = self.device.create_buffer(&buffer_info, None)?;
            let mut requirements = self.device.get_buffer_memory_requirements(buffer);
            requirements.alignment = cmp::max(requirements.alignment, alignment);

            let allocate_create_desc = AllocationCreateDesc {
                name: "buffer allocation",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            };

            let allocation = match self.lock_gpu_allocator()?.allocate(&allocate_create_desc) {
                Ok(allocation) => allocation,
                Err(error) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(error.into());
                }
            };

            if let Err(result) = self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) {
                self.device.destroy_buffer(buffer, None);
                self.lock_gpu_allocator()?.free(allocation)?;
                return Err(result.into());
            }

            Ok(RenderBuffer::new(self.device.clone(), self.gpu_allocator.clone(), location, size, buffer, allocation))
        }
    }

    pub fn upload_data<T: Copy>(&self, buffer: &RenderBuffer, data: &[T]) -> Result<()> {
        let data_ptr = data.as_ptr() as *const u8;
        let data_size = cmp::min(size_of_val(data), buffer.size as usize);

        if buffer.memory_location != MemoryLocation::GpuOnly {
            unsafe { ptr::copy_nonoverlapping(data_ptr, buffer.mapped_ptr()?, data_size) };
        } else {
            let staging_buffer = self.allocate(buffer.size, BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu)?;

            unsafe { ptr::copy_nonoverlapping(data_ptr, staging_buffer.mapped_ptr()?, data_size) };

            self.device.single_time_command(|device, command_buffer| unsafe {
                let regions = BufferCopy::default().size(buffer.size).src_offset(0).dst_offset(0);

                device.handle.cmd_copy_buffer(command_buffer, staging_buffer.buffer, buffer.buffer, slice::from_ref(&regions));
            })?;
        }

        Ok(())
    }

    pub fn download_data<T: Copy>(&self, buffer: &RenderBuffer) -> Result<Vec<T>> {
        let type_size = size_of::<T>();

        if type_size == 0 {
            bail!("Cannot download data for zero-sized type <T>");
        }
        if buffer.size == 0 {
            return Ok(vec![]);
        }
        if buffer.size % type_size as u64 != 0 {
            bail!("Buffer size {} is not aligned with the size of <T> {}", buffer.size, type_size);
        }

        let element_count = (buffer.size / type_size as DeviceSize) as usize;
        let dst_size = buffer.size as usize;

        let mut data: Vec<T> = Vec::with_capacity(element_count);
        let dst_ptr = data.as_mut_ptr() as *mut u8;

        if buffer.memory_location != MemoryLocation::GpuOnly {
            unsafe { ptr::copy_nonoverlapping(buffer.mapped_ptr()? as *const u8, dst_ptr, dst_size) };
        } else {
            let staging_buffer = self.allocate(buffer.size, BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu)?;

            self.device.single_time_command(|device, command_buffer| unsafe {
                let regions = BufferCopy::default().size(buffer.size).src_offset(0).dst_offset(0);

                device.handle.cmd_copy_buffer(command_buffer, buffer.buffer, staging_buffer.buffer, slice::from_ref(&regions));
            })?;

            unsafe { ptr::copy_nonoverlapping(staging_buffer.mapped_ptr()? as *const u8, dst_ptr, dst_size) };
        }

        unsafe { data.set_len(element_count) };

        Ok(data)
    }

    fn lock_gpu_allocator(&self) -> Result<MutexGuard<'_, GpuAllocator>> {
        self.gpu_allocator.lock().map_err(|_| anyhow!("GPU allocator is poisoned"))
    }
}
