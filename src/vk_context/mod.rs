use crate::render_resource::render_buffer::{RenderBufferAllocator, RenderBufferAllocatorRef};
use crate::vk_context::device::{WrappedDevice, WrappedDeviceRef};
use anyhow::Result;
use ash::vk;
use ash::vk::DeviceSize;
use std::ffi::CStr;

pub mod device;

pub const ENGINE_NAME: &str = "rt_binding_table";
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

pub const API_VERSION: u32 = vk::API_VERSION_1_2;

pub const VALIDATION_LAYERS: [&str; 1] = ["VK_LAYER_KHRONOS_validation"];

pub const DEVICE_EXTENSIONS: [&CStr; 6] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::shader_float_controls::NAME,
    ash::khr::spirv_1_4::NAME,
];

pub fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    assert!(alignment.is_power_of_two(), "Alignment must be a power of two");

    (value + alignment - 1) & !(alignment - 1)
}

pub fn init_vulkan_context(enable_validation: bool, app_name: &str, app_version: u32) -> Result<(WrappedDeviceRef, RenderBufferAllocatorRef)> {
    let device: WrappedDeviceRef = WrappedDevice::new(
        enable_validation,
        &VALIDATION_LAYERS,
        ENGINE_NAME,
        ENGINE_VERSION,
        app_name,
        app_version,
        API_VERSION,
        &DEVICE_EXTENSIONS,
    )?
    .into();

    let buffer_allocator: RenderBufferAllocatorRef = RenderBufferAllocator::new(device.clone())?.into();

    Ok((device, buffer_allocator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 32), 96);
    }

    #[test]
    #[should_panic]
    fn align_up_rejects_non_power_of_two() {
        align_up(10, 24);
    }
}
