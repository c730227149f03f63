use crate::render_resource::render_buffer::{RenderBuffer, RenderBufferAllocator};
use crate::rt::pipeline::{BatchInfo, RayTracingPipelineRef};
use crate::rt::shader_counts::ShaderCounts;
use crate::rt::stage::SbtRegionKind;
use crate::vk_context;
use anyhow::{anyhow, bail, Result};
use ash::vk::{BufferUsageFlags, CommandBuffer, DeviceAddress, DeviceSize, PhysicalDeviceRayTracingPipelinePropertiesKHR, StridedDeviceAddressRegionKHR};
use gpu_allocator::MemoryLocation;
use log::{debug, info};
use std::collections::HashMap;

/// Byte layout of one logical group's binding table.
///
/// Records follow the batch's pipeline group order: raygen, miss, callable, then hit groups.
/// Each record holds the group handle, then the user data, then padding up to `record_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub user_data_size: u32,
    pub record_size: DeviceSize,
    pub counts: ShaderCounts,
}

impl SbtLayout {
    pub fn from_properties(counts: ShaderCounts, properties: &PhysicalDeviceRayTracingPipelinePropertiesKHR, user_data_size: u32) -> Result<Self> {
        Self::new(
            counts,
            properties.shader_group_handle_size,
            properties.shader_group_base_alignment,
            properties.max_shader_group_stride,
            user_data_size,
        )
    }

    pub fn new(counts: ShaderCounts, handle_size: u32, base_alignment: u32, max_stride: u32, user_data_size: u32) -> Result<Self> {
        if handle_size == 0 {
            bail!("Shader group handle size must not be zero");
        }
        if !base_alignment.is_power_of_two() {
            bail!("Shader group base alignment {} is not a power of two", base_alignment);
        }

        let record_size = vk_context::align_up(handle_size as DeviceSize + user_data_size as DeviceSize, base_alignment as DeviceSize);
        if record_size > max_stride as DeviceSize {
            bail!(
                "Record size {} ({} byte handle, {} bytes user data) exceeds device shader group stride limit {}",
                record_size,
                handle_size,
                user_data_size,
                max_stride
            );
        }

        Ok(Self {
            handle_size,
            user_data_size,
            record_size,
            counts,
        })
    }

    #[inline]
    pub fn record_count(&self) -> u32 {
        self.counts.batch_group_count()
    }

    #[inline]
    pub fn buffer_size(&self) -> DeviceSize {
        self.record_count() as DeviceSize * self.record_size
    }

    #[inline]
    pub fn region_offset(&self, region: SbtRegionKind) -> DeviceSize {
        self.counts.region_first_group(region) as DeviceSize * self.record_size
    }

    #[inline]
    pub fn region_size(&self, region: SbtRegionKind) -> DeviceSize {
        self.counts.region_count(region) as DeviceSize * self.record_size
    }

    /// Index of a record inside the table, counted from the first raygen record.
    pub fn record_index(&self, region: SbtRegionKind, index: u32) -> Result<u32> {
        let count = self.counts.region_count(region);
        if index >= count {
            bail!("Record {} out of range for {:?} region with {} records", index, region, count);
        }

        Ok(self.counts.region_first_group(region) + index)
    }

    /// Scatters tightly packed group handles into `record_size` strided records and appends each record's user data.
    pub fn write_records(&self, handles: &[u8], record_data: &HashMap<u32, Vec<u8>>) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let record_size = self.record_size as usize;
        let record_count = self.record_count() as usize;

        if handles.len() != record_count * handle_size {
            bail!("Mismatch group handle data: expected {} bytes, got {}", record_count * handle_size, handles.len());
        }

        let mut records = vec![0_u8; self.buffer_size() as usize];

        for region in SbtRegionKind::ALL {
            let first = self.counts.region_first_group(region) as usize;

            for record in first..first + self.counts.region_count(region) as usize {
                let dst = record * record_size;
                records[dst..dst + handle_size].copy_from_slice(&handles[record * handle_size..(record + 1) * handle_size]);
            }
        }

        for (&record, data) in record_data {
            let record = record as usize;
            if record >= record_count {
                bail!("User data for record {} beyond table of {} records", record, record_count);
            }
            if data.len() > self.user_data_size as usize {
                bail!("User data of record {} is {} bytes, record only reserves {}", record, data.len(), self.user_data_size);
            }

            let dst = record * record_size + handle_size;
            records[dst..dst + data.len()].copy_from_slice(data);
        }

        Ok(records)
    }

    pub fn regions(&self, base_address: DeviceAddress) -> SbtRegions {
        let region = |kind: SbtRegionKind| {
            StridedDeviceAddressRegionKHR::default()
                .device_address(base_address + self.region_offset(kind))
                .stride(self.record_size)
                .size(self.region_size(kind))
        };

        SbtRegions {
            raygen: region(SbtRegionKind::RayGen),
            miss: region(SbtRegionKind::Miss),
            callable: region(SbtRegionKind::Callable),
            hit: region(SbtRegionKind::Hit),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SbtRegions {
    pub raygen: StridedDeviceAddressRegionKHR,
    pub miss: StridedDeviceAddressRegionKHR,
    pub callable: StridedDeviceAddressRegionKHR,
    pub hit: StridedDeviceAddressRegionKHR,
}

impl SbtRegions {
    pub fn region(&self, kind: SbtRegionKind) -> &StridedDeviceAddressRegionKHR {
        match kind {
            SbtRegionKind::RayGen => &self.raygen,
            SbtRegionKind::Miss => &self.miss,
            SbtRegionKind::Callable => &self.callable,
            SbtRegionKind::Hit => &self.hit,
        }
    }

    /// The first raygen record, as the trace command expects a raygen region of exactly one record.
    pub fn raygen_record(&self) -> Result<StridedDeviceAddressRegionKHR> {
        if self.raygen.size == 0 || self.raygen.stride == 0 {
            bail!("Shader binding table has no raygen record");
        }

        Ok(self.raygen.size(self.raygen.stride))
    }
}

/// Host side of one logical group's table: the batch it covers, per-record user data and, once packed, the layout.
pub struct SbtRecords {
    batch: BatchInfo,
    user_data_size: u32,
    record_data: HashMap<u32, Vec<u8>>,
    packed: Option<SbtLayout>,
}

impl SbtRecords {
    pub fn new(batch: BatchInfo) -> Self {
        Self {
            batch,
            user_data_size: 0,
            record_data: HashMap::new(),
            packed: None,
        }
    }

    pub fn with_user_data_size(mut self, user_data_size: u32) -> Self {
        self.user_data_size = user_data_size;
        self
    }

    #[inline]
    pub fn batch(&self) -> &BatchInfo {
        &self.batch
    }

    #[inline]
    pub fn layout(&self) -> Option<&SbtLayout> {
        self.packed.as_ref()
    }

    pub fn set_record_data(&mut self, region: SbtRegionKind, index: u32, data: &[u8]) -> Result<()> {
        if self.packed.is_some() {
            bail!("Shader binding table of logical group {} is already built", self.batch.logical_group);
        }
        if data.len() > self.user_data_size as usize {
            bail!("User data of {} bytes exceeds reserved {} bytes per record", data.len(), self.user_data_size);
        }

        let count = self.batch.counts.region_count(region);
        if index >= count {
            bail!("Record {} out of range for {:?} region with {} records", index, region, count);
        }

        self.record_data.insert(self.batch.counts.region_first_group(region) + index, data.to_vec());

        Ok(())
    }

    /// Lays out the records and fills them with the handles returned by `query_handles(first_group, count, data_size)`.
    ///
    /// `current` is the batch as the pipeline reports it now and must match the one this table was created for.
    /// Returns `None` without querying anything once the records have been packed.
    pub fn pack(
        &mut self,
        current: &BatchInfo,
        properties: &PhysicalDeviceRayTracingPipelinePropertiesKHR,
        query_handles: impl FnOnce(u32, u32, usize) -> Result<Vec<u8>>,
    ) -> Result<Option<(SbtLayout, Vec<u8>)>> {
        if self.packed.is_some() {
            return Ok(None);
        }

        if *current != self.batch {
            bail!(
                "Mismatch layout of logical group {}: table created for first group {} and {:?}, pipeline now reports first group {} and {:?}",
                self.batch.logical_group,
                self.batch.first_group,
                self.batch.counts,
                current.first_group,
                current.counts
            );
        }

        let layout = SbtLayout::from_properties(self.batch.counts, properties, self.user_data_size)?;
        let record_count = layout.record_count();

        let handles = query_handles(self.batch.first_group, record_count, record_count as usize * layout.handle_size as usize)?;
        let records = layout.write_records(&handles, &self.record_data)?;

        self.packed = Some(layout);

        Ok(Some((layout, records)))
    }

    fn discard(&mut self) {
        self.packed = None;
    }
}

struct BuiltTable {
    buffer: RenderBuffer,
    regions: SbtRegions,
}

/// Binding table for one logical group of a ray tracing pipeline.
pub struct ShaderBindingTable {
    pipeline: RayTracingPipelineRef,
    records: SbtRecords,
    built: Option<BuiltTable>,
}

impl ShaderBindingTable {
    pub fn new(pipeline: RayTracingPipelineRef, logical_group: u16) -> Result<Self> {
        let batch = pipeline.group_info(logical_group)?;

        Ok(Self {
            pipeline,
            records: SbtRecords::new(batch),
            built: None,
        })
    }

    pub fn with_user_data_size(mut self, user_data_size: u32) -> Self {
        self.records.user_data_size = user_data_size;
        self
    }

    #[inline]
    pub fn logical_group(&self) -> u16 {
        self.records.batch.logical_group
    }

    #[inline]
    pub fn batch(&self) -> &BatchInfo {
        self.records.batch()
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn set_record_data(&mut self, region: SbtRegionKind, index: u32, data: &[u8]) -> Result<()> {
        self.records.set_record_data(region, index, data)
    }

    /// Fills the table from the pipeline's group handles. Only the first successful call does any work.
    pub fn build(&mut self, allocator: &RenderBufferAllocator) -> Result<()> {
        if self.built.is_some() {
            debug!("Shader binding table of logical group {} already built", self.logical_group());
            return Ok(());
        }

        let current = self.pipeline.group_info(self.records.batch.logical_group)?;

        let device = self.pipeline.device();
        let properties = &device.rt_pipeline_properties;
        let pipeline = self.pipeline.handle;

        let packed = self.records.pack(&current, properties, |first_group, count, data_size| unsafe {
            Ok(device.rt_pipeline_device.get_ray_tracing_shader_group_handles(pipeline, first_group, count, data_size)?)
        })?;

        let Some((layout, records)) = packed else {
            return Ok(());
        };

        let built = match upload_records(allocator, &layout, &records, properties.shader_group_base_alignment) {
            Ok(built) => built,
            Err(error) => {
                self.records.discard();
                return Err(error);
            }
        };

        info!(
            "Shader binding table built for logical group {}: {} records of {} bytes, first group {}",
            current.logical_group,
            layout.record_count(),
            layout.record_size,
            current.first_group
        );

        self.built = Some(built);

        Ok(())
    }

    pub fn layout(&self) -> Option<&SbtLayout> {
        self.built.as_ref().and(self.records.layout())
    }

    pub fn regions(&self) -> Option<&SbtRegions> {
        self.built.as_ref().map(|built| &built.regions)
    }

    pub fn buffer(&self) -> Option<&RenderBuffer> {
        self.built.as_ref().map(|built| &built.buffer)
    }

    pub fn trace_rays(&self, cmd_buf: CommandBuffer, width: u32, height: u32, depth: u32) -> Result<()> {
        let built = self
            .built
            .as_ref()
            .ok_or_else(|| anyhow!("Shader binding table of logical group {} is not built", self.logical_group()))?;

        let raygen = built.regions.raygen_record()?;

        unsafe {
            self.pipeline
                .device()
                .rt_pipeline_device
                .cmd_trace_rays(cmd_buf, &raygen, &built.regions.miss, &built.regions.hit, &built.regions.callable, width, height, depth)
        };

        Ok(())
    }
}

fn upload_records(allocator: &RenderBufferAllocator, layout: &SbtLayout, records: &[u8], base_alignment: u32) -> Result<BuiltTable> {
    let buffer = allocator.allocate_aligned(
        layout.buffer_size(),
        BufferUsageFlags::TRANSFER_DST | BufferUsageFlags::SHADER_DEVICE_ADDRESS | BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        MemoryLocation::GpuOnly,
        base_alignment as DeviceSize,
    )?;

    allocator.upload_data(&buffer, records)?;

    let base_address = buffer.device_addr();
    if base_address % base_alignment as DeviceAddress != 0 {
        bail!("Shader binding table address {:#x} is not aligned to {}", base_address, base_alignment);
    }

    let regions = layout.regions(base_address);

    Ok(BuiltTable { buffer, regions })
}
