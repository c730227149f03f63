use crate::rt::group_assembler::{assemble_batch, unused_group, HitGroupOrder, ShaderGroupInfo};
use crate::rt::shader_collection::{destroy_shader_modules, ShaderEntry};
use crate::rt::shader_counts::{count_shaders, ShaderCounts};
use crate::rt::shader_sorter::{sort_by_logical_group, sort_by_stage};
use crate::rt::stage::RtStage;
use crate::vk_context::device::{WrappedDevice, WrappedDeviceRef};
use anyhow::{anyhow, bail, Result};
use ash::vk;
use ash::vk::{
    CommandBuffer, DeferredOperationKHR, DynamicState, Pipeline, PipelineBindPoint, PipelineCache, PipelineCreateFlags, PipelineDynamicStateCreateInfo, PipelineLayout,
    PipelineLibraryCreateInfoKHR, PipelineShaderStageCreateInfo, RayTracingPipelineCreateInfoKHR, RayTracingPipelineInterfaceCreateInfoKHR, RayTracingShaderGroupTypeKHR,
};
use log::{debug, error, info, log_enabled, Level};
use std::collections::BTreeSet;
use std::ops::{Deref, Range};
use std::slice;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RtPipelineSettings {
    pub flags: PipelineCreateFlags,
    pub max_pipeline_ray_recursion_depth: u32,
    pub libraries: Vec<Pipeline>,
    pub max_pipeline_ray_payload_size: u32,
    pub max_pipeline_ray_hit_attribute_size: u32,
    pub dynamic_states: Vec<DynamicState>,
    pub hit_group_order: HitGroupOrder,
}

impl Default for RtPipelineSettings {
    fn default() -> Self {
        Self {
            flags: PipelineCreateFlags::empty(),
            max_pipeline_ray_recursion_depth: 1,
            libraries: Vec::new(),
            max_pipeline_ray_payload_size: 0,
            max_pipeline_ray_hit_attribute_size: 0,
            dynamic_states: Vec::new(),
            hit_group_order: HitGroupOrder::Ascending,
        }
    }
}

impl RtPipelineSettings {
    pub fn flags(mut self, flags: PipelineCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn max_pipeline_ray_recursion_depth(mut self, depth: u32) -> Self {
        self.max_pipeline_ray_recursion_depth = depth;
        self
    }

    pub fn libraries(mut self, libraries: Vec<Pipeline>, max_payload_size: u32, max_hit_attribute_size: u32) -> Self {
        self.libraries = libraries;
        self.max_pipeline_ray_payload_size = max_payload_size;
        self.max_pipeline_ray_hit_attribute_size = max_hit_attribute_size;
        self
    }

    pub fn dynamic_states(mut self, dynamic_states: Vec<DynamicState>) -> Self {
        self.dynamic_states = dynamic_states;
        self
    }

    pub fn hit_group_order(mut self, order: HitGroupOrder) -> Self {
        self.hit_group_order = order;
        self
    }
}

/// Where one logical group lives inside a built pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub logical_group: u16,
    pub first_group: u32,
    pub counts: ShaderCounts,
    pub shaders: Range<usize>,
}

/// Sorts `shaders` by logical group then stage and builds the pipeline's group array, one batch per logical group.
/// Each shader's `pipeline_group` is filled in. The returned batches record the layout each logical group was assembled with.
pub fn build_pipeline_groups(shaders: &mut [ShaderEntry], order: HitGroupOrder) -> Result<(Vec<ShaderGroupInfo>, Vec<BatchInfo>)> {
    let Some(first) = shaders.first() else {
        bail!("Shader list must not be empty");
    };

    let collection_id = first.collection_id;
    if let Some(stranger) = shaders.iter().find(|shader| shader.collection_id != collection_id) {
        bail!("All shaders must come from the same collection, found {} and {}", collection_id, stranger.collection_id);
    }

    sort_by_logical_group(shaders);

    let mut batches = Vec::new();
    for range in logical_group_ranges(shaders) {
        let batch = &mut shaders[range.clone()];
        sort_by_stage(batch)?;
        let counts = count_shaders(batch)?;
        batches.push((range, counts));
    }

    let group_count = batches.iter().map(|(_, counts)| counts.batch_group_count() as usize).sum();
    let mut groups = vec![unused_group(); group_count];
    let mut built = Vec::with_capacity(batches.len());
    let mut first_group = 0;

    for (range, counts) in batches {
        let batch_group_count = counts.batch_group_count() as usize;
        let logical_group = shaders[range.start].logical_group();

        assemble_batch(
            &mut shaders[range.clone()],
            range.start as u32,
            &counts,
            &mut groups[first_group..first_group + batch_group_count],
            first_group as u32,
            order,
        )?;

        debug!(
            "Logical group {}: shaders {:?}, pipeline groups {}..{} ({} general, {} hit)",
            logical_group,
            range,
            first_group,
            first_group + batch_group_count,
            counts.general_count(),
            counts.hit_groups
        );

        built.push(BatchInfo {
            logical_group,
            first_group: first_group as u32,
            counts,
            shaders: range,
        });

        first_group += batch_group_count;
    }

    Ok((groups, built))
}

/// Recovers the batch of `logical_group` from the pipeline group indices recorded on the shaders.
///
/// The batch's first shader must be its raygen shader; its pipeline group is the batch's first group.
pub fn batch_info(shaders: &[ShaderEntry], logical_group: u16) -> Result<BatchInfo> {
    let Some(start) = shaders.iter().position(|shader| shader.logical_group() == logical_group) else {
        bail!("Unable to find any shader in logical group {}", logical_group);
    };
    let len = shaders[start..].iter().take_while(|shader| shader.logical_group() == logical_group).count();
    let range = start..start + len;

    if shaders[range.end..].iter().any(|shader| shader.logical_group() == logical_group) {
        bail!("Shaders of logical group {} are not contiguous", logical_group);
    }

    let batch = &shaders[range.clone()];
    let first_stage = batch[0].rt_stage()?;
    if first_stage != RtStage::RayGen {
        bail!("Logical group {} must start with a raygen shader, found {}", logical_group, first_stage);
    }

    let first_group = batch[0]
        .pipeline_group
        .ok_or_else(|| anyhow!("Logical group {} has not been assigned pipeline groups", logical_group))?;

    let counts = count_shaders(batch)?;
    if counts.total as usize != batch.len() {
        bail!("Mismatch shader count in logical group {}", logical_group);
    }

    let expected = first_group..first_group + counts.batch_group_count();
    let assigned = batch
        .iter()
        .map(|shader| shader.pipeline_group.ok_or_else(|| anyhow!("Shader of logical group {} without pipeline group", logical_group)))
        .collect::<Result<BTreeSet<_>>>()?;

    if !assigned.iter().copied().eq(expected.clone()) {
        bail!(
            "Mismatch pipeline groups in logical group {}: expected {:?}, shaders reference {:?}",
            logical_group,
            expected,
            assigned
        );
    }

    Ok(BatchInfo {
        logical_group,
        first_group,
        counts,
        shaders: range,
    })
}

/// Recovers the batch of `logical_group` and checks it against the layout recorded when the pipeline was built.
pub fn verify_batch(shaders: &[ShaderEntry], built: &[BatchInfo], logical_group: u16) -> Result<BatchInfo> {
    let batch = batch_info(shaders, logical_group)?;

    let Some(recorded) = built.iter().find(|recorded| recorded.logical_group == logical_group) else {
        bail!("Logical group {} was not part of the pipeline build", logical_group);
    };

    if batch != *recorded {
        bail!(
            "Mismatch layout of logical group {}: built with first group {} and {:?}, recovered first group {} and {:?}",
            logical_group,
            recorded.first_group,
            recorded.counts,
            batch.first_group,
            batch.counts
        );
    }

    Ok(batch)
}

fn logical_group_ranges(shaders: &[ShaderEntry]) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();

    for (index, shader) in shaders.iter().enumerate() {
        match ranges.last_mut() {
            Some(range) if shaders[range.start].logical_group() == shader.logical_group() => range.end = index + 1,
            _ => ranges.push(index..index + 1),
        }
    }

    ranges
}

#[derive(Clone)]
pub struct RayTracingPipelineRef(Arc<RayTracingPipeline>);

impl Deref for RayTracingPipelineRef {
    type Target = Arc<RayTracingPipeline>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<RayTracingPipeline> for RayTracingPipelineRef {
    fn from(pipeline: RayTracingPipeline) -> Self {
        RayTracingPipelineRef(Arc::new(pipeline))
    }
}

pub struct RayTracingPipeline {
    device: WrappedDeviceRef,

    pub handle: Pipeline,
    pub pipeline_layout: PipelineLayout,
    pub settings: RtPipelineSettings,
    pub group_count: u32,
    shaders: Vec<ShaderEntry>,
    batches: Vec<BatchInfo>,
}

impl Deref for RayTracingPipeline {
    type Target = Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            if let Err(result) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle before destroying ray tracing pipeline: {}", result);
            }
            self.device.destroy_pipeline(self.handle, None);
        }
        destroy_shader_modules(&self.device, &self.shaders);
    }
}

impl RayTracingPipeline {
    /// Takes ownership of the shader modules in `shaders`; they are destroyed with the pipeline, or right away on failure.
    pub fn new(device: WrappedDeviceRef, pipeline_layout: PipelineLayout, mut shaders: Vec<ShaderEntry>, settings: RtPipelineSettings) -> Result<RayTracingPipeline> {
        let (handle, group_count, batches) = match Self::create_raytracing_pipeline(&device, pipeline_layout, &mut shaders, &settings) {
            Ok(created) => created,
            Err(error) => {
                destroy_shader_modules(&device, &shaders);
                return Err(error);
            }
        };

        info!("Ray tracing pipeline created: {} shaders, {} groups", shaders.len(), group_count);

        Ok(RayTracingPipeline {
            device,
            handle,
            pipeline_layout,
            settings,
            group_count,
            shaders,
            batches,
        })
    }

    #[inline]
    pub fn device(&self) -> &WrappedDeviceRef {
        &self.device
    }

    /// Shaders in pipeline stage order, each carrying its pipeline group index.
    #[inline]
    pub fn shaders(&self) -> &[ShaderEntry] {
        &self.shaders
    }

    /// Batches as assembled at creation time, in pipeline group order.
    #[inline]
    pub fn batches(&self) -> &[BatchInfo] {
        &self.batches
    }

    pub fn group_info(&self, logical_group: u16) -> Result<BatchInfo> {
        verify_batch(&self.shaders, &self.batches, logical_group)
    }

    pub fn bind(&self, cmd_buf: CommandBuffer) {
        unsafe { self.device.cmd_bind_pipeline(cmd_buf, PipelineBindPoint::RAY_TRACING_KHR, self.handle) };
    }

    fn create_raytracing_pipeline(device: &WrappedDevice, pipeline_layout: PipelineLayout, shaders: &mut [ShaderEntry], settings: &RtPipelineSettings) -> Result<(Pipeline, u32, Vec<BatchInfo>)> {
        let max_depth = device.rt_pipeline_properties.max_ray_recursion_depth;
        if settings.max_pipeline_ray_recursion_depth > max_depth {
            bail!("Ray recursion depth {} exceeds device limit {}", settings.max_pipeline_ray_recursion_depth, max_depth);
        }

        let (shader_group_create_infos, batches) = build_pipeline_groups(shaders, settings.hit_group_order)?;

        let shader_stage_create_infos = shaders
            .iter()
            .map(|shader| PipelineShaderStageCreateInfo::default().stage(shader.stage).module(shader.module).name(&shader.entry_name))
            .collect::<Vec<_>>();

        let library_info = PipelineLibraryCreateInfoKHR::default().libraries(&settings.libraries);
        let library_interface = RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(settings.max_pipeline_ray_payload_size)
            .max_pipeline_ray_hit_attribute_size(settings.max_pipeline_ray_hit_attribute_size);
        let dynamic_state_info = PipelineDynamicStateCreateInfo::default().dynamic_states(&settings.dynamic_states);

        let mut pipeline_create_info = RayTracingPipelineCreateInfoKHR::default()
            .flags(settings.flags)
            .max_pipeline_ray_recursion_depth(settings.max_pipeline_ray_recursion_depth)
            .layout(pipeline_layout)
            .stages(&shader_stage_create_infos)
            .groups(&shader_group_create_infos);

        if !settings.libraries.is_empty() {
            pipeline_create_info = pipeline_create_info.library_info(&library_info).library_interface(&library_interface);
        }
        if !settings.dynamic_states.is_empty() {
            pipeline_create_info = pipeline_create_info.dynamic_state(&dynamic_state_info);
        }

        let pipeline = match unsafe {
            device
                .rt_pipeline_device
                .create_ray_tracing_pipelines(DeferredOperationKHR::null(), PipelineCache::null(), slice::from_ref(&pipeline_create_info), None)
        } {
            Ok(rt_pipeline) => rt_pipeline[0],
            Err((_, result)) => return Err(anyhow!("Failed to create ray tracing pipeline: {}", result)),
        };

        log_group_table(shaders, &shader_group_create_infos);

        Ok((pipeline, shader_group_create_infos.len() as u32, batches))
    }
}

fn log_group_table(shaders: &[ShaderEntry], groups: &[ShaderGroupInfo]) {
    if !log_enabled!(Level::Debug) {
        return;
    }

    let describe = |index: u32| -> String {
        if index == vk::SHADER_UNUSED_KHR {
            return "unused".into();
        }
        match shaders.get(index as usize) {
            Some(shader) => match shader.rt_stage() {
                Ok(stage) => format!("{} #{} ({}, {:?} region)", stage, index, shader.key, stage.region()),
                Err(_) => format!("{:?} #{} ({})", shader.stage, index, shader.key),
            },
            None => format!("#{} out of bounds {}", index, shaders.len()),
        }
    };

    debug!("Ray tracing pipeline stages [{}]:", shaders.len());
    for (index, shader) in shaders.iter().enumerate() {
        debug!("\t{}: {:?} {:?} -> group {:?}", index, shader.stage, shader.entry_name, shader.pipeline_group);
    }

    debug!("Ray tracing shader groups [{}]:", groups.len());
    for (index, group) in groups.iter().enumerate() {
        let ty = match group.ty {
            RayTracingShaderGroupTypeKHR::GENERAL => "general",
            RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP => "triangles hit group",
            RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP => "procedural hit group",
            _ => "unknown",
        };
        debug!("\t{}: {}", index, ty);
        debug!("\t\tgeneral:      {}", describe(group.general_shader));
        debug!("\t\tclosest hit:  {}", describe(group.closest_hit_shader));
        debug!("\t\tany hit:      {}", describe(group.any_hit_shader));
        debug!("\t\tintersection: {}", describe(group.intersection_shader));
    }
    debug!("----------------------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::group_key::GroupKey;
    use ash::vk::ShaderModule;

    fn general(logical: u32, stage: RtStage) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::general(logical).unwrap(), "main", 0).unwrap()
    }

    fn hit(logical: u32, stage: RtStage, hit: u32) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::hit(logical, hit).unwrap(), "main", 0).unwrap()
    }

    fn two_programs() -> Vec<ShaderEntry> {
        vec![
            hit(1, RtStage::ClosestHit, 0),
            general(0, RtStage::Miss),
            hit(0, RtStage::Intersection, 1),
            general(1, RtStage::RayGen),
            general(0, RtStage::RayGen),
            hit(0, RtStage::ClosestHit, 1),
            general(0, RtStage::Miss),
            hit(0, RtStage::ClosestHit, 0),
            general(1, RtStage::Miss),
        ]
    }

    #[test]
    fn batches_are_concatenated_per_logical_group() {
        let mut shaders = two_programs();

        let (groups, _) = build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        // logical 0: rgen, miss, miss, hit 0, hit 1; logical 1: rgen, miss, hit 0
        assert_eq!(groups.len(), 8);
        assert_eq!(groups[3].ty, RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[4].ty, RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(groups[5].ty, RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[5].general_shader, 6);
        assert_eq!(groups[7].ty, RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[7].closest_hit_shader, 8);

        let logicals = shaders.iter().map(ShaderEntry::logical_group).collect::<Vec<_>>();
        assert_eq!(logicals, [0, 0, 0, 0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn example_program_layout() {
        let mut shaders = vec![
            general(0, RtStage::RayGen),
            general(0, RtStage::Miss),
            general(0, RtStage::Miss),
            hit(0, RtStage::ClosestHit, 0),
            hit(0, RtStage::ClosestHit, 1),
            hit(0, RtStage::Intersection, 1),
        ];

        let (groups, _) = build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();
        let info = batch_info(&shaders, 0).unwrap();

        assert_eq!(info.counts.batch_group_count(), 5);
        assert_eq!(info.counts.general_count(), 3);
        assert_eq!(info.first_group, 0);
        assert_eq!(groups[3].ty, RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[3].closest_hit_shader, 3);
        assert_eq!(groups[3].intersection_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[4].ty, RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(groups[4].closest_hit_shader, 4);
        assert_eq!(groups[4].intersection_shader, 5);
    }

    #[test]
    fn recovered_batches_agree_with_build_time_batches() {
        let mut shaders = two_programs();
        let (_, built) = build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        assert_eq!(built.len(), 2);
        for recorded in &built {
            let recovered = verify_batch(&shaders, &built, recorded.logical_group).unwrap();

            assert_eq!(&recovered, recorded);
            assert_eq!(recovered.counts, count_shaders(&shaders[recorded.shaders.clone()]).unwrap());
        }

        let second = &built[1];
        assert_eq!(second.first_group, 5);
        assert_eq!(second.shaders, 6..9);
        assert_eq!(second.counts.batch_group_count(), 3);
    }

    #[test]
    fn changed_counts_fail_verification() {
        let mut shaders = two_programs();
        let (_, built) = build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        // Still a self-consistent batch, but no longer the one the pipeline was built with.
        shaders[7].stage = RtStage::Callable.flags();
        assert!(batch_info(&shaders, 1).is_ok());

        let error = verify_batch(&shaders, &built, 1).unwrap_err();
        assert!(error.to_string().contains("Mismatch"));

        let mut stale = built.clone();
        stale[0].counts.miss -= 1;
        assert!(verify_batch(&shaders, &stale, 0).is_err());

        assert!(verify_batch(&shaders, &built[..1], 1).is_err());
    }

    #[test]
    fn batch_groups_are_contiguous() {
        let mut shaders = two_programs();
        build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        for logical in [0u16, 1] {
            let info = batch_info(&shaders, logical).unwrap();
            let mut groups = shaders[info.shaders.clone()].iter().map(|shader| shader.pipeline_group.unwrap()).collect::<Vec<_>>();
            groups.sort_unstable();
            groups.dedup();

            let expected = (info.first_group..info.first_group + info.counts.general_count() + info.counts.hit_groups).collect::<Vec<_>>();
            assert_eq!(groups, expected);
        }
    }

    #[test]
    fn batch_info_requires_leading_raygen() {
        let mut shaders = vec![general(3, RtStage::Miss), hit(3, RtStage::ClosestHit, 0)];
        build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        let error = batch_info(&shaders, 3).unwrap_err();
        assert!(error.to_string().contains("raygen"));
    }

    #[test]
    fn batch_info_detects_tampered_groups() {
        let mut shaders = two_programs();
        build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).unwrap();

        shaders[1].pipeline_group = Some(7);
        assert!(batch_info(&shaders, 0).is_err());

        assert!(batch_info(&shaders, 9).is_err());
    }

    #[test]
    fn batch_info_requires_assembled_shaders() {
        let shaders = vec![general(0, RtStage::RayGen)];

        assert!(batch_info(&shaders, 0).is_err());
    }

    #[test]
    fn mixed_collections_are_rejected() {
        let mut shaders = vec![general(0, RtStage::RayGen), general(0, RtStage::Miss)];
        shaders[1].collection_id = 42;

        assert!(build_pipeline_groups(&mut shaders, HitGroupOrder::Ascending).is_err());
        assert!(build_pipeline_groups(&mut [], HitGroupOrder::Ascending).is_err());
    }

    #[test]
    fn insert_order_fails_pipeline_assembly() {
        let mut shaders = two_programs();

        assert!(build_pipeline_groups(&mut shaders, HitGroupOrder::InsertOrder).is_err());
    }

    #[test]
    fn settings_builder_defaults() {
        let settings = RtPipelineSettings::default().max_pipeline_ray_recursion_depth(2).dynamic_states(vec![DynamicState::RAY_TRACING_PIPELINE_STACK_SIZE_KHR]);

        assert_eq!(settings.max_pipeline_ray_recursion_depth, 2);
        assert_eq!(settings.hit_group_order, HitGroupOrder::Ascending);
        assert!(settings.libraries.is_empty());
        assert_eq!(settings.dynamic_states.len(), 1);
    }
}
