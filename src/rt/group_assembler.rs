use crate::rt::shader_collection::ShaderEntry;
use crate::rt::shader_counts::ShaderCounts;
use crate::rt::stage::RtStage;
use anyhow::{bail, Result};
use ash::vk;
use ash::vk::{RayTracingShaderGroupCreateInfoKHR, RayTracingShaderGroupTypeKHR};

pub type ShaderGroupInfo = RayTracingShaderGroupCreateInfoKHR<'static>;

/// How the hit groups of a logical group are laid out after its general groups.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HitGroupOrder {
    /// Distinct hit-group numbers, sorted ascending.
    #[default]
    Ascending,
    /// First-seen order. Not supported.
    InsertOrder,
}

pub fn unused_group() -> ShaderGroupInfo {
    RayTracingShaderGroupCreateInfoKHR::default()
        .ty(RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

/// Fills the pipeline groups of one logical group.
///
/// `shaders` must be the stage-sorted run of the logical group, starting at pipeline stage index `first_shader`,
/// and `groups` its slice of the pipeline's group array, starting at pipeline group index `first_group`.
/// General shaders take one group each, in order; hit shaders are merged into one group per distinct hit-group
/// number. Every shader gets its pipeline group index written back.
pub fn assemble_batch(
    shaders: &mut [ShaderEntry],
    first_shader: u32,
    counts: &ShaderCounts,
    groups: &mut [ShaderGroupInfo],
    first_group: u32,
    order: HitGroupOrder,
) -> Result<()> {
    if order != HitGroupOrder::Ascending {
        bail!("Hit group order {:?} is not implemented", order);
    }
    if shaders.len() != counts.total as usize {
        bail!("Shader run of {} entries does not match counted total {}", shaders.len(), counts.total);
    }
    if groups.len() != counts.batch_group_count() as usize {
        bail!("Group span of {} slots does not match batch group count {}", groups.len(), counts.batch_group_count());
    }

    let general_count = counts.general_count() as usize;

    groups.iter_mut().for_each(|group| *group = unused_group());

    for (slot, shader) in shaders[..general_count].iter_mut().enumerate() {
        let stage = shader.rt_stage()?;
        if !stage.is_general() {
            bail!("Expected a general shader at {} of {}, found {}; shaders must be stage-sorted", slot, shader.key, stage);
        }

        let group = &mut groups[slot];

        group.ty = RayTracingShaderGroupTypeKHR::GENERAL;
        group.general_shader = first_shader + slot as u32;
        shader.pipeline_group = Some(first_group + slot as u32);
    }

    let hit_numbers = distinct_hit_groups(&shaders[general_count..], counts)?;

    for (offset, shader) in shaders[general_count..].iter_mut().enumerate() {
        let stage = shader.rt_stage()?;
        let shader_index = first_shader + (general_count + offset) as u32;

        let Some(hit) = shader.key.hit_group() else {
            bail!("Expected a hit shader at {} of {}, found {}; shaders must be stage-sorted", general_count + offset, shader.key, stage);
        };
        let Ok(position) = hit_numbers.binary_search(&hit) else {
            bail!("Hit group {} of {} missing from the hit group table", hit, shader.key);
        };

        let slot = general_count + position;
        let group = &mut groups[slot];

        let field = match stage {
            RtStage::AnyHit => &mut group.any_hit_shader,
            RtStage::ClosestHit => &mut group.closest_hit_shader,
            RtStage::Intersection => &mut group.intersection_shader,
            _ => bail!("Expected a hit shader at {} of {}, found {}; shaders must be stage-sorted", general_count + offset, shader.key, stage),
        };

        if *field != vk::SHADER_UNUSED_KHR {
            bail!("Conflicting {} shaders {} and {} registered for {}", stage, *field, shader_index, shader.key);
        }

        *field = shader_index;
        shader.pipeline_group = Some(first_group + slot as u32);
    }

    for group in &mut groups[general_count..] {
        group.ty = if group.intersection_shader != vk::SHADER_UNUSED_KHR {
            RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        } else {
            RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        };
    }

    Ok(())
}

fn distinct_hit_groups(hit_shaders: &[ShaderEntry], counts: &ShaderCounts) -> Result<Vec<u16>> {
    let mut hit_numbers = Vec::with_capacity(counts.hit_group_slot_estimate() as usize);
    hit_numbers.extend(hit_shaders.iter().filter_map(|shader| shader.key.hit_group()));
    hit_numbers.sort_unstable();
    hit_numbers.dedup();

    if hit_numbers.len() != counts.hit_groups as usize {
        bail!("Found {} distinct hit groups, counted {}", hit_numbers.len(), counts.hit_groups);
    }

    Ok(hit_numbers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::group_key::GroupKey;
    use crate::rt::shader_counts::count_shaders;
    use crate::rt::shader_sorter::sort_by_stage;
    use ash::vk::ShaderModule;

    fn general(stage: RtStage) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::general(0).unwrap(), "main", 0).unwrap()
    }

    fn hit(stage: RtStage, hit: u32) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::hit(0, hit).unwrap(), "main", 0).unwrap()
    }

    fn assemble(shaders: &mut [ShaderEntry], order: HitGroupOrder) -> Result<Vec<ShaderGroupInfo>> {
        sort_by_stage(shaders)?;
        let counts = count_shaders(shaders)?;
        let mut groups = vec![unused_group(); counts.batch_group_count() as usize];
        assemble_batch(shaders, 0, &counts, &mut groups, 0, order)?;
        Ok(groups)
    }

    #[test]
    fn mixed_triangle_and_procedural_hit_groups() {
        let mut shaders = vec![
            hit(RtStage::Intersection, 1),
            general(RtStage::RayGen),
            hit(RtStage::ClosestHit, 1),
            general(RtStage::Miss),
            hit(RtStage::ClosestHit, 0),
            general(RtStage::Miss),
        ];

        let groups = assemble(&mut shaders, HitGroupOrder::Ascending).unwrap();

        assert_eq!(groups.len(), 5);
        for (slot, group) in groups[..3].iter().enumerate() {
            assert_eq!(group.ty, RayTracingShaderGroupTypeKHR::GENERAL);
            assert_eq!(group.general_shader, slot as u32);
            assert_eq!(group.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        }

        // sorted: rgen, miss, miss, ch(1), ch(0), is(1)
        assert_eq!(groups[3].ty, RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[3].closest_hit_shader, 4);
        assert_eq!(groups[3].any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[3].intersection_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[3].general_shader, vk::SHADER_UNUSED_KHR);

        assert_eq!(groups[4].ty, RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(groups[4].closest_hit_shader, 3);
        assert_eq!(groups[4].intersection_shader, 5);
        assert_eq!(groups[4].any_hit_shader, vk::SHADER_UNUSED_KHR);

        let assigned = shaders.iter().map(|shader| shader.pipeline_group.unwrap()).collect::<Vec<_>>();
        assert_eq!(assigned, [0, 1, 2, 4, 3, 4]);
    }

    #[test]
    fn sparse_hit_numbers_are_packed_in_ascending_order() {
        let mut shaders = vec![
            general(RtStage::RayGen),
            hit(RtStage::ClosestHit, 40),
            hit(RtStage::AnyHit, 7),
            hit(RtStage::ClosestHit, 7),
            hit(RtStage::AnyHit, 19),
        ];

        let groups = assemble(&mut shaders, HitGroupOrder::Ascending).unwrap();

        assert_eq!(groups.len(), 4);
        // sorted: rgen, ah(7), ah(19), ch(40), ch(7)
        assert_eq!((groups[1].any_hit_shader, groups[1].closest_hit_shader), (1, 4));
        assert_eq!((groups[2].any_hit_shader, groups[2].closest_hit_shader), (2, vk::SHADER_UNUSED_KHR));
        assert_eq!((groups[3].any_hit_shader, groups[3].closest_hit_shader), (vk::SHADER_UNUSED_KHR, 3));
        assert!(groups[1..].iter().all(|group| group.ty == RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP));
    }

    #[test]
    fn group_indices_are_offset_by_batch_start() {
        let mut shaders = vec![general(RtStage::RayGen), general(RtStage::Callable), hit(RtStage::ClosestHit, 2)];
        let counts = count_shaders(&shaders).unwrap();
        let mut groups = vec![unused_group(); 3];

        assemble_batch(&mut shaders, 10, &counts, &mut groups, 20, HitGroupOrder::Ascending).unwrap();

        assert_eq!(groups[0].general_shader, 10);
        assert_eq!(groups[1].general_shader, 11);
        assert_eq!(groups[2].closest_hit_shader, 12);
        let assigned = shaders.iter().map(|shader| shader.pipeline_group.unwrap()).collect::<Vec<_>>();
        assert_eq!(assigned, [20, 21, 22]);
    }

    #[test]
    fn duplicated_closest_hit_fails() {
        let mut shaders = vec![general(RtStage::RayGen), hit(RtStage::ClosestHit, 0), hit(RtStage::ClosestHit, 0)];

        let error = assemble(&mut shaders, HitGroupOrder::Ascending).unwrap_err();

        assert!(error.to_string().contains("Conflicting"));
    }

    #[test]
    fn insert_order_is_a_hard_failure() {
        let mut shaders = vec![general(RtStage::RayGen), hit(RtStage::ClosestHit, 1), hit(RtStage::ClosestHit, 0)];

        let error = assemble(&mut shaders, HitGroupOrder::InsertOrder).unwrap_err();

        assert!(error.to_string().contains("not implemented"));
        assert!(shaders.iter().all(|shader| shader.pipeline_group.is_none()));
    }

    #[test]
    fn unsorted_run_is_rejected() {
        let mut shaders = vec![hit(RtStage::ClosestHit, 0), general(RtStage::RayGen)];
        let counts = count_shaders(&shaders).unwrap();
        let mut groups = vec![unused_group(); 2];

        assert!(assemble_batch(&mut shaders, 0, &counts, &mut groups, 0, HitGroupOrder::Ascending).is_err());
    }

    #[test]
    fn undersized_group_span_is_rejected() {
        let mut shaders = vec![general(RtStage::RayGen), hit(RtStage::ClosestHit, 0), hit(RtStage::AnyHit, 1)];
        let counts = count_shaders(&shaders).unwrap();
        let mut groups = vec![unused_group(); (counts.general_count() + counts.hit_group_slot_estimate()) as usize];

        assert!(assemble_batch(&mut shaders, 0, &counts, &mut groups, 0, HitGroupOrder::Ascending).is_err());
    }

    #[test]
    fn no_two_shaders_share_a_group_field() {
        let mut shaders = vec![
            general(RtStage::RayGen),
            general(RtStage::Miss),
            hit(RtStage::AnyHit, 0),
            hit(RtStage::ClosestHit, 0),
            hit(RtStage::Intersection, 0),
            hit(RtStage::ClosestHit, 1),
            hit(RtStage::AnyHit, 2),
        ];

        let groups = assemble(&mut shaders, HitGroupOrder::Ascending).unwrap();

        let mut used = groups
            .iter()
            .flat_map(|group| [group.general_shader, group.closest_hit_shader, group.any_hit_shader, group.intersection_shader])
            .filter(|&index| index != vk::SHADER_UNUSED_KHR)
            .collect::<Vec<_>>();
        used.sort_unstable();

        assert_eq!(used, (0..shaders.len() as u32).collect::<Vec<_>>());
    }
}
