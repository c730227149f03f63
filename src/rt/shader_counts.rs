use crate::rt::shader_collection::ShaderEntry;
use crate::rt::stage::{RtStage, SbtRegionKind};
use anyhow::{bail, Result};
use std::collections::BTreeSet;

/// Per-stage tally of one logical group's shaders.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShaderCounts {
    pub ray_gen: u32,
    pub miss: u32,
    pub any_hit: u32,
    pub closest_hit: u32,
    pub intersection: u32,
    pub callable: u32,
    pub total: u32,
    /// Number of distinct hit-group numbers among the hit shaders.
    pub hit_groups: u32,
}

impl ShaderCounts {
    #[inline]
    pub fn general_count(&self) -> u32 {
        self.ray_gen + self.miss + self.callable
    }

    #[inline]
    pub fn hit_shader_count(&self) -> u32 {
        self.any_hit + self.closest_hit + self.intersection
    }

    /// Lower bound on the number of hit groups, known before hit-group numbers are inspected.
    #[inline]
    pub fn hit_group_slot_estimate(&self) -> u32 {
        self.any_hit.max(self.closest_hit).max(self.intersection)
    }

    /// Pipeline groups occupied by the batch: one per general shader plus one per distinct hit group.
    #[inline]
    pub fn batch_group_count(&self) -> u32 {
        self.general_count() + self.hit_groups
    }

    /// Number of SBT records in a region.
    pub fn region_count(&self, region: SbtRegionKind) -> u32 {
        match region {
            SbtRegionKind::RayGen => self.ray_gen,
            SbtRegionKind::Miss => self.miss,
            SbtRegionKind::Callable => self.callable,
            SbtRegionKind::Hit => self.hit_groups,
        }
    }

    /// Index of the first pipeline group of `region`, relative to the batch start.
    pub fn region_first_group(&self, region: SbtRegionKind) -> u32 {
        SbtRegionKind::ALL
            .iter()
            .take_while(|&&kind| kind != region)
            .map(|&kind| self.region_count(kind))
            .sum()
    }

    fn tally(&mut self, stage: RtStage) {
        match stage {
            RtStage::RayGen => self.ray_gen += 1,
            RtStage::Miss => self.miss += 1,
            RtStage::Callable => self.callable += 1,
            RtStage::AnyHit => self.any_hit += 1,
            RtStage::ClosestHit => self.closest_hit += 1,
            RtStage::Intersection => self.intersection += 1,
        }
        self.total += 1;
    }
}

/// Classifies every shader of a run by stage. Any stage outside the six ray tracing stages is an error,
/// as is a hit shader without a hit group or a general shader with one.
pub fn count_shaders(shaders: &[ShaderEntry]) -> Result<ShaderCounts> {
    let mut counts = ShaderCounts::default();
    let mut hit_groups = BTreeSet::new();

    for (index, shader) in shaders.iter().enumerate() {
        let stage = shader.rt_stage()?;

        match (stage.is_hit(), shader.key.hit_group()) {
            (true, Some(hit)) => {
                hit_groups.insert(hit);
            }
            (true, None) => bail!("Hit shader {} ({}) of {} has no hit group", index, stage, shader.key),
            (false, Some(_)) => bail!("General shader {} ({}) is tagged with {}", index, stage, shader.key),
            (false, None) => {}
        }

        counts.tally(stage);
    }

    counts.hit_groups = hit_groups.len() as u32;

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::group_key::GroupKey;
    use ash::vk::{ShaderModule, ShaderStageFlags};

    fn general(stage: RtStage) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::general(0).unwrap(), "main", 0).unwrap()
    }

    fn hit(stage: RtStage, hit: u32) -> ShaderEntry {
        ShaderEntry::new(ShaderModule::null(), stage.flags(), GroupKey::hit(0, hit).unwrap(), "main", 0).unwrap()
    }

    #[test]
    fn counts_every_stage() {
        let shaders = vec![
            general(RtStage::RayGen),
            general(RtStage::Miss),
            general(RtStage::Miss),
            general(RtStage::Callable),
            hit(RtStage::ClosestHit, 0),
            hit(RtStage::AnyHit, 0),
            hit(RtStage::ClosestHit, 3),
            hit(RtStage::Intersection, 3),
        ];

        let counts = count_shaders(&shaders).unwrap();

        assert_eq!(
            counts,
            ShaderCounts {
                ray_gen: 1,
                miss: 2,
                any_hit: 1,
                closest_hit: 2,
                intersection: 1,
                callable: 1,
                total: 8,
                hit_groups: 2,
            }
        );
        assert_eq!(counts.general_count(), 4);
        assert_eq!(counts.hit_group_slot_estimate(), 2);
        assert_eq!(counts.batch_group_count(), 6);
    }

    #[test]
    fn estimate_never_exceeds_distinct_hit_groups() {
        let shaders = vec![general(RtStage::RayGen), hit(RtStage::ClosestHit, 0), hit(RtStage::AnyHit, 1)];

        let counts = count_shaders(&shaders).unwrap();

        assert_eq!(counts.hit_group_slot_estimate(), 1);
        assert_eq!(counts.hit_groups, 2);
        assert_eq!(counts.batch_group_count(), 3);
    }

    #[test]
    fn region_offsets_follow_region_order() {
        let shaders = vec![
            general(RtStage::RayGen),
            general(RtStage::Miss),
            general(RtStage::Miss),
            hit(RtStage::ClosestHit, 0),
        ];

        let counts = count_shaders(&shaders).unwrap();

        assert_eq!(counts.region_first_group(SbtRegionKind::RayGen), 0);
        assert_eq!(counts.region_first_group(SbtRegionKind::Miss), 1);
        assert_eq!(counts.region_first_group(SbtRegionKind::Callable), 3);
        assert_eq!(counts.region_first_group(SbtRegionKind::Hit), 3);
        assert_eq!(counts.region_count(SbtRegionKind::Hit), 1);
    }

    #[test]
    fn foreign_stage_is_fatal() {
        let mut shader = general(RtStage::RayGen);
        shader.stage = ShaderStageFlags::VERTEX;

        assert!(count_shaders(&[shader]).is_err());
    }

    #[test]
    fn mismatched_keys_are_fatal() {
        let mut untagged_hit = hit(RtStage::AnyHit, 0);
        untagged_hit.key = GroupKey::general(0).unwrap();
        assert!(count_shaders(&[untagged_hit]).is_err());

        let mut tagged_miss = general(RtStage::Miss);
        tagged_miss.key = GroupKey::hit(0, 1).unwrap();
        assert!(count_shaders(&[tagged_miss]).is_err());
    }

    #[test]
    fn empty_run_counts_nothing() {
        assert_eq!(count_shaders(&[]).unwrap(), ShaderCounts::default());
    }
}
