use crate::rt::shader_collection::ShaderEntry;
use crate::rt::stage::RtStage;
use anyhow::Result;

/// Stable sort into raygen, miss, callable, any-hit, closest-hit, intersection order.
pub fn sort_by_stage(shaders: &mut [ShaderEntry]) -> Result<()> {
    // Validate up front so the sort key cannot fail halfway through.
    for shader in shaders.iter() {
        shader.rt_stage()?;
    }

    shaders.sort_by_key(|shader| RtStage::try_from(shader.stage).map_or(usize::MAX, RtStage::precedence));

    Ok(())
}

/// Stable sort by logical group, keeping registration order inside each group.
pub fn sort_by_logical_group(shaders: &mut [ShaderEntry]) {
    shaders.sort_by_key(ShaderEntry::logical_group);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::group_key::GroupKey;
    use ash::vk::{ShaderModule, ShaderStageFlags};

    fn shader(stage: RtStage, logical: u32, name: &str) -> ShaderEntry {
        let key = if stage.is_hit() {
            GroupKey::hit(logical, 0).unwrap()
        } else {
            GroupKey::general(logical).unwrap()
        };

        ShaderEntry::new(ShaderModule::null(), stage.flags(), key, name, 0).unwrap()
    }

    fn names(shaders: &[ShaderEntry]) -> Vec<&str> {
        shaders.iter().map(|shader| shader.entry_name.to_str().unwrap()).collect()
    }

    #[test]
    fn sorts_into_stage_precedence() {
        let mut shaders = vec![
            shader(RtStage::Intersection, 0, "is"),
            shader(RtStage::ClosestHit, 0, "ch"),
            shader(RtStage::Callable, 0, "call"),
            shader(RtStage::AnyHit, 0, "ah"),
            shader(RtStage::Miss, 0, "miss"),
            shader(RtStage::RayGen, 0, "rgen"),
        ];

        sort_by_stage(&mut shaders).unwrap();

        assert_eq!(names(&shaders), ["rgen", "miss", "call", "ah", "ch", "is"]);
    }

    #[test]
    fn keeps_registration_order_within_a_stage() {
        let mut shaders = vec![
            shader(RtStage::Miss, 0, "miss_a"),
            shader(RtStage::ClosestHit, 0, "ch_a"),
            shader(RtStage::Miss, 0, "miss_b"),
            shader(RtStage::RayGen, 0, "rgen"),
            shader(RtStage::ClosestHit, 0, "ch_b"),
        ];

        sort_by_stage(&mut shaders).unwrap();

        assert_eq!(names(&shaders), ["rgen", "miss_a", "miss_b", "ch_a", "ch_b"]);
    }

    #[test]
    fn groups_by_logical_index() {
        let mut shaders = vec![
            shader(RtStage::RayGen, 2, "rgen2"),
            shader(RtStage::RayGen, 0, "rgen0"),
            shader(RtStage::Miss, 2, "miss2"),
            shader(RtStage::Miss, 0, "miss0"),
        ];

        sort_by_logical_group(&mut shaders);

        assert_eq!(names(&shaders), ["rgen0", "miss0", "rgen2", "miss2"]);
    }

    #[test]
    fn rejects_foreign_stage() {
        let mut shaders = vec![shader(RtStage::RayGen, 0, "rgen")];
        shaders[0].stage = ShaderStageFlags::GEOMETRY;

        assert!(sort_by_stage(&mut shaders).is_err());
    }
}
