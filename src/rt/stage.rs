use anyhow::{bail, Result};
use ash::vk::ShaderStageFlags;
use std::fmt;

/// The six shader stages a ray tracing pipeline accepts, in canonical precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RtStage {
    RayGen,
    Miss,
    Callable,
    AnyHit,
    ClosestHit,
    Intersection,
}

/// The four sub-tables of a shader binding table, in buffer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SbtRegionKind {
    RayGen,
    Miss,
    Callable,
    Hit,
}

impl RtStage {
    pub const ALL: [RtStage; 6] = [
        RtStage::RayGen,
        RtStage::Miss,
        RtStage::Callable,
        RtStage::AnyHit,
        RtStage::ClosestHit,
        RtStage::Intersection,
    ];

    pub fn flags(self) -> ShaderStageFlags {
        match self {
            RtStage::RayGen => ShaderStageFlags::RAYGEN_KHR,
            RtStage::Miss => ShaderStageFlags::MISS_KHR,
            RtStage::Callable => ShaderStageFlags::CALLABLE_KHR,
            RtStage::AnyHit => ShaderStageFlags::ANY_HIT_KHR,
            RtStage::ClosestHit => ShaderStageFlags::CLOSEST_HIT_KHR,
            RtStage::Intersection => ShaderStageFlags::INTERSECTION_KHR,
        }
    }

    /// Position in the sort order used before grouping.
    #[inline]
    pub fn precedence(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_hit(self) -> bool {
        matches!(self, RtStage::AnyHit | RtStage::ClosestHit | RtStage::Intersection)
    }

    #[inline]
    pub fn is_general(self) -> bool {
        !self.is_hit()
    }

    /// Every stage lands in exactly one SBT region. General stages own a region each, hit stages share one.
    pub fn region(self) -> SbtRegionKind {
        match self {
            RtStage::RayGen => SbtRegionKind::RayGen,
            RtStage::Miss => SbtRegionKind::Miss,
            RtStage::Callable => SbtRegionKind::Callable,
            RtStage::AnyHit | RtStage::ClosestHit | RtStage::Intersection => SbtRegionKind::Hit,
        }
    }
}

impl TryFrom<ShaderStageFlags> for RtStage {
    type Error = anyhow::Error;

    fn try_from(flags: ShaderStageFlags) -> Result<Self> {
        match RtStage::ALL.into_iter().find(|stage| stage.flags() == flags) {
            Some(stage) => Ok(stage),
            None => bail!("Improper shader stage {:?} for a ray tracing pipeline", flags),
        }
    }
}

impl fmt::Display for RtStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RtStage::RayGen => "raygen",
            RtStage::Miss => "miss",
            RtStage::Callable => "callable",
            RtStage::AnyHit => "any-hit",
            RtStage::ClosestHit => "closest-hit",
            RtStage::Intersection => "intersection",
        };
        f.write_str(name)
    }
}

impl SbtRegionKind {
    pub const ALL: [SbtRegionKind; 4] = [SbtRegionKind::RayGen, SbtRegionKind::Miss, SbtRegionKind::Callable, SbtRegionKind::Hit];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_flags_round_trip() {
        for stage in RtStage::ALL {
            assert_eq!(RtStage::try_from(stage.flags()).unwrap(), stage);
        }
    }

    #[test]
    fn non_ray_tracing_stage_is_rejected() {
        assert!(RtStage::try_from(ShaderStageFlags::FRAGMENT).is_err());
        assert!(RtStage::try_from(ShaderStageFlags::RAYGEN_KHR | ShaderStageFlags::MISS_KHR).is_err());
    }

    #[test]
    fn region_order_follows_stage_precedence() {
        let regions = RtStage::ALL.map(RtStage::region);
        assert!(regions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(regions[5], SbtRegionKind::Hit);
    }
}
