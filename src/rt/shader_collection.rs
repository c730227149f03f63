use crate::rt::group_key::GroupKey;
use crate::rt::stage::RtStage;
use crate::vk_context::device::WrappedDevice;
use anyhow::{anyhow, bail, Result};
use ash::vk::{ShaderModule, ShaderModuleCreateInfo, ShaderStageFlags};
use log::info;
use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_COLLECTION_ID: AtomicU32 = AtomicU32::new(0);

/// A compiled shader module tagged with everything the pipeline and SBT builders need.
#[derive(Debug, Clone)]
pub struct ShaderEntry {
    pub module: ShaderModule,
    pub stage: ShaderStageFlags,
    pub key: GroupKey,
    pub entry_name: CString,
    pub collection_id: u32,
    /// Assigned by the group assembler.
    pub pipeline_group: Option<u32>,
}

impl ShaderEntry {
    pub fn new(module: ShaderModule, stage: ShaderStageFlags, key: GroupKey, entry_name: &str, collection_id: u32) -> Result<Self> {
        Ok(Self {
            module,
            stage,
            key,
            entry_name: CString::new(entry_name)?,
            collection_id,
            pipeline_group: None,
        })
    }

    #[inline]
    pub fn rt_stage(&self) -> Result<RtStage> {
        RtStage::try_from(self.stage)
    }

    #[inline]
    pub fn logical_group(&self) -> u16 {
        self.key.logical_group()
    }
}

struct ShaderProgram {
    stage: RtStage,
    key: GroupKey,
    entry_name: String,
    code: Vec<u32>,
}

/// Registry of SPIR-V binaries keyed by logical group and, for hit shaders, hit group.
pub struct ShaderCollection {
    id: u32,
    programs: Vec<ShaderProgram>,
}

impl Default for ShaderCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderCollection {
    pub fn new() -> Self {
        Self {
            id: NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed),
            programs: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn shader_count(&self) -> usize {
        self.programs.len()
    }

    pub fn logical_groups(&self) -> Vec<u16> {
        self.programs
            .iter()
            .map(|program| program.key.logical_group())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Registers a raygen, miss or callable shader.
    pub fn add_general(&mut self, logical: u32, stage: ShaderStageFlags, code: Vec<u32>, entry_name: &str) -> Result<()> {
        let stage = RtStage::try_from(stage)?;

        if stage.is_hit() {
            bail!("Unsupported shader stage {} for a general shader, try add_hit", stage);
        }

        let key = GroupKey::general(logical)?;

        if stage == RtStage::RayGen && self.find(key, stage).is_some() {
            bail!("Raygen shader already registered for {}", key);
        }

        self.push(stage, key, code, entry_name)
    }

    /// Registers an any-hit, closest-hit or intersection shader of hit group `hit`.
    pub fn add_hit(&mut self, logical: u32, hit: u32, stage: ShaderStageFlags, code: Vec<u32>, entry_name: &str) -> Result<()> {
        let stage = RtStage::try_from(stage)?;

        if stage.is_general() {
            bail!("Unsupported shader stage {} for a hit shader, try add_general", stage);
        }

        let key = GroupKey::hit(logical, hit)?;

        if self.find(key, stage).is_some() {
            bail!("{} shader already registered for {}", stage, key);
        }

        self.push(stage, key, code, entry_name)
    }

    pub fn add_general_from_file(&mut self, logical: u32, stage: ShaderStageFlags, path: impl AsRef<Path>, entry_name: &str) -> Result<()> {
        let code = read_spirv(path.as_ref())?;
        self.add_general(logical, stage, code, entry_name)
    }

    pub fn add_hit_from_file(&mut self, logical: u32, hit: u32, stage: ShaderStageFlags, path: impl AsRef<Path>, entry_name: &str) -> Result<()> {
        let code = read_spirv(path.as_ref())?;
        self.add_hit(logical, hit, stage, code, entry_name)
    }

    /// Creates shader modules for one logical group, or for every registered shader when `logical` is `None`.
    pub fn create_shaders(&self, device: &WrappedDevice, logical: Option<u16>) -> Result<Vec<ShaderEntry>> {
        let programs = self
            .programs
            .iter()
            .filter(|program| logical.map_or(true, |logical| program.key.logical_group() == logical))
            .collect::<Vec<_>>();

        if programs.is_empty() {
            match logical {
                Some(logical) => bail!("Unknown or empty logical group {}", logical),
                None => bail!("Shader collection {} is empty", self.id),
            }
        }

        let mut shaders = Vec::with_capacity(programs.len());

        for program in programs {
            let create_info = ShaderModuleCreateInfo::default().code(&program.code);

            let module = match unsafe { device.create_shader_module(&create_info, None) } {
                Ok(module) => module,
                Err(result) => {
                    destroy_shader_modules(device, &shaders);
                    return Err(anyhow!("Failed to create {} shader module for {}: {}", program.stage, program.key, result));
                }
            };

            shaders.push(ShaderEntry::new(module, program.stage.flags(), program.key, &program.entry_name, self.id)?);
        }

        Ok(shaders)
    }

    fn find(&self, key: GroupKey, stage: RtStage) -> Option<&ShaderProgram> {
        self.programs.iter().find(|program| program.key == key && program.stage == stage)
    }

    fn push(&mut self, stage: RtStage, key: GroupKey, code: Vec<u32>, entry_name: &str) -> Result<()> {
        if code.is_empty() {
            bail!("Empty SPIR-V binary for {} shader of {}", stage, key);
        }
        if entry_name.is_empty() || entry_name.contains('\0') {
            bail!("Invalid entry point name {:?} for {} shader of {}", entry_name, stage, key);
        }

        self.programs.push(ShaderProgram {
            stage,
            key,
            entry_name: entry_name.to_owned(),
            code,
        });

        Ok(())
    }
}

pub fn destroy_shader_modules(device: &WrappedDevice, shaders: &[ShaderEntry]) {
    shaders.iter().for_each(|shader| unsafe { device.destroy_shader_module(shader.module, None) });
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    info!("Loading shader: [ {} ]", path.display());

    let mut file = File::open(path).map_err(|error| anyhow!("Failed to open shader {}: {}", path.display(), error))?;

    Ok(ash::util::read_spv(&mut file)?)
}
