//! Builds a two-program ray tracing pipeline from pre-compiled SPIR-V, fills a binding table and traces once.
//!
//! The shader directory (first argument, `shaders/spv` under the library root by default) must contain
//! `main.rgen.spv`, `main.rmiss.spv`, `shadow.rmiss.spv`, `triangle.rchit.spv`, `sphere.rchit.spv` and `sphere.rint.spv`.

use anyhow::{bail, Result};
use ash::vk::{PipelineLayoutCreateInfo, ShaderStageFlags};
use chrono::Local;
use log::info;
use rt_binding_table::rt::pipeline::{RayTracingPipeline, RayTracingPipelineRef, RtPipelineSettings};
use rt_binding_table::rt::sbt::ShaderBindingTable;
use rt_binding_table::rt::shader_collection::ShaderCollection;
use rt_binding_table::rt::stage::SbtRegionKind;
use rt_binding_table::{util, vk_context};
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

const PRIMARY: u32 = 0;
const SECONDARY: u32 = 1;

fn setup_logger() {
    if env::var_os("RUST_LOG").is_none() {
        unsafe { env::set_var("RUST_LOG", "debug") };
    }

    env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "[{} {:<5} {}] {}", Local::now().format("%H:%M:%S%.3f"), record.level(), record.target(), record.args()))
        .init();
}

fn load_collection(shader_dir: &Path) -> Result<ShaderCollection> {
    let mut collection = ShaderCollection::new();

    collection.add_general_from_file(PRIMARY, ShaderStageFlags::RAYGEN_KHR, shader_dir.join("main.rgen.spv"), "main")?;
    collection.add_general_from_file(PRIMARY, ShaderStageFlags::MISS_KHR, shader_dir.join("main.rmiss.spv"), "main")?;
    collection.add_general_from_file(PRIMARY, ShaderStageFlags::MISS_KHR, shader_dir.join("shadow.rmiss.spv"), "main")?;
    collection.add_hit_from_file(PRIMARY, 0, ShaderStageFlags::CLOSEST_HIT_KHR, shader_dir.join("triangle.rchit.spv"), "main")?;
    collection.add_hit_from_file(PRIMARY, 1, ShaderStageFlags::CLOSEST_HIT_KHR, shader_dir.join("sphere.rchit.spv"), "main")?;
    collection.add_hit_from_file(PRIMARY, 1, ShaderStageFlags::INTERSECTION_KHR, shader_dir.join("sphere.rint.spv"), "main")?;

    collection.add_general_from_file(SECONDARY, ShaderStageFlags::RAYGEN_KHR, shader_dir.join("main.rgen.spv"), "main")?;
    collection.add_general_from_file(SECONDARY, ShaderStageFlags::MISS_KHR, shader_dir.join("main.rmiss.spv"), "main")?;
    collection.add_hit_from_file(SECONDARY, 0, ShaderStageFlags::CLOSEST_HIT_KHR, shader_dir.join("triangle.rchit.spv"), "main")?;

    Ok(collection)
}

fn run() -> Result<()> {
    let shader_dir = env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| util::lib_root().join("shaders").join("spv"));

    let collection = load_collection(&shader_dir)?;
    info!("Shader collection {} loaded: {} shaders, logical groups {:?}", collection.id(), collection.shader_count(), collection.logical_groups());

    let (device, allocator) = vk_context::init_vulkan_context(true, "rt_binding_table_test", vk_context::ENGINE_VERSION)?;

    let pipeline_layout = unsafe { device.create_pipeline_layout(&PipelineLayoutCreateInfo::default(), None)? };

    let shaders = collection.create_shaders(&device, None)?;
    let pipeline: RayTracingPipelineRef = RayTracingPipeline::new(device.clone(), pipeline_layout, shaders, RtPipelineSettings::default())?.into();

    for logical_group in collection.logical_groups() {
        let batch = pipeline.group_info(logical_group)?;
        info!("Logical group {} starts at pipeline group {} with {:?}", logical_group, batch.first_group, batch.counts);
    }

    let mut sbt = ShaderBindingTable::new(pipeline.clone(), PRIMARY as u16)?.with_user_data_size(16);
    sbt.set_record_data(SbtRegionKind::Hit, 1, &1.5_f32.to_le_bytes())?;
    sbt.build(&allocator)?;
    sbt.build(&allocator)?;

    let (Some(layout), Some(buffer)) = (sbt.layout(), sbt.buffer()) else {
        bail!("Shader binding table was not built");
    };

    let first_group = sbt.batch().first_group;
    let record_count = layout.record_count();
    let handles = unsafe {
        device
            .rt_pipeline_device
            .get_ray_tracing_shader_group_handles(pipeline.handle, first_group, record_count, record_count as usize * layout.handle_size as usize)?
    };

    let contents: Vec<u8> = allocator.download_data(buffer)?;
    let handle_size = layout.handle_size as usize;
    let record_size = layout.record_size as usize;

    for record in 0..record_count as usize {
        let stored = &contents[record * record_size..record * record_size + handle_size];
        if stored != &handles[record * handle_size..(record + 1) * handle_size] {
            bail!("Record {} does not hold the handle of pipeline group {}", record, first_group as usize + record);
        }
    }
    info!("Shader binding table holds {} handles at stride {}", record_count, record_size);

    let mut traced = Ok(());
    device.single_time_command(|_, cmd_buf| {
        pipeline.bind(cmd_buf);
        traced = sbt.trace_rays(cmd_buf, 64, 64, 1);
    })?;
    traced?;

    info!("Ray tracing dispatch finished");

    drop(sbt);
    drop(pipeline);
    unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };

    Ok(())
}

fn main() {
    setup_logger();

    if let Err(error) = run() {
        log::error!("{:?}", error);
        std::process::exit(1);
    }
}
