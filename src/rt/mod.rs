pub mod group_assembler;
pub mod group_key;
pub mod pipeline;
pub mod sbt;
pub mod shader_collection;
pub mod shader_counts;
pub mod shader_sorter;
pub mod stage;
