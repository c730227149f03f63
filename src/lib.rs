pub mod render_resource;
pub mod rt;
pub mod util;
pub mod vk_context;
