pub mod render_buffer;
