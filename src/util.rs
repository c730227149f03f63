use anyhow::anyhow;
use anyhow::Result;
use std::ffi::{c_char, CStr};
use std::path::Path;

#[inline]
pub fn lib_root() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
}

/// Reads a nul-terminated string out of a fixed-size Vulkan char array.
#[inline]
pub fn cstr_to_str(vk_str: &[c_char]) -> Result<&str> {
    let bytes: &[u8] = bytemuck::cast_slice(vk_str);

    let nul_pos = bytes.iter().position(|&c| c == 0).ok_or_else(|| anyhow!("Missing nul terminator"))?;

    Ok(CStr::from_bytes_with_nul(&bytes[..=nul_pos])?.to_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_up_to_nul() {
        let raw = [b'r' as c_char, b't' as c_char, 0, b'x' as c_char];

        assert_eq!(cstr_to_str(&raw).unwrap(), "rt");
    }

    #[test]
    fn missing_nul_is_an_error() {
        let raw = [b'r' as c_char, b't' as c_char];

        assert!(cstr_to_str(&raw).is_err());
    }
}
