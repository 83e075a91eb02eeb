use std::borrow::Cow;

/// Source for every fullscreen pass; entry points are listed in [`ENTRY_POINTS`].
pub(crate) const PASSES_WGSL: &str = include_str!("shaders/passes.wgsl");

pub(crate) const VERTEX_ENTRY: &str = "vs_main";

/// Fragment entry points in `passes.wgsl`.
pub(crate) const ENTRY_POINTS: [&str; 6] = [
    "fs_place",
    "fs_blur",
    "fs_stylize",
    "fs_tone",
    "fs_blend",
    "fs_present",
];

pub(crate) fn compile_pass_module(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("layer passes"),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(PASSES_WGSL)),
    })
}

#[cfg(test)]
mod tests {
    use wgpu::naga::front::wgsl;
    use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};
    use wgpu::naga::ShaderStage;

    use super::*;

    fn parse() -> wgpu::naga::Module {
        wgsl::parse_str(PASSES_WGSL).unwrap_or_else(|err| {
            panic!("passes.wgsl failed to parse:\n{}", err.emit_to_string(PASSES_WGSL))
        })
    }

    #[test]
    fn passes_module_validates() {
        let module = parse();
        Validator::new(ValidationFlags::all(), Capabilities::empty())
            .validate(&module)
            .unwrap_or_else(|err| panic!("passes.wgsl failed validation: {err:?}"));
    }

    #[test]
    fn every_entry_point_is_present() {
        let module = parse();
        let find = |name: &str| {
            module
                .entry_points
                .iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.stage)
        };
        assert_eq!(find(VERTEX_ENTRY), Some(ShaderStage::Vertex));
        for name in ENTRY_POINTS {
            assert_eq!(find(name), Some(ShaderStage::Fragment), "{name}");
        }
    }
}
