use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let compiler = shaderc::Compiler::new().expect("failed to create shaderc compiler");
    let mut options = shaderc::CompileOptions::new().expect("failed to create shaderc options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );

    for (path, kind) in [
        ("shaders/quad.vert", shaderc::ShaderKind::Vertex),
        ("shaders/quad.frag", shaderc::ShaderKind::Fragment),
    ] {
        println!("cargo:rerun-if-changed={path}");
        let source = fs::read_to_string(path).unwrap_or_else(|e| panic!("read {path}: {e}"));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .expect("shader path has a file name");
        let artifact = compiler
            .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
            .unwrap_or_else(|e| panic!("compile {path}: {e}"));
        let out_path = Path::new(&out_dir).join(format!("{file_name}.spv"));
        fs::write(&out_path, artifact.as_binary_u8())
            .unwrap_or_else(|e| panic!("write {}: {e}", out_path.display()));
    }
}
