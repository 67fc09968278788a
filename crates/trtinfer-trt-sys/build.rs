use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(trt_stub)");
    println!("cargo:rerun-if-changed=trt_shim.cpp");
    println!("cargo:rerun-if-env-changed=TENSORRT_INCLUDE_DIR");
    println!("cargo:rerun-if-env-changed=TENSORRT_LIB_DIR");
    println!("cargo:rerun-if-env-changed=CUDA_ROOT");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=TRTINFER_STUB");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let shim_cpp = manifest_dir.join("trt_shim.cpp");

    let trt_include = find_trt_include_dir();
    let cuda_include = find_cuda_include_dir();

    // Without headers there is nothing to compile against; the Rust side
    // substitutes stub functions that report TensorRT as unavailable.
    let (trt_include, cuda_include) = match (trt_include, cuda_include) {
        (Some(trt), Some(cuda)) if env::var_os("TRTINFER_STUB").is_none() => (trt, cuda),
        _ => {
            println!("cargo:warning=TensorRT or CUDA headers not found, building in stub mode");
            println!("cargo:rustc-cfg=trt_stub");
            return;
        }
    };

    // The shim uses the binding-index API, which TensorRT 10 removed.
    match trt_major_version(&trt_include) {
        Some(8) => {}
        other => {
            println!(
                "cargo:warning=TensorRT 8.x required (found major version {other:?}), building in stub mode"
            );
            println!("cargo:rustc-cfg=trt_stub");
            return;
        }
    }

    let mut build = cc::Build::new();
    build
        .cpp(true)
        .file(&shim_cpp)
        .include(&trt_include)
        .include(&cuda_include)
        .warnings(false)
        .opt_level(2);

    if cfg!(target_os = "windows") {
        build.flag("/std:c++17").flag("/EHsc");
    } else {
        build.flag("-std=c++17");
    }

    build.compile("trt_shim");

    if let Some(lib_dir) = find_trt_lib_dir() {
        println!("cargo:rustc-link-search=native={}", lib_dir.display());
    }

    println!("cargo:rustc-link-lib=nvinfer");
    println!("cargo:rustc-link-lib=nvinfer_plugin");
    println!("cargo:rustc-link-lib=nvonnxparser");

    // MSVC links the C++ runtime automatically.
    if !cfg!(target_env = "msvc") {
        println!("cargo:rustc-link-lib=stdc++");
    }
}

/// Read `NV_TENSORRT_MAJOR` from NvInferVersion.h.
fn trt_major_version(include_dir: &PathBuf) -> Option<u32> {
    let header = std::fs::read_to_string(include_dir.join("NvInferVersion.h")).ok()?;
    header.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("#define NV_TENSORRT_MAJOR")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Find the directory containing NvInfer.h.
fn find_trt_include_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("TENSORRT_INCLUDE_DIR") {
        let p = PathBuf::from(dir);
        if p.join("NvInfer.h").exists() {
            return Some(p);
        }
    }

    if cfg!(target_os = "linux") {
        for dir in [
            "/usr/include/x86_64-linux-gnu",
            "/usr/include/aarch64-linux-gnu",
            "/usr/local/TensorRT/include",
            "/usr/include",
        ] {
            let p = PathBuf::from(dir);
            if p.join("NvInfer.h").exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Find the CUDA include directory containing cuda_runtime_api.h.
fn find_cuda_include_dir() -> Option<PathBuf> {
    for var in ["CUDA_ROOT", "CUDA_PATH"] {
        if let Ok(cuda_path) = env::var(var) {
            let p = PathBuf::from(&cuda_path).join("include");
            if p.join("cuda_runtime_api.h").exists() {
                return Some(p);
            }
        }
    }

    if cfg!(target_os = "linux") {
        for dir in ["/usr/local/cuda/include", "/usr/include"] {
            let p = PathBuf::from(dir);
            if p.join("cuda_runtime_api.h").exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Find the TensorRT library directory.
fn find_trt_lib_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("TENSORRT_LIB_DIR") {
        let p = PathBuf::from(dir);
        if p.exists() {
            return Some(p);
        }
    }

    if cfg!(target_os = "linux") {
        for dir in [
            "/usr/lib/x86_64-linux-gnu",
            "/usr/lib/aarch64-linux-gnu",
            "/usr/local/TensorRT/lib",
            "/usr/local/lib",
            "/usr/lib",
        ] {
            let p = PathBuf::from(dir);
            if p.join("libnvinfer.so.8").exists() || p.join("libnvinfer.so").exists() {
                return Some(p);
            }
        }
    }

    None
}
