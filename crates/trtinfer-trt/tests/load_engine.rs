//! Integration test: load a serialized engine through the FFI and check its
//! bindings.
//!
//! Set `TRTINFER_TEST_ENGINE` to a plan built for the local GPU.

use std::path::PathBuf;

use trtinfer_gpu::GpuContext;
use trtinfer_trt::{EngineStore, Session};

fn engine_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("TRTINFER_TEST_ENGINE")?);
    path.exists().then_some(path)
}

#[test]
fn load_cached_engine() {
    let Some(engine_path) = engine_path() else {
        eprintln!("Skipping: TRTINFER_TEST_ENGINE not set");
        return;
    };

    let gpu = GpuContext::default_device().expect("failed to create GPU context");
    let loaded = EngineStore::load(&engine_path)
        .expect("failed to deserialize engine")
        .expect("engine file should be readable");
    assert!(loaded.plan_bytes > 0);

    let engine = loaded.engine;
    let nb_bindings = engine.nb_bindings();
    assert!(nb_bindings >= 2, "engine should have an input and an output");

    let session = Session::from_engine(&gpu, engine, 1).expect("failed to create session");
    assert_eq!(session.nb_bindings(), nb_bindings);
    assert_eq!(
        session.nb_input_bindings() + session.nb_output_bindings(),
        nb_bindings
    );

    for desc in session.bindings() {
        assert!(desc.size_bytes > 0);
        assert_eq!(desc.size_bytes % desc.dtype.element_size(), 0);
        assert_eq!(session.binding_index(&desc.name), Some(desc.index));
        assert_ne!(session.binding_ptr(desc.index).unwrap(), 0);
        eprintln!(
            "  [{}] {} {:?} {} -> {} ({} bytes)",
            desc.index, desc.name, desc.direction, desc.dims, desc.resolved_dims, desc.size_bytes
        );
    }
}

#[test]
fn missing_engine_is_a_cache_miss() {
    let dir = tempfile::tempdir().unwrap();
    let result = EngineStore::load(&dir.path().join("nope.engine")).unwrap();
    assert!(result.is_none());
}
