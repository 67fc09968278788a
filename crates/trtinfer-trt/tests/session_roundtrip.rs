//! End-to-end session tests against a real ONNX model.
//!
//! Set `TRTINFER_TEST_ONNX` to a single-input image model with input shape
//! `N x 3 x H x W` and dynamic H/W (e.g. a UNet). Optionally set
//! `TRTINFER_TEST_OUTPUT` to an intermediate tensor name to force as output.

use std::path::PathBuf;

use trtinfer_core::{InferError, OptimizationProfile, PrecisionMode};
use trtinfer_gpu::GpuContext;
use trtinfer_trt::{EngineOptions, ModelSource, Session, SessionOptions};

fn onnx_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("TRTINFER_TEST_ONNX")?);
    path.exists().then_some(path)
}

fn input_name() -> String {
    std::env::var("TRTINFER_TEST_INPUT").unwrap_or_else(|_| "input".to_string())
}

fn options(model: ModelSource, cache: PathBuf) -> SessionOptions {
    let profile = OptimizationProfile::new(
        input_name(),
        [1, 3, 128, 128],
        [1, 3, 256, 256],
        [1, 3, 512, 512],
    )
    .unwrap();
    SessionOptions {
        model,
        engine_cache: cache,
        engine: EngineOptions {
            max_batch_size: 1,
            precision: PrecisionMode::Fp32,
            profiles: vec![profile],
            ..Default::default()
        },
    }
}

#[test]
fn build_then_load_round_trip() {
    let Some(onnx) = onnx_path() else {
        eprintln!("Skipping: TRTINFER_TEST_ONNX not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("model.engine");
    let gpu = GpuContext::default_device().unwrap();

    let built = Session::create(&gpu, options(ModelSource::new(&onnx), cache.clone())).unwrap();
    assert!(cache.exists(), "build should write the engine cache");

    // The second session must come from the cache, even without the model.
    let loaded = Session::create(
        &gpu,
        options(ModelSource::new(dir.path().join("missing.onnx")), cache.clone()),
    )
    .unwrap();

    assert_eq!(built.nb_bindings(), loaded.nb_bindings());
    assert_eq!(built.batch_size(), loaded.batch_size());
    assert_eq!(built.engine_kind(), loaded.engine_kind());
    for (a, b) in built.bindings().iter().zip(loaded.bindings()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.dims, b.dims);
        assert_eq!(a.dtype, b.dtype);
        assert_eq!(a.size_bytes, b.size_bytes);
    }

    let resaved = dir.path().join("resaved.engine");
    loaded.save_engine(&resaved).unwrap();
    assert!(std::fs::metadata(&resaved).unwrap().len() > 0);
}

#[test]
fn forward_is_repeatable() {
    let Some(onnx) = onnx_path() else {
        eprintln!("Skipping: TRTINFER_TEST_ONNX not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let gpu = GpuContext::default_device().unwrap();
    let mut session =
        Session::create(&gpu, options(ModelSource::new(&onnx), dir.path().join("m.engine"))).unwrap();

    let input = session.binding_index(&input_name()).unwrap_or(0);
    session.set_binding_dimensions(input, [1, 3, 256, 256]).unwrap();

    let len = 3 * 256 * 256;
    let data: Vec<f32> = (0..len).map(|i| (i % 251) as f32 / 251.0).collect();
    let output = (0..session.nb_bindings())
        .find(|&i| !session.binding(i).unwrap().is_input())
        .unwrap();

    let mut runs = Vec::new();
    for _ in 0..3 {
        session.copy_in(input, &data).unwrap();
        session.forward().unwrap();
        runs.push(session.copy_out_f32(output).unwrap());
    }
    let dtype = session.binding_dtype(output).unwrap();
    assert_eq!(runs[0].len(), session.binding_size(output).unwrap() / dtype.element_size());
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);

    // Async path on a separate stream gives the same answer.
    let stream = gpu.new_stream().unwrap();
    session.copy_in_async(input, &data, &stream).unwrap();
    session.forward_async(&stream).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(session.copy_out_f32(output).unwrap(), runs[0]);
}

#[test]
fn shapes_outside_the_profile_are_rejected() {
    let Some(onnx) = onnx_path() else {
        eprintln!("Skipping: TRTINFER_TEST_ONNX not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let gpu = GpuContext::default_device().unwrap();
    let mut session =
        Session::create(&gpu, options(ModelSource::new(&onnx), dir.path().join("m.engine"))).unwrap();
    let input = session.binding_index(&input_name()).unwrap_or(0);

    assert!(session.set_binding_dimensions(input, [1, 3, 256, 256]).is_ok());
    match session.set_binding_dimensions(input, [1, 3, 600, 600]) {
        Err(InferError::DimensionMismatch { dims, .. }) => assert_eq!(dims, vec![1, 3, 600, 600]),
        other => panic!("expected DimensionMismatch, got {other:?}"),
    }
    // The session stays usable after a rejected shape.
    session.forward().unwrap();

    let too_big = vec![0f32; session.binding_size(input).unwrap() / 4 + 1];
    assert!(matches!(
        session.copy_in(input, &too_big),
        Err(InferError::CopySizeMismatch { .. })
    ));
}

#[test]
fn forced_output_replaces_graph_outputs() {
    let Some(onnx) = onnx_path() else {
        eprintln!("Skipping: TRTINFER_TEST_ONNX not set");
        return;
    };
    let Ok(tensor) = std::env::var("TRTINFER_TEST_OUTPUT") else {
        eprintln!("Skipping: TRTINFER_TEST_OUTPUT not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let gpu = GpuContext::default_device().unwrap();
    let model = ModelSource::new(&onnx).with_outputs([tensor.clone()]);
    let session = Session::create(&gpu, options(model, dir.path().join("forced.engine"))).unwrap();

    assert_eq!(session.nb_output_bindings(), 1);
    let output = session.binding_index(&tensor).expect("forced output should be bound");
    assert!(!session.binding(output).unwrap().is_input());
}

#[test]
fn missing_model_without_cache_fails_to_create() {
    if onnx_path().is_none() {
        eprintln!("Skipping: TRTINFER_TEST_ONNX not set");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let gpu = GpuContext::default_device().unwrap();
    let result = Session::create(
        &gpu,
        options(
            ModelSource::new(dir.path().join("absent.onnx")),
            dir.path().join("absent.engine"),
        ),
    );
    assert!(matches!(result, Err(InferError::Parse { .. })));
}
