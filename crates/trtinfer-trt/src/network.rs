//! Network definition produced by the ONNX parser, and the graph edits
//! applied to it before compilation.

use std::collections::HashSet;
use std::ffi::{c_void, CString};
use std::path::Path;

use trtinfer_core::{Dims, InferError, OptimizationProfile, Result};

use crate::engine::{c_string, read_dims};

/// The graph operations the builder needs, abstracted so output marking and
/// profile checks can be tested without TensorRT.
pub trait NetworkGraph {
    fn nb_inputs(&self) -> usize;
    fn input_name(&self, index: usize) -> Option<String>;
    fn input_dims(&self, index: usize) -> Option<Dims>;
    fn nb_outputs(&self) -> usize;
    fn unmark_all_outputs(&mut self);
    fn nb_layers(&self) -> usize;
    fn layer_output_names(&self, layer: usize) -> Vec<Option<String>>;
    fn mark_layer_output(&mut self, layer: usize, output: usize) -> bool;
}

/// Replace the network's declared outputs with the tensors named in `names`.
///
/// Every existing output is unmarked first, then layers are scanned in order
/// and each layer output whose name equals an entry of `names` is marked.
/// A tensor is marked at most once. Returns the number of outputs marked.
pub fn mark_forced_outputs<G: NetworkGraph>(graph: &mut G, names: &[String]) -> Result<usize> {
    if names.is_empty() {
        return Ok(graph.nb_outputs());
    }

    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut marked: HashSet<String> = HashSet::new();

    graph.unmark_all_outputs();

    for layer in 0..graph.nb_layers() {
        for (output, name) in graph.layer_output_names(layer).into_iter().enumerate() {
            let Some(name) = name else { continue };
            if !wanted.contains(name.as_str()) || marked.contains(&name) {
                continue;
            }
            if !graph.mark_layer_output(layer, output) {
                return Err(InferError::TensorRt(format!(
                    "failed to mark '{name}' as a network output"
                )));
            }
            tracing::debug!(tensor = %name, layer, "marked forced output");
            marked.insert(name);
        }
    }

    for name in &wanted {
        if !marked.contains(*name) {
            tracing::warn!(tensor = %name, "forced output does not match any layer output");
        }
    }

    let count = graph.nb_outputs();
    tracing::info!(requested = wanted.len(), marked = count, "replaced network outputs");
    Ok(count)
}

/// Fail with `ProfileMissing` if an input has an unbound dimension and no
/// profile names it.
pub fn check_profiles<G: NetworkGraph>(graph: &G, profiles: &[OptimizationProfile]) -> Result<()> {
    for index in 0..graph.nb_inputs() {
        let name = graph.input_name(index).unwrap_or_default();
        let Some(dims) = graph.input_dims(index) else {
            continue;
        };
        if !dims.is_dynamic() {
            continue;
        }
        match profiles.iter().find(|p| p.input == name) {
            Some(profile) if profile.min.rank() != dims.rank() => {
                return Err(InferError::InvalidProfile {
                    input: name,
                    reason: format!(
                        "profile rank {} does not match network input {dims}",
                        profile.min.rank()
                    ),
                });
            }
            Some(_) => {}
            None => return Err(InferError::ProfileMissing { input: name }),
        }
    }
    Ok(())
}

/// Owned `INetworkDefinition`.
pub struct TrtNetwork {
    handle: *mut c_void,
}

impl TrtNetwork {
    /// Wrap a network handle returned by the builder.
    ///
    /// # Safety
    /// `handle` must be a live `INetworkDefinition` not owned elsewhere.
    pub(crate) unsafe fn from_raw(handle: *mut c_void) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> *mut c_void {
        self.handle
    }

    pub fn has_implicit_batch(&self) -> bool {
        unsafe { trtinfer_trt_sys::trt_network_has_implicit_batch(self.handle) != 0 }
    }
}

impl NetworkGraph for TrtNetwork {
    fn nb_inputs(&self) -> usize {
        unsafe { trtinfer_trt_sys::trt_network_nb_inputs(self.handle) }.max(0) as usize
    }

    fn input_name(&self, index: usize) -> Option<String> {
        unsafe { c_string(trtinfer_trt_sys::trt_network_input_name(self.handle, index as i32)) }
    }

    fn input_dims(&self, index: usize) -> Option<Dims> {
        read_dims(|out, max| unsafe {
            trtinfer_trt_sys::trt_network_input_dims(self.handle, index as i32, out, max)
        })
    }

    fn nb_outputs(&self) -> usize {
        unsafe { trtinfer_trt_sys::trt_network_nb_outputs(self.handle) }.max(0) as usize
    }

    fn unmark_all_outputs(&mut self) {
        unsafe { trtinfer_trt_sys::trt_network_unmark_all_outputs(self.handle) };
    }

    fn nb_layers(&self) -> usize {
        unsafe { trtinfer_trt_sys::trt_network_nb_layers(self.handle) }.max(0) as usize
    }

    fn layer_output_names(&self, layer: usize) -> Vec<Option<String>> {
        let count = unsafe { trtinfer_trt_sys::trt_layer_nb_outputs(self.handle, layer as i32) };
        (0..count.max(0))
            .map(|j| unsafe {
                c_string(trtinfer_trt_sys::trt_layer_output_name(self.handle, layer as i32, j))
            })
            .collect()
    }

    fn mark_layer_output(&mut self, layer: usize, output: usize) -> bool {
        unsafe {
            trtinfer_trt_sys::trt_network_mark_layer_output(self.handle, layer as i32, output as i32)
                != 0
        }
    }
}

impl Drop for TrtNetwork {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_network(self.handle) };
        }
    }
}

/// ONNX parser bound to a network definition.
pub struct OnnxParser {
    handle: *mut c_void,
}

impl OnnxParser {
    pub fn new(network: &TrtNetwork) -> Result<Self> {
        let handle = unsafe { trtinfer_trt_sys::trt_create_onnx_parser(network.handle()) };
        if handle.is_null() {
            return Err(InferError::TensorRt("failed to create ONNX parser".into()));
        }
        Ok(Self { handle })
    }

    /// Populate the bound network from an ONNX file.
    pub fn parse_file(&self, path: &Path) -> Result<()> {
        let parse_error = |reason: String| InferError::Parse {
            path: path.display().to_string(),
            reason,
        };

        if !path.is_file() {
            return Err(parse_error("model file not found".into()));
        }
        let path_c = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| parse_error("path contains a NUL byte".into()))?;

        let ok = unsafe { trtinfer_trt_sys::trt_parser_parse_from_file(self.handle, path_c.as_ptr()) };
        if ok != 0 {
            return Ok(());
        }

        let nb_errors = unsafe { trtinfer_trt_sys::trt_parser_nb_errors(self.handle) };
        let mut reasons: Vec<String> = (0..nb_errors)
            .filter_map(|i| unsafe { c_string(trtinfer_trt_sys::trt_parser_error_desc(self.handle, i)) })
            .collect();
        if reasons.is_empty() {
            reasons.push(
                crate::logger::last_error().unwrap_or_else(|| "ONNX parser rejected the model".into()),
            );
        }
        for reason in &reasons {
            tracing::error!(model = %path.display(), "{reason}");
        }
        Err(parse_error(reasons.join("; ")))
    }
}

impl Drop for OnnxParser {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_parser(self.handle) };
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory network: each layer has named outputs; outputs are tracked
    /// as (layer, index) pairs.
    #[derive(Default)]
    pub(crate) struct FakeNetwork {
        pub inputs: Vec<(String, Dims)>,
        pub layers: Vec<Vec<String>>,
        pub outputs: Vec<(usize, usize)>,
    }

    impl NetworkGraph for FakeNetwork {
        fn nb_inputs(&self) -> usize {
            self.inputs.len()
        }
        fn input_name(&self, index: usize) -> Option<String> {
            self.inputs.get(index).map(|(n, _)| n.clone())
        }
        fn input_dims(&self, index: usize) -> Option<Dims> {
            self.inputs.get(index).map(|(_, d)| d.clone())
        }
        fn nb_outputs(&self) -> usize {
            self.outputs.len()
        }
        fn unmark_all_outputs(&mut self) {
            self.outputs.clear();
        }
        fn nb_layers(&self) -> usize {
            self.layers.len()
        }
        fn layer_output_names(&self, layer: usize) -> Vec<Option<String>> {
            self.layers[layer].iter().cloned().map(Some).collect()
        }
        fn mark_layer_output(&mut self, layer: usize, output: usize) -> bool {
            self.outputs.push((layer, output));
            true
        }
    }

    fn network() -> FakeNetwork {
        FakeNetwork {
            inputs: vec![("input".into(), Dims::from([1, 3, 256, 256]))],
            layers: vec![
                vec!["conv1".into()],
                vec!["relu1".into()],
                vec!["split_a".into(), "split_b".into()],
                vec!["prob".into()],
            ],
            outputs: vec![(3, 0)],
        }
    }

    #[test]
    fn forced_outputs_replace_declared_outputs() {
        let mut net = network();
        let names = vec!["relu1".to_string(), "split_b".to_string()];
        let count = mark_forced_outputs(&mut net, &names).unwrap();
        assert_eq!(count, 2);
        assert_eq!(net.outputs, vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn forced_outputs_mark_each_tensor_once_and_skip_unknown() {
        let mut net = network();
        net.layers.push(vec!["relu1".into()]);
        let names = vec!["relu1".to_string(), "relu1".to_string(), "missing".to_string()];
        let count = mark_forced_outputs(&mut net, &names).unwrap();
        assert_eq!(count, 1);
        assert_eq!(net.outputs, vec![(1, 0)]);
    }

    #[test]
    fn empty_forced_list_keeps_declared_outputs() {
        let mut net = network();
        assert_eq!(mark_forced_outputs(&mut net, &[]).unwrap(), 1);
        assert_eq!(net.outputs, vec![(3, 0)]);
    }

    #[test]
    fn dynamic_input_without_profile_is_rejected() {
        let mut net = network();
        net.inputs[0].1 = Dims::from([1, 3, -1, -1]);
        match check_profiles(&net, &[]) {
            Err(InferError::ProfileMissing { input }) => assert_eq!(input, "input"),
            other => panic!("expected ProfileMissing, got {other:?}"),
        }

        let profile =
            OptimizationProfile::new("input", [1, 3, 128, 128], [1, 3, 256, 256], [1, 3, 512, 512])
                .unwrap();
        assert!(check_profiles(&net, &[profile]).is_ok());

        let wrong_rank = OptimizationProfile::new("input", [1, 3], [1, 3], [1, 3]).unwrap();
        assert!(matches!(
            check_profiles(&net, &[wrong_rank]),
            Err(InferError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn static_inputs_need_no_profile() {
        assert!(check_profiles(&network(), &[]).is_ok());
    }
}
