use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InferError, Result};

/// Tensor dimensions. `-1` marks a dimension left unbound at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dims(Vec<i64>);

impl Dims {
    pub fn new(dims: Vec<i64>) -> Self {
        Self(dims)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// True if any dimension is unbound (negative).
    pub fn is_dynamic(&self) -> bool {
        self.0.iter().any(|&d| d < 0)
    }

    /// Product of all dimensions, or `None` if any dimension is unbound.
    /// A rank-0 tensor has volume 1.
    pub fn volume(&self) -> Option<i64> {
        if self.is_dynamic() {
            return None;
        }
        Some(self.0.iter().product())
    }
}

impl From<Vec<i64>> for Dims {
    fn from(v: Vec<i64>) -> Self {
        Self(v)
    }
}

impl From<&[i64]> for Dims {
    fn from(v: &[i64]) -> Self {
        Self(v.to_vec())
    }
}

impl<const N: usize> From<[i64; N]> for Dims {
    fn from(v: [i64; N]) -> Self {
        Self(v.to_vec())
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("scalar");
        }
        let parts: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        f.write_str(&parts.join("x"))
    }
}

/// Element type of a binding (mirrors `nvinfer1::DataType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    Bool,
    Uint8,
    Fp8,
    Bf16,
    Int64,
}

impl DataType {
    /// Decode the TensorRT enum value.
    pub fn from_trt(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Float),
            1 => Some(Self::Half),
            2 => Some(Self::Int8),
            3 => Some(Self::Int32),
            4 => Some(Self::Bool),
            5 => Some(Self::Uint8),
            6 => Some(Self::Fp8),
            7 => Some(Self::Bf16),
            8 => Some(Self::Int64),
            _ => None,
        }
    }

    pub fn element_size(self) -> usize {
        match self {
            Self::Float | Self::Int32 => 4,
            Self::Half | Self::Bf16 => 2,
            Self::Int8 | Self::Uint8 | Self::Fp8 | Self::Bool => 1,
            Self::Int64 => 8,
        }
    }
}

/// Direction of a binding as declared by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingDirection {
    Input,
    Output,
}

/// Builder precision. Integer codes follow the session API: 0=FP32, 1=FP16, 2=INT8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

impl TryFrom<i32> for PrecisionMode {
    type Error = InferError;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Self::Fp32),
            1 => Ok(Self::Fp16),
            2 => Ok(Self::Int8),
            other => Err(InferError::InvalidInput(format!(
                "unknown precision mode {other} (expected 0=FP32, 1=FP16, 2=INT8)"
            ))),
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Int8 => "int8",
        })
    }
}

/// How the engine's network treats the batch dimension. Fixed when the
/// network is created; never switches at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    /// Batch is an out-of-band scalar passed at execution time.
    ImplicitBatch,
    /// Batch is part of every binding's shape.
    ExplicitBatch,
}

/// Min/opt/max shape triple for one dynamic input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeBounds {
    pub min: Dims,
    pub opt: Dims,
    pub max: Dims,
}

impl ShapeBounds {
    /// True if `dims` has the profile's rank and lies within [min, max].
    pub fn contains(&self, dims: &Dims) -> bool {
        dims.rank() == self.min.rank()
            && dims
                .as_slice()
                .iter()
                .zip(self.min.as_slice())
                .zip(self.max.as_slice())
                .all(|((&d, &lo), &hi)| d >= lo && d <= hi)
    }

    /// Reject `dims` with `DimensionMismatch` unless it lies within bounds.
    pub fn check(&self, binding: &str, dims: &Dims) -> Result<()> {
        if self.contains(dims) {
            return Ok(());
        }
        Err(InferError::DimensionMismatch {
            binding: binding.to_string(),
            dims: dims.as_slice().to_vec(),
            min: self.min.as_slice().to_vec(),
            max: self.max.as_slice().to_vec(),
        })
    }
}

/// An optimization profile for one named input, registered before compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationProfile {
    pub input: String,
    pub min: Dims,
    pub opt: Dims,
    pub max: Dims,
}

impl OptimizationProfile {
    /// Create a validated profile from full shapes.
    pub fn new(
        input: impl Into<String>,
        min: impl Into<Dims>,
        opt: impl Into<Dims>,
        max: impl Into<Dims>,
    ) -> Result<Self> {
        let profile = Self {
            input: input.into(),
            min: min.into(),
            opt: opt.into(),
            max: max.into(),
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Create a profile whose leading (batch) dimension is fixed to `batch_size`
    /// for all three shapes; the remaining dimensions are given per shape.
    pub fn with_batch(
        batch_size: u32,
        input: impl Into<String>,
        min: &[i64],
        opt: &[i64],
        max: &[i64],
    ) -> Result<Self> {
        let prefixed = |tail: &[i64]| {
            let mut dims = Vec::with_capacity(tail.len() + 1);
            dims.push(batch_size as i64);
            dims.extend_from_slice(tail);
            Dims::new(dims)
        };
        Self::new(input, prefixed(min), prefixed(opt), prefixed(max))
    }

    /// Check rank agreement, positivity and `min <= opt <= max`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| InferError::InvalidProfile {
            input: self.input.clone(),
            reason,
        };

        if self.input.is_empty() {
            return Err(invalid("input name is empty".into()));
        }
        let rank = self.min.rank();
        if rank == 0 || self.opt.rank() != rank || self.max.rank() != rank {
            return Err(invalid(format!(
                "rank mismatch: min {}, opt {}, max {}",
                self.min, self.opt, self.max
            )));
        }
        for i in 0..rank {
            let (lo, mid, hi) = (
                self.min.as_slice()[i],
                self.opt.as_slice()[i],
                self.max.as_slice()[i],
            );
            if lo <= 0 {
                return Err(invalid(format!("dimension {i} has non-positive minimum {lo}")));
            }
            if !(lo <= mid && mid <= hi) {
                return Err(invalid(format!(
                    "dimension {i} violates min <= opt <= max ({lo}, {mid}, {hi})"
                )));
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> ShapeBounds {
        ShapeBounds {
            min: self.min.clone(),
            opt: self.opt.clone(),
            max: self.max.clone(),
        }
    }
}

/// Per-binding metadata recorded by the binding manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingDescriptor {
    pub index: usize,
    pub name: String,
    /// Shape as declared by the engine; may contain `-1`.
    pub dims: Dims,
    /// Shape used for sizing, with unbound dimensions resolved.
    pub resolved_dims: Dims,
    pub dtype: DataType,
    pub direction: BindingDirection,
    pub size_bytes: usize,
    /// Profile bounds for dynamic inputs.
    pub bounds: Option<ShapeBounds>,
}

impl BindingDescriptor {
    pub fn is_input(&self) -> bool {
        self.direction == BindingDirection::Input
    }
}

/// Byte size of a binding buffer:
/// `volume(dims) * batch_size * element_size / dims[0]`.
///
/// The division assumes dimension 0 is the batch axis of every binding,
/// outputs included. A binding whose leading dimension is not the batch
/// axis gets a wrong size; callers must guarantee batch-leading layouts.
pub fn binding_size_bytes(dims: &Dims, batch_size: u32, dtype: DataType) -> Result<usize> {
    let leading = *dims.as_slice().first().ok_or_else(|| {
        InferError::InvalidBinding("rank-0 binding has no leading batch dimension".into())
    })?;
    let volume = dims
        .volume()
        .ok_or_else(|| InferError::InvalidBinding(format!("unresolved dimensions {dims}")))?;
    if volume <= 0 || leading <= 0 {
        return Err(InferError::InvalidBinding(format!(
            "dimensions {dims} have no positive volume"
        )));
    }
    if batch_size == 0 {
        return Err(InferError::InvalidInput("batch size must be positive".into()));
    }

    let overflow = || InferError::InvalidBinding(format!("size of {dims} overflows"));
    let numerator = (volume as u64)
        .checked_mul(batch_size as u64)
        .and_then(|v| v.checked_mul(dtype.element_size() as u64))
        .ok_or_else(overflow)?;
    usize::try_from(numerator / leading as u64).map_err(|_| overflow())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_matches_formula_for_batch_leading_shapes() {
        let dims = Dims::from([1, 3, 256, 256]);
        let size = binding_size_bytes(&dims, 4, DataType::Float).unwrap();
        assert_eq!(size, 256 * 256 * 3 * 4 * 4);

        let dims = Dims::from([8, 1000]);
        let size = binding_size_bytes(&dims, 8, DataType::Half).unwrap();
        assert_eq!(size, 8 * 1000 * 8 * 2 / 8);
    }

    #[test]
    fn size_is_positive_multiple_of_element_size() {
        let cases = [
            (Dims::from([2, 5, 7]), 3u32, DataType::Float),
            (Dims::from([1, 1]), 1, DataType::Int8),
            (Dims::from([4, 3, 17]), 2, DataType::Int64),
            (Dims::from([6, 9]), 5, DataType::Half),
        ];
        for (dims, batch, dtype) in cases {
            let size = binding_size_bytes(&dims, batch, dtype).unwrap();
            assert!(size > 0);
            assert_eq!(size % dtype.element_size(), 0, "{dims} x {batch} {dtype:?}");
            let volume = dims.volume().unwrap() as usize;
            let leading = dims.as_slice()[0] as usize;
            assert_eq!(size, volume * batch as usize * dtype.element_size() / leading);
        }
    }

    #[test]
    fn size_rejects_unresolved_and_scalar_bindings() {
        assert!(matches!(
            binding_size_bytes(&Dims::from([-1, 3, 8, 8]), 1, DataType::Float),
            Err(InferError::InvalidBinding(_))
        ));
        assert!(matches!(
            binding_size_bytes(&Dims::default(), 1, DataType::Float),
            Err(InferError::InvalidBinding(_))
        ));
        assert!(matches!(
            binding_size_bytes(&Dims::from([1, 4]), 0, DataType::Float),
            Err(InferError::InvalidInput(_))
        ));
    }

    #[test]
    fn unbound_dims_are_dynamic() {
        let declared = Dims::from([-1, 3, -1, -1]);
        assert!(declared.is_dynamic());
        assert_eq!(declared.volume(), None);
        assert_eq!(declared.to_string(), "-1x3x-1x-1");
    }

    #[test]
    fn profile_bounds_accept_and_reject() {
        let profile = OptimizationProfile::new(
            "input",
            [1, 3, 128, 128],
            [1, 3, 256, 256],
            [1, 3, 512, 512],
        )
        .unwrap();
        let bounds = profile.bounds();

        assert!(bounds.check("input", &Dims::from([1, 3, 256, 256])).is_ok());
        match bounds.check("input", &Dims::from([1, 3, 600, 600])) {
            Err(InferError::DimensionMismatch { binding, dims, .. }) => {
                assert_eq!(binding, "input");
                assert_eq!(dims, vec![1, 3, 600, 600]);
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
        assert!(!bounds.contains(&Dims::from([1, 3, 256])));
    }

    #[test]
    fn profile_validation() {
        assert!(OptimizationProfile::new("x", [1, 3], [1, 2], [1, 4]).is_err());
        assert!(OptimizationProfile::new("x", [0, 3], [1, 3], [1, 3]).is_err());
        assert!(OptimizationProfile::new("x", [1, 3], [1, 3, 3], [1, 3]).is_err());
        assert!(OptimizationProfile::new("", [1], [1], [1]).is_err());

        let p = OptimizationProfile::with_batch(2, "x", &[3, 64, 64], &[3, 128, 128], &[3, 256, 256])
            .unwrap();
        assert_eq!(p.min, Dims::from([2, 3, 64, 64]));
        assert_eq!(p.max, Dims::from([2, 3, 256, 256]));
    }

    #[test]
    fn precision_codes() {
        assert_eq!(PrecisionMode::try_from(0).unwrap(), PrecisionMode::Fp32);
        assert_eq!(PrecisionMode::try_from(1).unwrap(), PrecisionMode::Fp16);
        assert_eq!(PrecisionMode::try_from(2).unwrap(), PrecisionMode::Int8);
        assert!(PrecisionMode::try_from(3).is_err());

        let parsed: PrecisionMode = serde_json::from_str("\"fp16\"").unwrap();
        assert_eq!(parsed, PrecisionMode::Fp16);
    }

    #[test]
    fn data_type_codes() {
        assert_eq!(DataType::from_trt(0), Some(DataType::Float));
        assert_eq!(DataType::from_trt(1).map(DataType::element_size), Some(2));
        assert_eq!(DataType::from_trt(42), None);
    }
}
