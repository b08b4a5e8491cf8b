use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::blob::AnyBlob;
use crate::error::{ConvError, ParamError};
use crate::params::{Dict, LayerParams};

/// Which transform a convolution layer computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ConvMode {
    /// Forward convolution: full-resolution input, strided output.
    #[serde(alias = "conv")]
    Convolution,
    /// Transposed convolution: strided input, reconstructed full-resolution output.
    #[serde(alias = "deconv")]
    Deconvolution,
}

impl ConvMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convolution => "Convolution",
            Self::Deconvolution => "Deconvolution",
        }
    }
}

impl std::fmt::Display for ConvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters of a convolution layer. Immutable once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub group: usize,
    pub num_output: usize,
    pub bias_term: bool,
}

impl ConvGeometry {
    /// Parse and validate the geometry keys of `params`.
    ///
    /// Recognised keys: `kernel_h`/`kernel_w` or `kernel_size` (required),
    /// `pad_h`/`pad_w` or `pad` (default 0), `stride_h`/`stride_w` or
    /// `stride` (default 1), `num_output` (required), `bias_term`
    /// (default true) and `group` (default 1).
    pub fn from_params(params: &LayerParams) -> Result<Self, ConvError> {
        let dict = &params.dict;
        let (kernel_h, kernel_w) = read_pair(dict, "kernel_h", "kernel_w", "kernel_size", None)?;
        let (pad_h, pad_w) = read_pair(dict, "pad_h", "pad_w", "pad", Some(0))?;
        let (stride_h, stride_w) = read_pair(dict, "stride_h", "stride_w", "stride", Some(1))?;

        let geometry = Self {
            kernel_h,
            kernel_w,
            pad_h,
            pad_w,
            stride_h,
            stride_w,
            group: dict.get_or("group", 1usize)?,
            num_output: dict.get("num_output")?,
            bias_term: dict.get_or("bias_term", true)?,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check the invariants every later stage relies on.
    pub fn validate(&self) -> Result<(), ConvError> {
        let fail = |msg: String| Err(ConvError::InvalidGeometry(msg));
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return fail(format!(
                "kernel must be at least 1x1, got {}x{}",
                self.kernel_h, self.kernel_w
            ));
        }
        if self.stride_h == 0 || self.stride_w == 0 {
            return fail(format!(
                "stride must be at least 1, got {}x{}",
                self.stride_h, self.stride_w
            ));
        }
        if self.group == 0 {
            return fail("group must be at least 1".to_string());
        }
        if self.num_output == 0 {
            return fail("num_output must be at least 1".to_string());
        }
        if self.num_output % self.group != 0 {
            return fail(format!(
                "num_output ({}) is not divisible by group ({})",
                self.num_output, self.group
            ));
        }
        Ok(())
    }

    /// True when the window transform is the identity: 1x1 kernel, unit
    /// stride, no padding.
    pub fn is_1x1(&self) -> bool {
        self.kernel_h == 1
            && self.kernel_w == 1
            && self.stride_h == 1
            && self.stride_w == 1
            && self.pad_h == 0
            && self.pad_w == 0
    }
}

/// Read an `_h`/`_w` pair, falling back to the combined key and then to
/// `default`. `default == None` makes the parameter required.
///
/// A lone `_h` or `_w` key is ignored when the combined key is present and
/// is an error otherwise.
fn read_pair(
    dict: &Dict,
    key_h: &str,
    key_w: &str,
    combined: &str,
    default: Option<usize>,
) -> Result<(usize, usize), ParamError> {
    let lone = match (dict.has(key_h), dict.has(key_w)) {
        (true, true) => return Ok((dict.get(key_h)?, dict.get(key_w)?)),
        (true, false) => Some((key_h, key_w)),
        (false, true) => Some((key_w, key_h)),
        (false, false) => None,
    };
    if let Some((present, missing)) = lone {
        if !dict.has(combined) {
            return Err(ParamError::Unpaired {
                present: present.to_string(),
                missing: missing.to_string(),
            });
        }
        log::debug!("`{present}` without `{missing}`, using `{combined}`");
    }
    let v = match default {
        Some(d) => dict.get_or(combined, d)?,
        None => dict.get(combined)?,
    };
    Ok((v, v))
}

/// On-disk description of a single layer.
///
/// ```json
/// {
///   "name": "up1",
///   "type": "Deconvolution",
///   "params": { "kernel_size": 2, "stride": 2, "num_output": 4 },
///   "blobs": ["up1_w.cgb", "up1_b.cgb"]
/// }
/// ```
///
/// Blob paths are resolved relative to the description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDescription {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub mode: ConvMode,
    #[serde(default)]
    pub params: Dict,
    #[serde(default)]
    pub blobs: Vec<PathBuf>,
}

impl LayerDescription {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read layer description {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse layer description {}", path.display()))
    }

    /// Load the learned blobs and assemble [`LayerParams`].
    pub fn into_layer_params(self, base_dir: &Path) -> anyhow::Result<LayerParams> {
        let mut learned_blobs = Vec::with_capacity(self.blobs.len());
        for rel in &self.blobs {
            let path = if rel.is_absolute() {
                rel.clone()
            } else {
                base_dir.join(rel)
            };
            learned_blobs.push(AnyBlob::read(&path)?);
        }
        log::debug!(
            "layer `{}` ({}): {} param(s), {} learned blob(s)",
            self.name,
            self.mode,
            self.params.len(),
            learned_blobs.len()
        );
        Ok(LayerParams {
            name: self.name,
            dict: self.params,
            learned_blobs,
        })
    }
}

/// Load a layer description and its blobs from `path`.
pub fn load_layer(path: &Path) -> anyhow::Result<(ConvMode, LayerParams)> {
    let desc = LayerDescription::load(path)?;
    let mode = desc.mode;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    Ok((mode, desc.into_layer_params(base_dir)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;

    fn params(dict: Dict) -> LayerParams {
        LayerParams::new(dict, Vec::new())
    }

    #[test]
    fn combined_keys_and_defaults() {
        let g = ConvGeometry::from_params(&params(
            Dict::new().with("kernel_size", 3).with("num_output", 8),
        ))
        .unwrap();
        assert_eq!((g.kernel_h, g.kernel_w), (3, 3));
        assert_eq!((g.pad_h, g.pad_w), (0, 0));
        assert_eq!((g.stride_h, g.stride_w), (1, 1));
        assert_eq!(g.group, 1);
        assert!(g.bias_term);
    }

    #[test]
    fn split_keys_win_over_combined() {
        let g = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_size", 3)
                .with("kernel_h", 5)
                .with("kernel_w", 1)
                .with("pad", 1)
                .with("stride_h", 2)
                .with("stride_w", 1)
                .with("num_output", 4)
                .with("group", 2)
                .with("bias_term", 0),
        ))
        .unwrap();
        assert_eq!((g.kernel_h, g.kernel_w), (5, 1));
        assert_eq!((g.pad_h, g.pad_w), (1, 1));
        assert_eq!((g.stride_h, g.stride_w), (2, 1));
        assert_eq!(g.group, 2);
        assert!(!g.bias_term);
    }

    #[test]
    fn missing_required_keys() {
        let err = ConvGeometry::from_params(&params(Dict::new().with("num_output", 2))).unwrap_err();
        assert!(matches!(err, ConvError::Param(ParamError::Missing(k)) if k == "kernel_size"));

        let err = ConvGeometry::from_params(&params(Dict::new().with("kernel_size", 2))).unwrap_err();
        assert!(matches!(err, ConvError::Param(ParamError::Missing(k)) if k == "num_output"));
    }

    #[test]
    fn unpaired_key_is_rejected() {
        let err = ConvGeometry::from_params(&params(
            Dict::new().with("kernel_h", 3).with("num_output", 2),
        ))
        .unwrap_err();
        assert!(matches!(err, ConvError::Param(ParamError::Unpaired { .. })));
    }

    #[test]
    fn lone_key_defers_to_combined_key() {
        let g = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_h", 5)
                .with("kernel_size", 3)
                .with("stride_w", 2)
                .with("stride", 1)
                .with("num_output", 2),
        ))
        .unwrap();
        assert_eq!((g.kernel_h, g.kernel_w), (3, 3));
        assert_eq!((g.stride_h, g.stride_w), (1, 1));

        let err = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_size", 3)
                .with("pad_w", 1)
                .with("num_output", 2),
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            ConvError::Param(ParamError::Unpaired { ref present, .. }) if present == "pad_w"
        ));
    }

    #[test]
    fn group_must_divide_num_output() {
        let err = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_size", 1)
                .with("num_output", 6)
                .with("group", 4),
        ))
        .unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));
    }

    #[test]
    fn zero_stride_is_rejected() {
        let err = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_size", 3)
                .with("stride", 0)
                .with("num_output", 1),
        ))
        .unwrap_err();
        assert!(matches!(err, ConvError::InvalidGeometry(_)));
    }

    #[test]
    fn negative_pad_is_a_range_error() {
        let err = ConvGeometry::from_params(&params(
            Dict::new()
                .with("kernel_size", 3)
                .with("pad", -1)
                .with("num_output", 1),
        ))
        .unwrap_err();
        assert!(matches!(err, ConvError::Param(ParamError::Value { .. })));
    }

    #[test]
    fn one_by_one_needs_unit_stride_and_no_pad() {
        let mut g = ConvGeometry {
            kernel_h: 1,
            kernel_w: 1,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            group: 1,
            num_output: 1,
            bias_term: false,
        };
        assert!(g.is_1x1());
        g.stride_w = 2;
        assert!(!g.is_1x1());
        g.stride_w = 1;
        g.pad_h = 1;
        assert!(!g.is_1x1());
    }

    #[test]
    fn loads_description_with_relative_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let weight = AnyBlob::from(Blob::<f32>::zeros(&[2, 1, 3, 3]));
        weight.write(&dir.path().join("w.cgb")).unwrap();
        let desc_path = dir.path().join("layer.json");
        fs::write(
            &desc_path,
            r#"{"name": "c1", "type": "Convolution",
                "params": {"kernel_size": 3, "num_output": 2, "bias_term": false},
                "blobs": ["w.cgb"]}"#,
        )
        .unwrap();

        let (mode, params) = load_layer(&desc_path).unwrap();
        assert_eq!(mode, ConvMode::Convolution);
        assert_eq!(params.name, "c1");
        assert_eq!(params.learned_blobs, vec![weight]);
        assert_eq!(params.get::<i32>("num_output").unwrap(), 2);
    }

    #[test]
    fn mode_accepts_short_aliases() {
        let parse = |s: &str| serde_json::from_str::<ConvMode>(s);
        assert_eq!(parse(r#""Deconvolution""#).unwrap(), ConvMode::Deconvolution);
        assert_eq!(parse(r#""conv""#).unwrap(), ConvMode::Convolution);
        assert_eq!(parse(r#""deconv""#).unwrap(), ConvMode::Deconvolution);
        assert!(parse(r#""Pooling""#).is_err());
    }
}
