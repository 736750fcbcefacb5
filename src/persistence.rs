//! Versioned save/load of network parameters
//!
//! A network file is a JSON document holding, for every layer in declaration
//! order, its kind tag, its input/output shapes and the values of its
//! trainable parameters and persistent buffers. Values are written as `f64`,
//! which represents every finite `f32` exactly, so a save/load round trip is
//! bit-exact.
//!
//! Loading validates the whole file against the receiving layers before any
//! value is written; a mismatching file is rejected wholesale.

use crate::error::{DbnError, Result};
use crate::layers::{Layer, LayerKind};
use crate::shape::Shape;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Format tag written into every file.
pub const FORMAT: &str = "rust-dbn";

/// Current file version.
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub format: String,
    pub version: u32,
    pub layers: Vec<LayerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub kind: LayerKind,
    pub input_shape: Shape,
    pub output_shape: Shape,
    pub params: Vec<TensorRecord>,
    #[serde(default)]
    pub buffers: Vec<TensorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub values: Vec<f64>,
}

fn tensor(layer_index: usize, name: &str, values: &[f32]) -> Result<TensorRecord> {
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        return Err(DbnError::NonFinite(format!(
            "layer {} tensor '{}' holds {} at index {}",
            layer_index, name, values[pos], pos
        )));
    }
    Ok(TensorRecord {
        name: name.to_string(),
        values: values.iter().map(|&v| f64::from(v)).collect(),
    })
}

/// Snapshot the parameter state of `layers`.
pub fn record(layers: &[Box<dyn Layer>]) -> Result<NetworkRecord> {
    let mut records = Vec::with_capacity(layers.len());
    for (index, layer) in layers.iter().enumerate() {
        let params = layer
            .params()
            .iter()
            .map(|p| tensor(index, p.name(), &p.value))
            .collect::<Result<Vec<_>>>()?;
        let buffers = layer
            .buffers()
            .into_iter()
            .map(|(name, values)| tensor(index, name, values))
            .collect::<Result<Vec<_>>>()?;
        records.push(LayerRecord {
            kind: layer.kind(),
            input_shape: layer.input_shape(),
            output_shape: layer.output_shape(),
            params,
            buffers,
        });
    }
    Ok(NetworkRecord {
        format: FORMAT.to_string(),
        version: VERSION,
        layers: records,
    })
}

fn arch_error(message: String) -> DbnError {
    DbnError::Architecture(message)
}

fn check_tensors(
    layer: usize,
    what: &str,
    expected: &[(&str, usize)],
    found: &[TensorRecord],
) -> Result<()> {
    if expected.len() != found.len() {
        return Err(arch_error(format!(
            "layer {}: expected {} {}, file has {}",
            layer,
            expected.len(),
            what,
            found.len()
        )));
    }
    for ((name, len), record) in expected.iter().zip(found) {
        if *name != record.name || *len != record.values.len() {
            return Err(arch_error(format!(
                "layer {}: expected {} '{}' of {} values, file has '{}' of {}",
                layer,
                what,
                name,
                len,
                record.name,
                record.values.len()
            )));
        }
        if let Some(pos) = record.values.iter().position(|v| !(*v as f32).is_finite()) {
            return Err(DbnError::NonFinite(format!(
                "layer {} tensor '{}' value {} at index {} is not a finite f32",
                layer, record.name, record.values[pos], pos
            )));
        }
    }
    Ok(())
}

/// Check that `record` fits `layers` exactly.
pub fn validate(layers: &[Box<dyn Layer>], record: &NetworkRecord) -> Result<()> {
    if record.format != FORMAT {
        return Err(arch_error(format!("unknown format '{}'", record.format)));
    }
    if record.version != VERSION {
        return Err(DbnError::Version {
            expected: VERSION,
            found: record.version,
        });
    }
    if record.layers.len() != layers.len() {
        return Err(arch_error(format!(
            "network has {} layers, file has {}",
            layers.len(),
            record.layers.len()
        )));
    }

    for (index, (layer, rec)) in layers.iter().zip(&record.layers).enumerate() {
        if layer.kind() != rec.kind {
            return Err(arch_error(format!(
                "layer {}: expected {:?}, file has {:?}",
                index,
                layer.kind(),
                rec.kind
            )));
        }
        if layer.input_shape() != rec.input_shape || layer.output_shape() != rec.output_shape {
            return Err(arch_error(format!(
                "layer {}: expected {} -> {}, file has {} -> {}",
                index,
                layer.input_shape(),
                layer.output_shape(),
                rec.input_shape,
                rec.output_shape
            )));
        }
        let params: Vec<(&str, usize)> =
            layer.params().iter().map(|p| (p.name(), p.len())).collect();
        check_tensors(index, "parameters", &params, &rec.params)?;
        let buffers: Vec<(&str, usize)> =
            layer.buffers().iter().map(|(n, v)| (*n, v.len())).collect();
        check_tensors(index, "buffers", &buffers, &rec.buffers)?;
    }
    Ok(())
}

/// Validate `record` against `layers`, then overwrite their state.
pub fn restore(layers: &mut [Box<dyn Layer>], record: &NetworkRecord) -> Result<()> {
    validate(layers, record)?;
    for (layer, rec) in layers.iter_mut().zip(&record.layers) {
        for (param, tensor) in layer.params_mut().into_iter().zip(&rec.params) {
            for (dst, &src) in param.value.iter_mut().zip(&tensor.values) {
                *dst = src as f32;
            }
            param.zero_grad();
        }
        for ((_, buffer), tensor) in layer.buffers_mut().into_iter().zip(&rec.buffers) {
            for (dst, &src) in buffer.iter_mut().zip(&tensor.values) {
                *dst = src as f32;
            }
        }
    }
    Ok(())
}

/// Write the parameter state of `layers` to `path`.
pub fn save(layers: &[Box<dyn Layer>], path: impl AsRef<Path>) -> Result<()> {
    let record = record(layers)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &record)?;
    writer.flush()?;
    Ok(())
}

/// Read `path` and restore it into `layers`, or leave them untouched on error.
pub fn load(layers: &mut [Box<dyn Layer>], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let record: NetworkRecord = serde_json::from_reader(reader)?;
    restore(layers, &record).map_err(|err| {
        warn!(path = %path.display(), error = %err, "rejected network file");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BatchNormLayer, DenseLayer};
    use crate::utils::{Activation, SeededRng};

    fn layers(seed: u64) -> Vec<Box<dyn Layer>> {
        let mut rng = SeededRng::new(seed);
        vec![
            Box::new(DenseLayer::new(3, 2, Activation::Sigmoid, &mut rng)),
            Box::new(BatchNormLayer::new(Shape::flat(2), 1e-5, 0.9).unwrap()),
        ]
    }

    #[test]
    fn test_restore_copies_params_and_buffers() {
        let mut source = layers(1);
        source[1].buffers_mut()[0].1[0] = 0.123_456_7;
        let rec = record(&source).unwrap();

        let mut target = layers(2);
        restore(&mut target, &rec).unwrap();
        assert_eq!(target[0].params()[0].value, source[0].params()[0].value);
        assert_eq!(target[1].buffers()[0].1, source[1].buffers()[0].1);
    }

    #[test]
    fn test_non_finite_refused_on_save() {
        let mut source = layers(1);
        source[0].params_mut()[0].value[0] = f32::NAN;
        assert!(matches!(record(&source), Err(DbnError::NonFinite(_))));
    }

    #[test]
    fn test_version_mismatch_rejected_without_mutation() {
        let source = layers(1);
        let mut rec = record(&source).unwrap();
        rec.version = VERSION + 1;

        let mut target = layers(2);
        let before = target[0].params()[0].value.clone();
        assert!(matches!(
            restore(&mut target, &rec),
            Err(DbnError::Version { found, .. }) if found == VERSION + 1
        ));
        assert_eq!(target[0].params()[0].value, before);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let source = layers(1);
        let mut rec = record(&source).unwrap();
        rec.layers[1].kind = LayerKind::Dropout;
        assert!(matches!(validate(&layers(2), &rec), Err(DbnError::Architecture(_))));
    }
}
