//! Turns a weights file into a flat `name -> tensor` mapping.
//!
//! Training scripts save checkpoints in many shapes: a bare state dict, a dict
//! wrapping it under `state_dict`/`model`/..., or keys carrying the `module.`
//! prefix added by data-parallel wrappers. Everything is normalized here before
//! the model sees it.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use candle_core::pickle::{self, Object, Stack};
use candle_core::{Device, Tensor};
use log::debug;

use crate::error::CheckpointError;

/// Keys that commonly wrap the real state dict, searched in order.
pub const WRAPPER_KEYS: [&str; 5] = ["state_dict", "model", "model_state_dict", "net", "weights"];

/// Prefix left behind by `DataParallel`/`DistributedDataParallel`.
pub const PARALLEL_PREFIX: &str = "module.";

const BATCH_COUNTER_SUFFIX: &str = "num_batches_tracked";

pub type StateDict = HashMap<String, Tensor>;

/// Top-level shape of a deserialized checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Entries as `(key, value is itself a mapping)`.
    Mapping(Vec<(String, bool)>),
    Other,
}

/// First wrapper key present whose value is a mapping.
pub fn wrapper_key(layout: &Layout) -> Option<&'static str> {
    let Layout::Mapping(entries) = layout else {
        return None;
    };
    WRAPPER_KEYS.into_iter().find(|candidate| {
        entries
            .iter()
            .any(|(key, is_mapping)| *is_mapping && key == candidate)
    })
}

/// Drops the data-parallel prefix; other keys pass through untouched.
pub fn strip_parallel_prefix<T>(entries: impl IntoIterator<Item = (String, T)>) -> HashMap<String, T> {
    entries
        .into_iter()
        .map(|(key, value)| match key.strip_prefix(PARALLEL_PREFIX) {
            Some(stripped) => (stripped.to_string(), value),
            None => (key, value),
        })
        .collect()
}

/// Reads the pickle inside a torch zip archive far enough to see its top-level keys.
pub fn inspect_layout(path: &Path) -> Result<Layout, CheckpointError> {
    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path)?))?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| CheckpointError::NoPickle(path.to_path_buf()))?;

    let mut reader = BufReader::new(archive.by_name(&pickle_name)?);
    let mut stack = Stack::empty();
    stack.read_loop(&mut reader)?;

    Ok(match stack.finalize()? {
        Object::Dict(entries) => Layout::Mapping(
            entries
                .into_iter()
                .filter_map(|(key, value)| match key {
                    Object::Unicode(key) => Some((key, matches!(value, Object::Dict(_)))),
                    _ => None,
                })
                .collect(),
        ),
        _ => Layout::Other,
    })
}

/// Loads and normalizes a checkpoint from a torch archive or a safetensors file.
pub fn load_state(path: &Path, device: &Device) -> Result<StateDict, CheckpointError> {
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    let entries: Vec<(String, Tensor)> = if is_safetensors {
        candle_core::safetensors::load(path, device)?.into_iter().collect()
    } else {
        let layout = inspect_layout(path)?;
        if layout == Layout::Other {
            return Err(CheckpointError::NotAMapping(path.to_path_buf()));
        }
        let key = wrapper_key(&layout);
        if let Some(key) = key {
            debug!("unwrapping checkpoint under `{key}`");
        }
        pickle::read_all_with_key(path, key)?
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
            .collect::<Result<_, CheckpointError>>()?
    };

    let state: StateDict = strip_parallel_prefix(entries)
        .into_iter()
        .filter(|(name, _)| !name.ends_with(BATCH_COUNTER_SUFFIX))
        .collect();
    if state.is_empty() {
        return Err(CheckpointError::NotAMapping(path.to_path_buf()));
    }
    Ok(state)
}
