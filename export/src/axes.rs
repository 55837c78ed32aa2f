//! Dynamic-axis declarations for the exported graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which axes of each named graph value vary per call, with their
/// symbolic names. Serializes as `{value: {axis: label}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicAxes(BTreeMap<String, BTreeMap<usize, String>>);

impl DynamicAxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder layout: `input` is `[batch, sequence]`, `output` is
    /// `[batch, time, hidden]` with the hidden width fixed.
    pub fn encoder(input: &str, output: &str) -> Self {
        let mut axes = Self::new();
        axes.insert(input, 0, "batch");
        axes.insert(input, 1, "sequence");
        axes.insert(output, 0, "batch");
        axes.insert(output, 1, "time");
        axes
    }

    /// Marks `axis` of `value` as dynamic under `label`.
    pub fn insert(&mut self, value: &str, axis: usize, label: &str) {
        self.0
            .entry(value.to_string())
            .or_default()
            .insert(axis, label.to_string());
    }

    /// Dynamic axes of one value.
    pub fn axes(&self, value: &str) -> Option<&BTreeMap<usize, String>> {
        self.0.get(value)
    }

    /// Fails when an axis declared for `value` is not below `rank`.
    pub fn check_rank(&self, value: &str, rank: usize) -> Result<(), String> {
        match self.axes(value).and_then(|a| a.keys().find(|&&axis| axis >= rank)) {
            Some(axis) => Err(format!(
                "{value:?} has rank {rank} but axis {axis} is declared dynamic"
            )),
            None => Ok(()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<usize, String>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
