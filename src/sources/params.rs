//! Parameter source backed by a configured table.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::ParameterSource;
use crate::profile::Param;

/// Serves data-model values from memory
#[derive(Debug, Default)]
pub struct InMemoryParameterSource {
    values: RwLock<BTreeMap<String, String>>,
}

impl InMemoryParameterSource {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, reference: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(reference.into(), value.into());
    }

    pub fn remove(&self, reference: &str) -> Option<String> {
        self.values.write().remove(reference)
    }
}

impl ParameterSource for InMemoryParameterSource {
    fn get_values(&self, params: &[Param]) -> BTreeMap<String, String> {
        let values = self.values.read();
        params
            .iter()
            .filter_map(|p| {
                values
                    .get(&p.reference)
                    .map(|v| (p.reference.clone(), v.clone()))
            })
            .collect()
    }
}
