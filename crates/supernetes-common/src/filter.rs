//! Regex-based predicate pair limiting what the agent exposes and accepts

use regex::Regex;
use serde::Deserialize;

/// Filter configuration for retrieving nodes and jobs. An absent pattern
/// matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    partition: Option<Regex>,
    node: Option<Regex>,
}

impl Filter {
    /// Create a filter from optional regex patterns
    pub fn new(partition: Option<&str>, node: Option<&str>) -> crate::Result<Self> {
        Ok(Self {
            partition: partition.map(Regex::new).transpose().map_err(|e| {
                crate::Error::config(format!("invalid partition filter: {e}"))
            })?,
            node: node
                .map(Regex::new)
                .transpose()
                .map_err(|e| crate::Error::config(format!("invalid node filter: {e}")))?,
        })
    }

    /// Match a scheduler partition name
    pub fn partition(&self, input: &str) -> bool {
        match &self.partition {
            Some(re) => re.is_match(input),
            None => true, // No filtering
        }
    }

    /// Match a node name
    pub fn node(&self, input: &str) -> bool {
        match &self.node {
            Some(re) => re.is_match(input),
            None => true, // No filtering
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterRepr {
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    node: Option<String>,
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = FilterRepr::deserialize(deserializer)?;
        Filter::new(repr.partition.as_deref(), repr.node.as_deref())
            .map_err(serde::de::Error::custom)
    }
}
