use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// A typed record identifier of the form `table:local_id`.
///
/// The string form is the canonical wire representation; the colon split is
/// only ever computed on demand.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(SmolStr);

impl RecordId {
    pub fn new(table: &str, local: &str) -> Self {
        RecordId(SmolStr::new(format!("{}:{}", table, local)))
    }

    /// Parse from the canonical `table:local_id` form. Requires exactly one
    /// non-empty part on each side of the first colon.
    pub fn parse(s: &str) -> Option<Self> {
        let (table, local) = s.split_once(':')?;
        if table.is_empty() || local.is_empty() {
            return None;
        }
        Some(RecordId(SmolStr::new(s)))
    }

    pub fn table(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or("")
    }

    pub fn local(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_smol(&self) -> SmolStr {
        self.0.clone()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl Serialize for RecordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        RecordId::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid record id: {}", s)))
    }
}
