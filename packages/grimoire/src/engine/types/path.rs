use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A dot-separated field path, e.g. `author.name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path(pub Vec<SmolStr>);

impl Path {
    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            Path(vec![])
        } else {
            Path(s.split('.').map(SmolStr::new).collect())
        }
    }

    pub fn as_str(&self) -> String {
        self.0
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[SmolStr] {
        &self.0
    }

    /// True when the path is exactly the single segment `id`, which
    /// resolves to the row key rather than a field of the record value.
    pub fn is_id(&self) -> bool {
        self.0.len() == 1 && self.0[0] == "id"
    }

    /// Drop a leading segment if it matches, e.g. strip `parent.` off a
    /// param path that resolves against the parent row.
    pub fn strip_prefix(&self, segment: &str) -> Option<Path> {
        match self.0.first() {
            Some(first) if first == segment => Some(Path(self.0[1..].to_vec())),
            _ => None,
        }
    }
}

impl Serialize for Path {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(Path::new(&s))
    }
}
