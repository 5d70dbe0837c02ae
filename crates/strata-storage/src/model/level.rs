use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage level of file and slice data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Disk of the writer node
    Local,
    /// Intermediate object storage
    Staging,
    /// Destination of the import
    Target,
}

impl Level {
    pub const ALL: [Self; 3] = [Self::Local, Self::Staging, Self::Target];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Staging => "staging",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
