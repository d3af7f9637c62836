use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub const VENDOR_PREFIX: &'static str = "MB-";
    pub const SUFFIX_LEN: usize = 10;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id for this process, unique within the swarm with overwhelming
    /// probability.
    pub fn with_random_suffix() -> Self {
        let mut rng = rand::thread_rng();
        let suffix = Alphanumeric.sample_string(&mut rng, Self::SUFFIX_LEN);

        Self(format!("{}{}", Self::VENDOR_PREFIX, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
