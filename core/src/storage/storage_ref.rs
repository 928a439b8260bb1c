use serde::{Deserialize, Serialize};

/// Logical reference to a configured bucket. Documents only ever carry the
/// name; the resolver turns it into a live client.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StorageRef {
  pub name: String,
}

impl StorageRef {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }
}

impl std::fmt::Display for StorageRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name)
  }
}
