use std::collections::HashSet;

/// Names of form fields the proxy itself has written.
///
/// A client part that reuses one of these names after the proxy wrote it is
/// an injection attempt.
#[derive(Debug, Default)]
pub struct FinalizedFieldSet {
    names: HashSet<String>,
}

impl FinalizedFieldSet {
    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}
