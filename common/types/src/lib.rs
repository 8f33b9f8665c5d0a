use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Outcome of a dice rolling request: how many times each face came up.
///
/// This is the payload the API publishes and the worker consumes. Faces are
/// serialized as JSON object keys, so `{"3": 2}` means face 3 came up twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub rolls: i8,
    pub sides: i8,
    pub distribution: HashMap<i8, i32>,
}

impl DiceRoll {
    pub fn total_rolls(&self) -> i64 {
        self.distribution.values().map(|count| i64::from(*count)).sum()
    }
}
