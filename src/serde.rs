use super::Tally;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

impl Serialize for Tally {
    /// Serializes the aggregated total at the instant of the call.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.sum())
    }
}

impl<'de> Deserialize<'de> for Tally {
    /// Deserializes a total into a fresh [`Tally`] holding it.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sum = i64::deserialize(deserializer)?;
        let tally = Tally::new();
        tally.add(sum);
        Ok(tally)
    }
}
