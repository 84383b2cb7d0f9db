use std::collections::BTreeMap;

use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};

use crate::value::{decode_json, encode_json, DecodeError, SqlValue};

/// Cumulative input/output counters for one account/asset pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub input: i64,
    #[serde(default)]
    pub output: i64,
}

impl Volume {
    pub fn new(input: i64, output: i64) -> Self {
        Self { input, output }
    }

    pub fn balance(&self) -> i64 {
        self.input - self.output
    }
}

// The derived balance is emitted next to the counters; it is ignored on the way back in.
impl Serialize for Volume {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Volume", 3)?;
        s.serialize_field("input", &self.input)?;
        s.serialize_field("output", &self.output)?;
        s.serialize_field("balance", &self.balance())?;
        s.end()
    }
}

pub type Balances = BTreeMap<String, i64>;

/// Per-asset volumes of a single account.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volumes(pub BTreeMap<String, Volume>);

impl Volumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asset: &str) -> Volume {
        self.0.get(asset).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, asset: impl Into<String>, volume: Volume) {
        self.0.insert(asset.into(), volume);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Volume)> {
        self.0.iter()
    }

    /// One entry per asset present; absent assets stay absent.
    pub fn balances(&self) -> Balances {
        self.0.iter().map(|(asset, v)| (asset.clone(), v.balance())).collect()
    }

    pub fn add_input(&mut self, asset: &str, amount: i64) {
        self.0.entry(asset.to_string()).or_default().input += amount;
    }

    pub fn add_output(&mut self, asset: &str, amount: i64) {
        self.0.entry(asset.to_string()).or_default().output += amount;
    }
}

impl FromIterator<(String, Volume)> for Volumes {
    fn from_iter<I: IntoIterator<Item = (String, Volume)>>(iter: I) -> Self {
        Volumes(iter.into_iter().collect())
    }
}

/// Volumes keyed by account address, e.g. the pre/post-commit state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregatedVolumes(pub BTreeMap<String, Volumes>);

impl AggregatedVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str) -> Option<&Volumes> {
        self.0.get(account)
    }

    pub fn volume(&self, account: &str, asset: &str) -> Volume {
        self.0.get(account).map(|v| v.get(asset)).unwrap_or_default()
    }

    pub fn set_volume(&mut self, account: &str, asset: &str, volume: Volume) {
        self.0
            .entry(account.to_string())
            .or_default()
            .insert(asset, volume);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds a posting's amount to the source's output and the destination's input.
    pub fn apply_posting(&mut self, source: &str, destination: &str, asset: &str, amount: i64) {
        self.0.entry(source.to_string()).or_default().add_output(asset, amount);
        self.0.entry(destination.to_string()).or_default().add_input(asset, amount);
    }

    pub fn to_stored(&self) -> Result<SqlValue, DecodeError> {
        encode_json(self)
    }

    /// Decodes a column written by [`AggregatedVolumes::to_stored`]. `NULL` is empty.
    pub fn from_stored(value: &SqlValue) -> Result<Self, DecodeError> {
        Ok(decode_json(value)?.unwrap_or_default())
    }
}

/// Fleet-wide per-asset sum plus the per-account breakdown it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedBalances {
    pub aggregated: Balances,
    pub accounts: BTreeMap<String, Balances>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn volumes(entries: &[(&str, i64, i64)]) -> Volumes {
        entries
            .iter()
            .map(|(a, i, o)| (a.to_string(), Volume::new(*i, *o)))
            .collect()
    }

    #[test]
    fn test_volume_serializes_balance() {
        let json = serde_json::to_value(Volume::new(100, 40)).unwrap();
        assert_eq!(json, serde_json::json!({"input": 100, "output": 40, "balance": 60}));
    }

    #[test]
    fn test_volume_ignores_stored_balance() {
        let v: Volume = serde_json::from_str(r#"{"input":10,"output":3,"balance":999}"#).unwrap();
        assert_eq!(v, Volume::new(10, 3));
        assert_eq!(v.balance(), 7);
    }

    #[test]
    fn test_balances_usd() {
        let v = volumes(&[("USD", 100, 40)]);
        assert_eq!(v.balances(), Balances::from([("USD".to_string(), 60)]));
    }

    #[test]
    fn test_missing_asset_is_zero_volume() {
        let v = volumes(&[("USD", 1, 0)]);
        assert_eq!(v.get("EUR"), Volume::default());
        assert!(!v.balances().contains_key("EUR"));
    }

    #[test]
    fn test_apply_posting() {
        let mut agg = AggregatedVolumes::new();
        agg.apply_posting("world", "bank", "USD", 100);
        agg.apply_posting("bank", "alice", "USD", 30);
        assert_eq!(agg.volume("world", "USD"), Volume::new(0, 100));
        assert_eq!(agg.volume("bank", "USD"), Volume::new(100, 30));
        assert_eq!(agg.volume("alice", "USD"), Volume::new(30, 0));
    }

    #[test]
    fn test_aggregated_volumes_from_null_is_empty() {
        assert!(AggregatedVolumes::from_stored(&SqlValue::Null).unwrap().is_empty());
    }

    #[test]
    fn test_aggregated_volumes_rejects_integer_column() {
        let err = AggregatedVolumes::from_stored(&SqlValue::Integer(1)).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedRepresentation(_)));
    }

    fn arb_volumes() -> impl Strategy<Value = Volumes> {
        prop::collection::btree_map("[A-Z]{1,4}", (0..i64::MAX / 2, 0..i64::MAX / 2), 0..6)
            .prop_map(|m| m.into_iter().map(|(k, (i, o))| (k, Volume::new(i, o))).collect())
    }

    proptest! {
        #[test]
        fn prop_serialized_balance_matches(input in 0..i64::MAX / 2, output in 0..i64::MAX / 2) {
            let v = Volume::new(input, output);
            let json = serde_json::to_value(v).unwrap();
            prop_assert_eq!(json["balance"].as_i64(), Some(input - output));
            prop_assert_eq!(v.balance(), input - output);
        }

        #[test]
        fn prop_balances_keep_key_set(v in arb_volumes()) {
            let balances = v.balances();
            prop_assert!(balances.keys().eq(v.0.keys()));
        }

        #[test]
        fn prop_aggregated_volumes_round_trip(
            m in prop::collection::btree_map("[a-z:0-9]{1,8}", arb_volumes(), 0..5)
        ) {
            let agg = AggregatedVolumes(m);
            let stored = agg.to_stored().unwrap();
            prop_assert_eq!(AggregatedVolumes::from_stored(&stored).unwrap(), agg);
        }
    }
}
