//! Key/value annotations attached to accounts and transactions.
//!
//! Values are opaque JSON documents kept exactly as they were written. A few
//! keys under the [`NAMESPACE`] prefix carry lifecycle facts about
//! transactions: which transaction a revert points at, and whether a
//! transaction has itself been reverted.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::value::{decode_json, encode_json, DecodeError, SqlValue};

pub const NAMESPACE: &str = "com.numary.spec/";

const REVERTS_KEY: &str = "state/reverts";
const REVERTED_KEY: &str = "state/reverted";
const REVERTED_BY_KEY: &str = "state/reverted-by";

/// Raw encoding of the reverted marker. Compared byte for byte.
const REVERTED_MARKER: &str = "\"reverted\"";

pub fn spec_key(name: &str) -> String {
    format!("{}{}", NAMESPACE, name)
}

pub fn reverts_key() -> String {
    spec_key(REVERTS_KEY)
}

pub fn reverted_key() -> String {
    spec_key(REVERTED_KEY)
}

pub fn reverted_by_key() -> String {
    spec_key(REVERTED_BY_KEY)
}

/// A verbatim JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataValue(Box<RawValue>);

impl MetadataValue {
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::value::to_raw_value(value)?))
    }

    /// Wraps already-encoded JSON without re-encoding it. The text must be valid JSON.
    pub fn from_raw(raw: impl Into<String>) -> Result<Self, serde_json::Error> {
        Ok(Self(RawValue::from_string(raw.into())?))
    }

    pub fn as_raw(&self) -> &str {
        self.0.get()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.0.get())
    }
}

impl PartialEq for MetadataValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl Eq for MetadataValue {}

/// Attribution recorded on a transaction once another one reverted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertedBy {
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.0.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    /// Right-biased merge: keys from `other` overwrite, everything else is kept.
    pub fn merge(&mut self, other: Metadata) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    /// Records that this transaction reverts `tx_id`. Does not touch the reverted marker.
    pub fn mark_reverts(&mut self, tx_id: u64) {
        self.merge(revert_metadata(tx_id));
    }

    /// The transaction this one reverts, if any.
    pub fn reverts(&self) -> Option<u64> {
        self.get(&reverts_key())
            .and_then(|v| v.decode::<String>().ok())
            .and_then(|s| s.parse().ok())
    }

    pub fn is_reverted(&self) -> bool {
        self.get(&reverted_key())
            .map(|v| is_reverted_marker(v.as_raw()))
            .unwrap_or(false)
    }

    pub fn reverted_by(&self) -> Option<u64> {
        self.get(&reverted_by_key())
            .and_then(|v| v.decode::<RevertedBy>().ok())
            .and_then(|r| r.by.parse().ok())
    }

    pub fn to_stored(&self) -> Result<SqlValue, DecodeError> {
        encode_json(self)
    }

    /// Decodes a column written by [`Metadata::to_stored`]. `NULL` is empty.
    pub fn from_stored(value: &SqlValue) -> Result<Self, DecodeError> {
        Ok(decode_json(value)?.unwrap_or_default())
    }
}

impl FromIterator<(String, MetadataValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetadataValue)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

/// The only place the reverted encoding is interpreted.
pub fn is_reverted_marker(raw: &str) -> bool {
    raw == REVERTED_MARKER
}

/// Single-key metadata with `value` JSON-encoded under `key`.
pub fn compute_metadata<T: Serialize + ?Sized>(key: &str, value: &T) -> Metadata {
    let mut m = Metadata::new();
    // strings and plain structs never fail to encode
    if let Ok(v) = MetadataValue::from_json(value) {
        m.insert(key, v);
    }
    m
}

pub fn revert_metadata(tx_id: u64) -> Metadata {
    compute_metadata(&reverts_key(), &tx_id.to_string())
}

/// Marker plus attribution, written onto the transaction that was reverted.
pub fn reverted_metadata(by: u64) -> Metadata {
    let mut m = compute_metadata(&reverted_key(), "reverted");
    m.merge(compute_metadata(
        &reverted_by_key(),
        &RevertedBy { by: by.to_string() },
    ));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn raw(s: &str) -> MetadataValue {
        MetadataValue::from_raw(s).unwrap()
    }

    #[test]
    fn test_merge_is_right_biased() {
        let mut a = Metadata::from_iter([("k".to_string(), raw("1")), ("a".to_string(), raw("\"x\""))]);
        let b = Metadata::from_iter([("k".to_string(), raw("2")), ("b".to_string(), raw("true"))]);
        a.merge(b);
        assert_eq!(a.get("k").unwrap().as_raw(), "2");
        assert_eq!(a.get("a").unwrap().as_raw(), "\"x\"");
        assert_eq!(a.get("b").unwrap().as_raw(), "true");
    }

    #[test]
    fn test_mark_reverts_sets_reverts_only() {
        let mut m = Metadata::new();
        m.mark_reverts(42);
        assert_eq!(m.get(&reverts_key()).unwrap().as_raw(), "\"42\"");
        assert_eq!(m.reverts(), Some(42));
        assert!(!m.contains_key(&reverted_key()));
        assert!(!m.is_reverted());
    }

    #[test]
    fn test_mark_reverts_keeps_existing_reverted_marker() {
        let mut m = reverted_metadata(7);
        m.mark_reverts(42);
        assert!(m.is_reverted());
        assert_eq!(m.reverted_by(), Some(7));
    }

    #[test]
    fn test_is_reverted_literal_only() {
        let with = |s: &str| Metadata::from_iter([(reverted_key(), raw(s))]);
        assert!(with("\"reverted\"").is_reverted());
        assert!(!with("\"Reverted\"").is_reverted());
        assert!(!with("\"\\u0072everted\"").is_reverted());
        assert!(!with("{\"by\":\"1\"}").is_reverted());
        assert!(!Metadata::new().is_reverted());
    }

    #[test]
    fn test_reverted_metadata() {
        let m = reverted_metadata(12);
        assert!(m.is_reverted());
        assert_eq!(m.get(&reverted_by_key()).unwrap().as_raw(), r#"{"by":"12"}"#);
        assert_eq!(m.reverted_by(), Some(12));
    }

    #[test]
    fn test_stored_values_kept_verbatim() {
        let stored = SqlValue::Text(r#"{"a": {"z":1,  "b":[1, 2]},"n":1.50}"#.to_string());
        let m = Metadata::from_stored(&stored).unwrap();
        assert_eq!(m.get("a").unwrap().as_raw(), r#"{"z":1,  "b":[1, 2]}"#);
        assert_eq!(m.get("n").unwrap().as_raw(), "1.50");
    }

    #[test]
    fn test_from_stored_rejects_unknown_representation() {
        assert!(matches!(
            Metadata::from_stored(&SqlValue::Real(1.0)),
            Err(DecodeError::UnsupportedRepresentation("real"))
        ));
        assert!(Metadata::from_stored(&SqlValue::Null).unwrap().is_empty());
    }

    fn arb_json() -> impl Strategy<Value = String> {
        prop_oneof![
            any::<i64>().prop_map(|i| i.to_string()),
            "[a-zA-Z0-9 ]{0,12}".prop_map(|s| format!("\"{}\"", s)),
            Just("null".to_string()),
            Just("{\"nested\": [1, 2.50, true]}".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn prop_metadata_round_trip(m in prop::collection::btree_map("[a-z/.]{1,10}", arb_json(), 0..6)) {
            let metadata: Metadata = m.iter().map(|(k, v)| (k.clone(), raw(v))).collect();
            let back = Metadata::from_stored(&metadata.to_stored().unwrap()).unwrap();
            for (k, v) in &m {
                prop_assert_eq!(back.get(k).unwrap().as_raw(), v.as_str());
            }
            prop_assert_eq!(back, metadata);
        }

        #[test]
        fn prop_merge_right_biased(
            a in prop::collection::btree_map("[a-d]", any::<i32>(), 0..4),
            b in prop::collection::btree_map("[a-d]", any::<i32>(), 0..4),
        ) {
            let to_meta = |m: &BTreeMap<String, i32>| -> Metadata {
                m.iter().map(|(k, v)| (k.clone(), MetadataValue::from_json(v).unwrap())).collect()
            };
            let mut merged = to_meta(&a);
            merged.merge(to_meta(&b));
            for key in a.keys().chain(b.keys()) {
                let expected = b.get(key).or_else(|| a.get(key)).unwrap();
                prop_assert_eq!(merged.get(key).unwrap().decode::<i32>().unwrap(), *expected);
            }
            prop_assert_eq!(merged.len(), a.keys().chain(b.keys()).collect::<std::collections::BTreeSet<_>>().len());
        }
    }
}
