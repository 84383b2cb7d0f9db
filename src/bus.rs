//! Notification events built from store data.
//!
//! On the wire an event is `{date, type, payload, ledger}` where `type`
//! names the payload shape. In memory the payload is a [`Payload`] variant,
//! so the discriminator can not disagree with the payload it describes.

use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use ledgerstore_core::{AggregatedVolumes, MetaTarget, Metadata, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "COMMITTED_TRANSACTIONS")]
    CommittedTransactions,
    #[serde(rename = "SAVED_METADATA")]
    SavedMetadata,
    #[serde(rename = "REVERTED_TRANSACTION")]
    RevertedTransaction,
    #[serde(rename = "UPDATED_MAPPING")]
    UpdatedMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTransactions {
    pub transactions: Vec<Transaction>,
    /// Deprecated, same content as `post_commit_volumes`.
    pub volumes: AggregatedVolumes,
    pub post_commit_volumes: AggregatedVolumes,
    pub pre_commit_volumes: AggregatedVolumes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMetadata {
    pub target_type: String,
    pub target_id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertedTransaction {
    pub reverted_transaction: Transaction,
    pub revert_transaction: Transaction,
}

/// Script mapping of a ledger. Its content is owned by the caller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedMapping {
    pub mapping: Mapping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    CommittedTransactions(CommittedTransactions),
    SavedMetadata(SavedMetadata),
    RevertedTransaction(RevertedTransaction),
    UpdatedMapping(UpdatedMapping),
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::CommittedTransactions(_) => EventType::CommittedTransactions,
            Payload::SavedMetadata(_) => EventType::SavedMetadata,
            Payload::RevertedTransaction(_) => EventType::RevertedTransaction,
            Payload::UpdatedMapping(_) => EventType::UpdatedMapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub struct Event {
    pub date: OffsetDateTime,
    pub ledger: String,
    pub payload: Payload,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(with = "time::serde::rfc3339")]
    date: OffsetDateTime,
    #[serde(rename = "type")]
    kind: EventType,
    payload: serde_json::Value,
    ledger: String,
}

impl TryFrom<Envelope> for Event {
    type Error = serde_json::Error;

    fn try_from(e: Envelope) -> Result<Self, Self::Error> {
        let payload = match e.kind {
            EventType::CommittedTransactions => Payload::CommittedTransactions(serde_json::from_value(e.payload)?),
            EventType::SavedMetadata => Payload::SavedMetadata(serde_json::from_value(e.payload)?),
            EventType::RevertedTransaction => Payload::RevertedTransaction(serde_json::from_value(e.payload)?),
            EventType::UpdatedMapping => Payload::UpdatedMapping(serde_json::from_value(e.payload)?),
        };
        Ok(Event {
            date: e.date,
            ledger: e.ledger,
            payload,
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let date = self
            .date
            .format(&Rfc3339)
            .map_err(<S::Error as serde::ser::Error>::custom)?;
        let mut s = serializer.serialize_struct("Event", 4)?;
        s.serialize_field("date", &date)?;
        s.serialize_field("type", &self.payload.event_type())?;
        match &self.payload {
            Payload::CommittedTransactions(p) => s.serialize_field("payload", p)?,
            Payload::SavedMetadata(p) => s.serialize_field("payload", p)?,
            Payload::RevertedTransaction(p) => s.serialize_field("payload", p)?,
            Payload::UpdatedMapping(p) => s.serialize_field("payload", p)?,
        }
        s.serialize_field("ledger", &self.ledger)?;
        s.end()
    }
}

impl Event {
    pub fn new(ledger: &str, payload: Payload) -> Self {
        Self {
            date: OffsetDateTime::now_utc(),
            ledger: ledger.to_string(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Volumes before the batch are taken from the first transaction touching
    /// each pair, volumes after it from the last one.
    pub fn committed_transactions(ledger: &str, transactions: Vec<Transaction>) -> Self {
        let mut pre = AggregatedVolumes::new();
        let mut post = AggregatedVolumes::new();
        for tx in &transactions {
            for (account, asset) in tx.touched() {
                if pre.get(account).map_or(true, |v| !v.0.contains_key(asset)) {
                    pre.set_volume(account, asset, tx.pre_commit_volumes.volume(account, asset));
                }
                post.set_volume(account, asset, tx.post_commit_volumes.volume(account, asset));
            }
        }
        Self::new(
            ledger,
            Payload::CommittedTransactions(CommittedTransactions {
                transactions,
                volumes: post.clone(),
                post_commit_volumes: post,
                pre_commit_volumes: pre,
            }),
        )
    }

    pub fn saved_metadata(ledger: &str, target: &MetaTarget, metadata: Metadata) -> Self {
        Self::new(
            ledger,
            Payload::SavedMetadata(SavedMetadata {
                target_type: target.target_type().to_string(),
                target_id: target.target_id(),
                metadata,
            }),
        )
    }

    pub fn reverted_transaction(ledger: &str, reverted: Transaction, revert: Transaction) -> Self {
        Self::new(
            ledger,
            Payload::RevertedTransaction(RevertedTransaction {
                reverted_transaction: reverted,
                revert_transaction: revert,
            }),
        )
    }

    pub fn updated_mapping(ledger: &str, mapping: Mapping) -> Self {
        Self::new(ledger, Payload::UpdatedMapping(UpdatedMapping { mapping }))
    }
}

#[cfg(test)]
mod tests {
    use ledgerstore_core::{metadata::compute_metadata, Posting, Volume};
    use time::macros::datetime;

    use super::*;

    fn tx(id: u64, amount: i64, pre_world: i64) -> Transaction {
        let mut tx = Transaction::new(id, datetime!(2022-01-01 00:00 UTC), vec![Posting::new("world", "bank", amount, "USD")]);
        tx.pre_commit_volumes.set_volume("world", "USD", Volume::new(0, pre_world));
        tx.pre_commit_volumes.set_volume("bank", "USD", Volume::new(pre_world, 0));
        tx.post_commit_volumes = tx.compute_volumes(&tx.pre_commit_volumes);
        tx
    }

    #[test]
    fn test_envelope_shape() {
        let event = Event::saved_metadata("quickstart", &MetaTarget::Account("bank".into()), compute_metadata("a", "b"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SAVED_METADATA");
        assert_eq!(json["ledger"], "quickstart");
        assert_eq!(json["payload"]["targetType"], "ACCOUNT");
        assert_eq!(json["payload"]["targetId"], "bank");
        assert_eq!(json["payload"]["metadata"]["a"], "b");
        assert!(json["date"].is_string());
    }

    #[test]
    fn test_round_trip_keeps_variant() {
        let event = Event::reverted_transaction("l", tx(0, 10, 0), tx(1, 10, 10));
        let back: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back.event_type(), EventType::RevertedTransaction);
        assert_eq!(back.payload, event.payload);
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let raw = r#"{"date":"2022-01-01T00:00:00Z","type":"REVERTED_TRANSACTION","payload":{"mapping":null},"ledger":"l"}"#;
        assert!(serde_json::from_str::<Event>(raw).is_err());
    }

    #[test]
    fn test_committed_batch_volumes() {
        let event = Event::committed_transactions("l", vec![tx(0, 10, 0), tx(1, 5, 10)]);
        let Payload::CommittedTransactions(p) = event.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(p.pre_commit_volumes.volume("bank", "USD"), Volume::new(0, 0));
        assert_eq!(p.post_commit_volumes.volume("bank", "USD"), Volume::new(15, 0));
        assert_eq!(p.post_commit_volumes.volume("world", "USD"), Volume::new(0, 15));
        assert_eq!(p.volumes, p.post_commit_volumes);
    }
}
