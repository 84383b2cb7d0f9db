use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    metadata::Metadata,
    volumes::{AggregatedVolumes, Balances, Volumes},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: String,
    pub destination: String,
    pub amount: i64,
    pub asset: String,
}

impl Posting {
    pub fn new(source: &str, destination: &str, amount: i64, asset: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            amount,
            asset: asset.to_string(),
        }
    }
}

/// A validated transaction as handed over by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "txid")]
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub postings: Vec<Posting>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "AggregatedVolumes::is_empty")]
    pub pre_commit_volumes: AggregatedVolumes,
    #[serde(default, skip_serializing_if = "AggregatedVolumes::is_empty")]
    pub post_commit_volumes: AggregatedVolumes,
}

impl Transaction {
    pub fn new(id: u64, timestamp: OffsetDateTime, postings: Vec<Posting>) -> Self {
        Self {
            id,
            timestamp,
            reference: None,
            postings,
            metadata: Metadata::new(),
            pre_commit_volumes: AggregatedVolumes::new(),
            post_commit_volumes: AggregatedVolumes::new(),
        }
    }

    /// Every (account, asset) pair touched by the postings, in posting order.
    pub fn touched(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = Vec::new();
        for p in &self.postings {
            for account in [p.source.as_str(), p.destination.as_str()] {
                if !out.contains(&(account, p.asset.as_str())) {
                    out.push((account, p.asset.as_str()));
                }
            }
        }
        out
    }

    /// Post-commit volumes derived from `pre` by applying every posting.
    pub fn compute_volumes(&self, pre: &AggregatedVolumes) -> AggregatedVolumes {
        let mut post = pre.clone();
        for p in &self.postings {
            post.apply_posting(&p.source, &p.destination, &p.asset, p.amount);
        }
        post
    }

    pub fn is_reverted(&self) -> bool {
        self.metadata.is_reverted()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Volumes::is_empty")]
    pub volumes: Volumes,
    #[serde(default, skip_serializing_if = "Balances::is_empty")]
    pub balances: Balances,
}

impl Account {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn with_volumes(mut self, volumes: Volumes) -> Self {
        self.balances = volumes.balances();
        self.volumes = volumes;
        self
    }
}

pub const META_TARGET_TYPE_ACCOUNT: &str = "ACCOUNT";
pub const META_TARGET_TYPE_TRANSACTION: &str = "TRANSACTION";

/// The entity a metadata write is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaTarget {
    Account(String),
    Transaction(u64),
}

impl MetaTarget {
    pub fn target_type(&self) -> &'static str {
        match self {
            MetaTarget::Account(_) => META_TARGET_TYPE_ACCOUNT,
            MetaTarget::Transaction(_) => META_TARGET_TYPE_TRANSACTION,
        }
    }

    pub fn target_id(&self) -> String {
        match self {
            MetaTarget::Account(address) => address.clone(),
            MetaTarget::Transaction(id) => id.to_string(),
        }
    }
}

impl Display for MetaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_type(), self.target_id())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::volumes::Volume;

    #[test]
    fn test_compute_volumes() {
        let tx = Transaction::new(
            0,
            datetime!(2022-01-01 0:00 UTC),
            vec![Posting::new("world", "bank", 100, "USD"), Posting::new("bank", "alice", 10, "USD")],
        );
        let mut pre = AggregatedVolumes::new();
        pre.set_volume("bank", "USD", Volume::new(5, 0));

        let post = tx.compute_volumes(&pre);
        assert_eq!(post.volume("bank", "USD"), Volume::new(105, 10));
        assert_eq!(post.volume("alice", "USD"), Volume::new(10, 0));
        assert_eq!(post.volume("world", "USD"), Volume::new(0, 100));
        assert_eq!(pre.volume("bank", "USD"), Volume::new(5, 0));
    }

    #[test]
    fn test_touched_is_deduplicated() {
        let tx = Transaction::new(
            1,
            datetime!(2022-01-01 0:00 UTC),
            vec![Posting::new("a", "b", 1, "USD"), Posting::new("b", "a", 1, "USD")],
        );
        assert_eq!(tx.touched(), vec![("a", "USD"), ("b", "USD")]);
    }

    #[test]
    fn test_meta_target() {
        assert_eq!(MetaTarget::Transaction(3).target_type(), "TRANSACTION");
        assert_eq!(MetaTarget::Account("users:1".into()).to_string(), "ACCOUNT:users:1");
    }

    #[test]
    fn test_transaction_json_shape() {
        let tx = Transaction::new(7, datetime!(2022-01-01 0:00 UTC), vec![Posting::new("world", "bank", 1, "USD")]);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["txid"], 7);
        assert_eq!(json["timestamp"], "2022-01-01T00:00:00Z");
        assert!(json.get("preCommitVolumes").is_none());
    }
}
