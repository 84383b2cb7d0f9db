//! Plain-text tables for the admin commands.

use prettytable::{row, Table};

use ledgerstore_core::{AggregatedBalances, Cursor, Volumes};

pub fn volumes_table(address: &str, volumes: &Volumes) -> Table {
    let mut table = Table::new();
    table.add_row(row!["Account", "Asset", "Input", "Output", "Balance"]);
    table.add_empty_row();

    for (asset, volume) in volumes.iter() {
        table.add_row(row![address, asset, volume.input, volume.output, volume.balance()]);
    }
    table
}

pub fn balances_table(page: &Cursor<AggregatedBalances>) -> Table {
    let mut table = Table::new();
    table.add_row(row!["Account", "Asset", "Balance"]);
    table.add_empty_row();

    for balances in &page.data {
        for (account, assets) in &balances.accounts {
            for (asset, balance) in assets {
                table.add_row(row![account, asset, balance]);
            }
        }
        table.add_empty_row();
        for (asset, balance) in &balances.aggregated {
            table.add_row(row!["(all)", asset, balance]);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use ledgerstore_core::Volume;

    use super::*;

    #[test]
    fn test_volumes_table() {
        let volumes: Volumes = [("USD".to_string(), Volume::new(100, 40))].into_iter().collect();
        let out = volumes_table("acc:1", &volumes).to_string();
        assert!(out.contains("acc:1"));
        assert!(out.contains("60"));
    }

    #[test]
    fn test_balances_table() {
        let mut balances = AggregatedBalances::default();
        balances.aggregated.insert("EUR".into(), -5);
        balances.accounts.entry("a".into()).or_default().insert("EUR".into(), -5);
        let page = Cursor {
            page_size: 1,
            has_more: false,
            previous: None,
            next: None,
            data: vec![balances],
        };
        let out = balances_table(&page).to_string();
        assert!(out.contains("(all)"));
        assert!(out.contains("-5"));
    }
}
