use std::{collections::BTreeMap, fmt::Display};

use prettytable::{Cell, Row, Table};
use serde::Serialize;

use super::{Account, GlobalSummary};

/// Square matrix of net debts. `debts[a][b]` is what the account labelled `a`
/// owes the account labelled `b`; the matrix is anti-symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebtTable {
    #[serde(rename = "Labels")]
    pub labels: BTreeMap<String, usize>,
    #[serde(rename = "Debts")]
    pub debts: Vec<Vec<i64>>,
}

impl DebtTable {
    /// Builds the table from a global summary. `users` fixes the row order.
    pub fn from_summary(users: &[Account], summary: &GlobalSummary) -> Self {
        let labels: BTreeMap<String, usize> = users
            .iter()
            .enumerate()
            .map(|(i, u)| (u.username.clone(), i))
            .collect();

        let mut debts = vec![vec![0i64; users.len()]; users.len()];
        for (row, user) in users.iter().enumerate() {
            let Some(per_user) = summary.get(&user.username) else {
                continue;
            };
            for (other, record) in per_user {
                if let Some(&col) = labels.get(other) {
                    debts[row][col] = record.net();
                }
            }
        }

        Self { labels, debts }
    }

    /// Net amount `from` owes `to`, if both are known.
    pub fn net(&self, from: &str, to: &str) -> Option<i64> {
        let row = *self.labels.get(from)?;
        let col = *self.labels.get(to)?;
        Some(self.debts[row][col])
    }

    fn ordered_labels(&self) -> Vec<&str> {
        let mut names = vec![""; self.labels.len()];
        for (name, &i) in &self.labels {
            names[i] = name.as_str();
        }
        names
    }
}

impl Display for DebtTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.ordered_labels();

        let mut table = Table::new();
        let mut header = vec![Cell::new("owes →")];
        header.extend(names.iter().map(|n| Cell::new(n)));
        table.add_row(Row::new(header));

        for (row, name) in names.iter().enumerate() {
            let mut cells = vec![Cell::new(name)];
            cells.extend(self.debts[row].iter().map(|d| Cell::new(&d.to_string())));
            table.add_row(Row::new(cells));
        }

        write!(f, "\n{}\n", table)
    }
}
