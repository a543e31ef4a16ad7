//! Settlement document parsing.
//!
//! The provider's report has no fixed layout: a preamble of arbitrary length
//! may precede the header, and column names vary between exports. Columns are
//! found by case-insensitive substring match in the first rows. Everything in
//! this module is pure; database lookups live in the reconciliation service.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;

use crate::models::{Payment, PaymentStatus};

/// Rows scanned for a header before giving up.
pub const HEADER_SCAN_ROWS: usize = 20;

/// Amount difference tolerated between a settlement row and its payment.
pub const AMOUNT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

const SUCCESS_STATUSES: [&str; 4] = ["completed", "success", "successful", "paid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementColumns {
    pub header_row: usize,
    pub status: usize,
    pub amount: usize,
    pub remark: usize,
    pub transaction_type: Option<usize>,
    pub receipt: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Status,
    Amount,
    Remark,
    TransactionType,
    Receipt,
}

fn normalize_cell(cell: &str) -> String {
    cell.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}')
        .to_lowercase()
}

fn role_of(header: &str) -> Option<Role> {
    let h = normalize_cell(header);
    if h.is_empty() {
        None
    } else if h.contains("status") {
        Some(Role::Status)
    } else if h.contains("remark") || h.contains("comment") {
        Some(Role::Remark)
    } else if h.contains("receipt") || h.contains("transaction no") || h.contains("transaction id") {
        Some(Role::Receipt)
    } else if h.contains("type") {
        Some(Role::TransactionType)
    } else if h.contains("amount") {
        Some(Role::Amount)
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct HeaderMatch {
    status: Option<usize>,
    amount: Option<usize>,
    remark: Option<usize>,
    transaction_type: Option<usize>,
    receipt: Option<usize>,
}

impl HeaderMatch {
    fn from_row(row: &[String]) -> Self {
        let mut found = HeaderMatch::default();
        for (index, cell) in row.iter().enumerate() {
            let slot = match role_of(cell) {
                Some(Role::Status) => &mut found.status,
                Some(Role::Amount) => &mut found.amount,
                Some(Role::Remark) => &mut found.remark,
                Some(Role::TransactionType) => &mut found.transaction_type,
                Some(Role::Receipt) => &mut found.receipt,
                None => continue,
            };
            slot.get_or_insert(index);
        }
        found
    }

    fn required_found(&self) -> usize {
        [self.status, self.amount, self.remark]
            .iter()
            .filter(|c| c.is_some())
            .count()
    }
}

/// Locate the header row and its columns.
///
/// Picks the first scanned row that names all three required columns. A title
/// line mentioning "status" does not end the scan. When no row qualifies, the
/// best partial match is only used to report what is missing.
pub fn discover_columns(rows: &[Vec<String>]) -> Result<SettlementColumns, Vec<String>> {
    let mut best: Option<(usize, HeaderMatch)> = None;

    for (index, row) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
        let found = HeaderMatch::from_row(row);
        if found.required_found() == 3 {
            best = Some((index, found));
            break;
        }
        let better = best
            .as_ref()
            .is_none_or(|(_, b)| found.required_found() > b.required_found());
        if better {
            best = Some((index, found));
        }
    }

    let Some((header_row, found)) = best else {
        return Err(vec![
            "status column not found".to_string(),
            "amount column not found".to_string(),
            "remark column not found".to_string(),
        ]);
    };

    match (found.status, found.amount, found.remark) {
        (Some(status), Some(amount), Some(remark)) => Ok(SettlementColumns {
            header_row,
            status,
            amount,
            remark,
            transaction_type: found.transaction_type,
            receipt: found.receipt,
        }),
        (status, amount, remark) => {
            let mut missing = Vec::new();
            if status.is_none() {
                missing.push("status column not found".to_string());
            }
            if amount.is_none() {
                missing.push("amount column not found".to_string());
            }
            if remark.is_none() {
                missing.push("remark column not found".to_string());
            }
            Err(missing)
        }
    }
}

/// Read a CSV settlement document into raw rows.
pub fn read_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

pub fn is_success_status(status: &str) -> bool {
    let status = normalize_cell(status);
    SUCCESS_STATUSES.contains(&status.as_str())
}

/// Parse a provider amount such as `"1,500.00"` or `"ETB 1500"`.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// The four fields exported into each instruction's remark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceToken {
    pub driver_id: String,
    pub bonus_id: i64,
    pub week_date: NaiveDate,
    pub batch_id: String,
}

/// Strict token parse: exactly four parts split on `,`, or failing that on
/// `.`. Anything else is no token at all.
pub fn parse_token(remark: &str) -> Option<TraceToken> {
    let remark = remark.trim();
    let parts: Vec<&str> = {
        let by_comma: Vec<&str> = remark.split(',').collect();
        if by_comma.len() == 4 {
            by_comma
        } else {
            remark.split('.').collect()
        }
    };
    if parts.len() != 4 {
        return None;
    }

    let parts: Vec<&str> = parts.into_iter().map(str::trim).collect();
    if parts[0].is_empty() || parts[3].is_empty() {
        return None;
    }

    Some(TraceToken {
        driver_id: parts[0].to_string(),
        bonus_id: parts[1].parse().ok()?,
        week_date: NaiveDate::parse_from_str(parts[2], "%Y-%m-%d").ok()?,
        batch_id: parts[3].to_string(),
    })
}

/// One data row below the header.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRow {
    /// 1-based line in the document.
    pub line: usize,
    pub status: String,
    pub amount: Option<Decimal>,
    pub remark: String,
    pub transaction_type: Option<String>,
    pub receipt: Option<String>,
}

impl SettlementRow {
    /// Whether the row should be matched at all: the right transaction type
    /// (when the document has that column) and a success status.
    pub fn is_candidate(&self, expected_type: &str) -> bool {
        let type_ok = match &self.transaction_type {
            Some(t) => normalize_cell(t) == normalize_cell(expected_type),
            None => true,
        };
        type_ok && is_success_status(&self.status)
    }
}

/// A structurally valid settlement document.
#[derive(Debug, Clone)]
pub struct ParsedSettlement {
    pub columns: SettlementColumns,
    pub rows: Vec<SettlementRow>,
}

impl ParsedSettlement {
    pub fn from_rows(raw: &[Vec<String>]) -> Result<Self, Vec<String>> {
        let columns = discover_columns(raw)?;
        let cell = |row: &Vec<String>, index: usize| row.get(index).cloned().unwrap_or_default();
        let optional = |row: &Vec<String>, index: Option<usize>| {
            index
                .and_then(|i| row.get(i))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let rows = raw
            .iter()
            .enumerate()
            .skip(columns.header_row + 1)
            .filter(|(_, row)| row.iter().any(|c| !c.is_empty()))
            .map(|(index, row)| SettlementRow {
                line: index + 1,
                status: cell(row, columns.status),
                amount: parse_amount(&cell(row, columns.amount)),
                remark: cell(row, columns.remark),
                transaction_type: columns.transaction_type.map(|i| cell(row, i)),
                receipt: optional(row, columns.receipt),
            })
            .collect();

        Ok(Self { columns, rows })
    }
}

/// How a settlement row relates to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    /// Matches a processing payment; process would mark it paid.
    Candidate,
    AlreadyPaid,
    Unmatched { reason: String },
    AmountMismatch { expected: Decimal, actual: Option<Decimal> },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::AlreadyPaid => "already_paid",
            Self::Unmatched { .. } => "unmatched",
            Self::AmountMismatch { .. } => "amount_mismatch",
        }
    }

    fn unmatched(reason: impl Into<String>) -> Self {
        Self::Unmatched {
            reason: reason.into(),
        }
    }
}

/// Classify a row given its parsed token and the payment it resolved to.
pub fn classify(
    token: Option<&TraceToken>,
    amount: Option<Decimal>,
    payment: Option<&Payment>,
) -> Classification {
    let Some(token) = token else {
        return Classification::unmatched("remark is not a four-part trace token");
    };
    let Some(payment) = payment else {
        return Classification::unmatched(format!(
            "no payment for bonus {} and driver {}",
            token.bonus_id, token.driver_id
        ));
    };
    if payment.batch_id != token.batch_id {
        return Classification::unmatched(format!(
            "payment belongs to batch {}, row names {}",
            payment.batch_id, token.batch_id
        ));
    }
    if payment.parsed_status() != PaymentStatus::Processing {
        return Classification::AlreadyPaid;
    }
    match amount {
        Some(actual) if (actual - payment.total_amount).abs() <= AMOUNT_TOLERANCE => {
            Classification::Candidate
        }
        actual => Classification::AmountMismatch {
            expected: payment.total_amount,
            actual,
        },
    }
}

/// Notes after a settlement, with the provider's receipt appended.
pub fn append_receipt(notes: Option<&str>, receipt: Option<&str>) -> Option<String> {
    match (notes.filter(|n| !n.is_empty()), receipt.filter(|r| !r.is_empty())) {
        (Some(notes), Some(receipt)) => Some(format!("{} | receipt {}", notes, receipt)),
        (None, Some(receipt)) => Some(format!("receipt {}", receipt)),
        (notes, None) => notes.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn rows(text: &str) -> Vec<Vec<String>> {
        read_rows(text.as_bytes()).unwrap()
    }

    fn payment(status: &str) -> Payment {
        Payment {
            payment_id: 5,
            driver_id: "D-7".to_string(),
            bonus_id: 42,
            total_amount: dec!(1500.00),
            status: status.to_string(),
            batch_id: "BATCH-20240309-0705-00003".to_string(),
            batch_internal_id: 1,
            notes: None,
            payment_date: None,
            created_utc: Utc::now(),
        }
    }

    fn token() -> TraceToken {
        parse_token("D-7,42,2024-03-04,BATCH-20240309-0705-00003").unwrap()
    }

    #[test]
    fn header_is_found_below_a_preamble() {
        let doc = "\
Telebirr Bulk Payment Report,,,,
Generated,2024-03-10,,,
,,,,
Receipt No.,Transaction Type,Transaction Status,Amount (ETB),Remark
RX1,Bulk Payment,Completed,\"1,500.00\",\"D-7,42,2024-03-04,BATCH-20240309-0705-00003\"
";
        let parsed = ParsedSettlement::from_rows(&rows(doc)).unwrap();
        assert_eq!(
            parsed.columns,
            SettlementColumns {
                header_row: 3,
                status: 2,
                amount: 3,
                remark: 4,
                transaction_type: Some(1),
                receipt: Some(0),
            }
        );
        assert_eq!(parsed.rows.len(), 1);
        let row = &parsed.rows[0];
        assert_eq!(row.line, 5);
        assert_eq!(row.amount, Some(dec!(1500.00)));
        assert_eq!(row.receipt.as_deref(), Some("RX1"));
        assert!(row.is_candidate("Bulk Payment"));
        assert_eq!(parse_token(&row.remark), Some(token()));
    }

    #[test]
    fn title_line_naming_status_does_not_hide_the_header() {
        let doc = "\
Bulk Payment Status Report,,,
,,,
Transaction Status,Amount,Remark,Receipt No
Completed,100.00,\"D-1,1,2024-03-04,B\",R1
";
        let columns = discover_columns(&rows(doc)).unwrap();
        assert_eq!(columns.header_row, 2);
        assert_eq!((columns.status, columns.amount, columns.remark), (0, 1, 2));
        assert_eq!(columns.receipt, Some(3));

        let parsed = ParsedSettlement::from_rows(&rows(doc)).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].amount, Some(dec!(100.00)));
    }

    #[test]
    fn missing_status_column_fails_closed() {
        let doc = "Amount,Comment\n100,x\n";
        let missing = ParsedSettlement::from_rows(&rows(doc)).unwrap_err();
        assert_eq!(missing, vec!["status column not found".to_string()]);
    }

    #[test]
    fn missing_remark_is_reported_with_status_present() {
        let doc = "Status,Amount\nCompleted,100\n";
        let missing = discover_columns(&rows(doc)).unwrap_err();
        assert_eq!(missing, vec!["remark column not found".to_string()]);
    }

    #[test]
    fn header_beyond_scan_window_is_not_found() {
        let mut doc = String::new();
        for i in 0..HEADER_SCAN_ROWS {
            doc.push_str(&format!("preamble {}\n", i));
        }
        doc.push_str("Status,Amount,Remark\n");
        assert!(discover_columns(&rows(&doc)).is_err());
    }

    #[test]
    fn rows_of_other_types_or_statuses_are_not_candidates() {
        let doc = "\
Transaction Type,Status,Amount,Remark
Bulk Payment,Completed,10,a
Bulk Payment,Failed,10,b
Refund,Completed,10,c
bulk payment, SUCCESSFUL ,10,d
";
        let parsed = ParsedSettlement::from_rows(&rows(doc)).unwrap();
        let candidates: Vec<&str> = parsed
            .rows
            .iter()
            .filter(|r| r.is_candidate("Bulk Payment"))
            .map(|r| r.remark.as_str())
            .collect();
        assert_eq!(candidates, vec!["a", "d"]);
    }

    #[test]
    fn without_type_column_only_status_filters() {
        let doc = "Status,Amount,Remark\nPaid,10,a\nPending,10,b\n";
        let parsed = ParsedSettlement::from_rows(&rows(doc)).unwrap();
        assert!(parsed.rows[0].is_candidate("Bulk Payment"));
        assert!(!parsed.rows[1].is_candidate("Bulk Payment"));
    }

    #[test]
    fn amounts_strip_grouping_and_currency() {
        assert_eq!(parse_amount("1,500.00"), Some(dec!(1500.00)));
        assert_eq!(parse_amount("ETB 19,400.5"), Some(dec!(19400.5)));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn token_accepts_period_separator() {
        let t = parse_token("D-7.42.2024-03-04.BATCH-20240309-0705-00003").unwrap();
        assert_eq!(t, token());
    }

    #[test]
    fn two_part_remark_is_not_a_token() {
        assert_eq!(parse_token("D-7,42"), None);
        assert_eq!(classify(None, Some(dec!(1500)), None).label(), "unmatched");
    }

    #[test]
    fn malformed_token_parts_are_rejected() {
        assert_eq!(parse_token("D-7,abc,2024-03-04,B"), None);
        assert_eq!(parse_token("D-7,42,04/03/2024,B"), None);
        assert_eq!(parse_token(",42,2024-03-04,B"), None);
        assert_eq!(parse_token("D-7,42,2024-03-04,B,extra"), None);
    }

    #[test]
    fn processing_payment_with_matching_amount_is_candidate() {
        let p = payment("processing");
        assert_eq!(classify(Some(&token()), Some(dec!(1500.01)), Some(&p)), Classification::Candidate);
    }

    #[test]
    fn amount_outside_tolerance_is_mismatch() {
        let p = payment("processing");
        assert_eq!(
            classify(Some(&token()), Some(dec!(1500.02)), Some(&p)),
            Classification::AmountMismatch {
                expected: dec!(1500.00),
                actual: Some(dec!(1500.02)),
            }
        );
    }

    #[test]
    fn paid_payment_is_already_paid() {
        let p = payment("paid");
        assert_eq!(classify(Some(&token()), Some(dec!(1500)), Some(&p)), Classification::AlreadyPaid);
    }

    #[test]
    fn batch_mismatch_and_unknown_payment_are_unmatched() {
        let mut p = payment("processing");
        p.batch_id = "BATCH-20240309-0705-00004".to_string();
        assert_eq!(classify(Some(&token()), Some(dec!(1500)), Some(&p)).label(), "unmatched");
        assert_eq!(classify(Some(&token()), Some(dec!(1500)), None).label(), "unmatched");
    }

    #[test]
    fn receipt_is_appended_to_notes() {
        assert_eq!(
            append_receipt(Some("D-7,42,2024-03-04,B"), Some("RX1")).as_deref(),
            Some("D-7,42,2024-03-04,B | receipt RX1")
        );
        assert_eq!(append_receipt(None, Some("RX1")).as_deref(), Some("receipt RX1"));
        assert_eq!(append_receipt(Some("n"), None).as_deref(), Some("n"));
        assert_eq!(append_receipt(None, None), None);
    }
}
