//! Offline-conversion CSV payloads.
//!
//! The provider is strict: comma separator, LF line endings, the exact
//! `ClientId,Target,DateTime` header for bulk uploads, Unix seconds in the
//! `DateTime` column.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ScoreError};
use crate::pipeline::VisitResult;

pub const BULK_HEADER: [&str; 3] = ["ClientId", "Target", "DateTime"];

/// A formatted upload body and how many rows it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvPayload {
    pub body: String,
    pub rows: usize,
    pub skipped: usize,
}

/// One manually supplied conversion event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Click id.
    #[serde(default)]
    pub yclid: Option<String>,
    #[serde(default)]
    pub purchase_id: Option<String>,
    pub target: String,
    /// ISO-8601 or `YYYY-MM-DD HH:MM:SS`; values without an offset are UTC.
    pub date_time: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl Conversion {
    fn identifiers(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("ClientId", non_empty(&self.client_id)),
            ("UserId", non_empty(&self.user_id)),
            ("Yclid", non_empty(&self.yclid)),
            ("PurchaseId", non_empty(&self.purchase_id)),
        ]
    }

    /// Exactly one identifier, a target and a parseable timestamp.
    pub fn validate(&self) -> Result<()> {
        let supplied = self.identifiers().iter().filter(|(_, v)| v.is_some()).count();
        if supplied != 1 {
            return Err(ScoreError::Validation(format!(
                "exactly one of client_id, user_id, yclid, purchase_id is required, got {supplied}"
            )));
        }
        if self.target.trim().is_empty() {
            return Err(ScoreError::Validation("target must not be empty".into()));
        }
        if parse_timestamp(&self.date_time).is_none() {
            return Err(ScoreError::Validation(format!(
                "invalid date_time '{}'",
                self.date_time
            )));
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Unix seconds of an ISO-8601 timestamp. Naive timestamps are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
}

fn writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| ScoreError::Storage(format!("csv buffer: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ScoreError::DataIntegrity(e.to_string()))
}

fn csv_error(e: csv::Error) -> ScoreError {
    ScoreError::DataIntegrity(format!("csv write failed: {e}"))
}

/// One `ClientId,Target,DateTime` row per tier-4+ visit.
///
/// Visits without a client id or with an unparseable timestamp are skipped
/// with a warning.
pub fn format_bulk(visits: &[VisitResult], target: &str) -> Result<CsvPayload> {
    let mut w = writer();
    w.write_record(BULK_HEADER).map_err(csv_error)?;

    let mut rows = 0;
    let mut skipped = 0;
    for visit in visits {
        if visit.client_id.trim().is_empty() {
            warn!(visit_id = %visit.visit_id, "skipping visit without client id");
            skipped += 1;
            continue;
        }
        let Some(unix) = parse_timestamp(&visit.date_time) else {
            warn!(visit_id = %visit.visit_id, date_time = %visit.date_time, "skipping visit with unparseable timestamp");
            skipped += 1;
            continue;
        };
        w.write_record([visit.client_id.as_str(), target, unix.to_string().as_str()])
            .map_err(csv_error)?;
        rows += 1;
    }

    Ok(CsvPayload {
        body: finish(w)?,
        rows,
        skipped,
    })
}

/// Header and row for one conversion: `Target,DateTime`, the identifier,
/// then `Price` and `Currency` when given. No trailing newline.
pub fn format_single(conversion: &Conversion) -> Result<String> {
    conversion.validate()?;
    let unix = parse_timestamp(&conversion.date_time).unwrap_or_default();

    let mut header = vec!["Target", "DateTime"];
    let mut row = vec![conversion.target.clone(), unix.to_string()];
    for (column, value) in conversion.identifiers() {
        if let Some(value) = value {
            header.push(column);
            row.push(value.to_string());
        }
    }
    if let Some(price) = conversion.price {
        header.push("Price");
        row.push(price.to_string());
    }
    if let Some(currency) = non_empty(&conversion.currency) {
        header.push("Currency");
        row.push(currency.to_string());
    }

    let mut w = writer();
    w.write_record(&header).map_err(csv_error)?;
    w.write_record(&row).map_err(csv_error)?;
    let mut body = finish(w)?;
    if body.ends_with('\n') {
        body.pop();
    }
    Ok(body)
}

/// Bulk-format webhook conversions. Only client-id conversions can be sent
/// this way; the rest are skipped with a warning.
pub fn format_webhook(conversions: &[Conversion]) -> Result<CsvPayload> {
    let mut w = writer();
    w.write_record(BULK_HEADER).map_err(csv_error)?;

    let mut rows = 0;
    let mut skipped = 0;
    for (idx, conversion) in conversions.iter().enumerate() {
        let Some(client_id) = non_empty(&conversion.client_id) else {
            warn!(index = idx, "skipping webhook conversion without client_id");
            skipped += 1;
            continue;
        };
        let target = conversion.target.trim();
        if target.is_empty() {
            warn!(index = idx, "skipping webhook conversion without target");
            skipped += 1;
            continue;
        }
        let Some(unix) = parse_timestamp(&conversion.date_time) else {
            warn!(index = idx, date_time = %conversion.date_time, "skipping webhook conversion with unparseable date_time");
            skipped += 1;
            continue;
        };
        w.write_record([client_id, target, unix.to_string().as_str()])
            .map_err(csv_error)?;
        rows += 1;
    }

    Ok(CsvPayload {
        body: finish(w)?,
        rows,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(client_id: &str, date_time: &str) -> VisitResult {
        VisitResult {
            visit_id: format!("v-{client_id}"),
            client_id: client_id.into(),
            date_time: date_time.into(),
            visit_duration: 200,
        }
    }

    #[test]
    fn bulk_row_uses_utc_epoch_seconds() {
        let payload = format_bulk(&[visit("abc", "2025-07-01 12:00:00")], "4plus").unwrap();
        assert_eq!(payload.body, "ClientId,Target,DateTime\nabc,4plus,1751371200\n");
        assert_eq!(payload.rows, 1);
        assert_eq!(payload.skipped, 0);
    }

    #[test]
    fn bulk_header_is_exact_even_when_empty() {
        let payload = format_bulk(&[], "4plus").unwrap();
        assert_eq!(payload.body, "ClientId,Target,DateTime\n");
        assert_eq!(payload.rows, 0);
    }

    #[test]
    fn bulk_skips_bad_rows() {
        let payload = format_bulk(
            &[
                visit("a", "2025-07-01 12:00:00"),
                visit("b", "yesterday"),
                visit("", "2025-07-01 12:00:00"),
                visit("c", "2025-07-01T12:00:01Z"),
            ],
            "goal",
        )
        .unwrap();
        assert_eq!(
            payload.body,
            "ClientId,Target,DateTime\na,goal,1751371200\nc,goal,1751371201\n"
        );
        assert_eq!((payload.rows, payload.skipped), (2, 2));
    }

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("2025-07-01 12:00:00"), Some(1_751_371_200));
        assert_eq!(parse_timestamp("2025-07-01T12:00:00"), Some(1_751_371_200));
        assert_eq!(parse_timestamp("2025-07-01T15:00:00+03:00"), Some(1_751_371_200));
        assert_eq!(parse_timestamp("2025-07-01T12:00:00.750Z"), Some(1_751_371_200));
        assert_eq!(parse_timestamp("2025-07-01"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    fn single() -> Conversion {
        Conversion {
            target: "purchase".into(),
            date_time: "2025-07-01 12:00:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn single_with_optional_fields() {
        let c = Conversion {
            user_id: Some("u1".into()),
            price: Some(99.5),
            currency: Some("RUB".into()),
            ..single()
        };
        assert_eq!(
            format_single(&c).unwrap(),
            "Target,DateTime,UserId,Price,Currency\npurchase,1751371200,u1,99.5,RUB"
        );
    }

    #[test]
    fn single_minimal() {
        let c = Conversion {
            yclid: Some("123".into()),
            ..single()
        };
        assert_eq!(
            format_single(&c).unwrap(),
            "Target,DateTime,Yclid\npurchase,1751371200,123"
        );
    }

    #[test]
    fn single_requires_exactly_one_identifier() {
        assert!(matches!(single().validate(), Err(ScoreError::Validation(_))));

        let two = Conversion {
            client_id: Some("c".into()),
            purchase_id: Some("p".into()),
            ..single()
        };
        assert!(matches!(format_single(&two), Err(ScoreError::Validation(_))));

        let blank = Conversion {
            client_id: Some("   ".into()),
            ..single()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn single_rejects_bad_date() {
        let c = Conversion {
            client_id: Some("c".into()),
            date_time: "01/07/2025".into(),
            ..single()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn webhook_keeps_only_client_id_rows() {
        let conversions = vec![
            Conversion {
                client_id: Some("c1".into()),
                ..single()
            },
            Conversion {
                user_id: Some("u1".into()),
                ..single()
            },
        ];
        let payload = format_webhook(&conversions).unwrap();
        assert_eq!(payload.body, "ClientId,Target,DateTime\nc1,purchase,1751371200\n");
        assert_eq!((payload.rows, payload.skipped), (1, 1));
    }
}
