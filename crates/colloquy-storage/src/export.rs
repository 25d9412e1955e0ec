//! History export to CSV or JSON.

use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use colloquy_core::error::ColloquyError;
use colloquy_core::types::ConversationRecord;

use crate::store::ConversationStore;

/// Output format for [`ConversationStore::export`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ColloquyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ColloquyError::Serialization(format!(
                "Unsupported export format: {}",
                other
            ))),
        }
    }
}

impl ConversationStore {
    /// Write the whole history, newest first, to `out`. Returns the number
    /// of records written.
    pub fn export<W: Write>(&self, format: ExportFormat, out: &mut W) -> Result<usize, ColloquyError> {
        let records = self.list_recent(None)?;
        match format {
            ExportFormat::Json => serde_json::to_writer_pretty(&mut *out, &records)?,
            ExportFormat::Csv => write_csv(&records, out)?,
        }
        Ok(records.len())
    }
}

const CSV_HEADER: [&str; 6] = [
    "id",
    "timestamp",
    "query_type",
    "user_query",
    "ai_response",
    "image_path",
];

fn write_csv<W: Write>(records: &[ConversationRecord], out: &mut W) -> Result<(), ColloquyError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADER).map_err(csv_error)?;
    for record in records {
        writer
            .write_record([
                record.id.to_string().as_str(),
                record.created_at.to_rfc3339().as_str(),
                record.kind.to_string().as_str(),
                record.user_query.as_str(),
                record.ai_response.as_str(),
                record.image_ref.as_deref().unwrap_or(""),
            ])
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> ColloquyError {
    ColloquyError::Serialization(format!("CSV export failed: {}", e))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::Database;
    use colloquy_core::types::NewConversation;

    fn make_store() -> ConversationStore {
        ConversationStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_csv_export_quotes_fields() {
        let store = make_store();
        store
            .append(&NewConversation::text("hello, \"world\"", "line one\nline two"))
            .unwrap();

        let mut buf = Vec::new();
        let written = store.export(ExportFormat::Csv, &mut buf).unwrap();
        assert_eq!(written, 1);

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("id,timestamp,query_type,user_query,ai_response,image_path\n"));
        assert!(text.contains("\"hello, \"\"world\"\"\""));
        assert!(text.contains("\"line one\nline two\""));
        assert!(text.contains(",text,"));

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[3], "hello, \"world\"");
        assert_eq!(&row[4], "line one\nline two");
        assert_eq!(&row[5], "");
    }

    #[test]
    fn test_json_export_is_newest_first() {
        let store = make_store();
        store.append(&NewConversation::text("first", "a")).unwrap();
        store
            .append(&NewConversation::image("second", "b", "/tmp/x.png"))
            .unwrap();

        let mut buf = Vec::new();
        store.export(ExportFormat::Json, &mut buf).unwrap();
        let parsed: Vec<ConversationRecord> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].user_query, "second");
        assert_eq!(parsed[1].user_query, "first");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
