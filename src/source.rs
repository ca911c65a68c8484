//! Record-at-a-time CSV parsing into [`RawRecord`]s.

use crate::codec::RowLimitExceeded;
use crate::config::IngestConfig;
use crate::record::RawRecord;
use crate::{IngestError, IngestResult};
use csv_async::{AsyncReader, AsyncReaderBuilder, ErrorKind, StringRecord, Trim};
use futures::Stream;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Pull-based CSV source. A record is only parsed when asked for, so the
/// consumer's pace drives how many bytes get read.
pub struct CsvRecordSource<R> {
    rdr: AsyncReader<R>,
    headers: Arc<StringRecord>,
    max_record_bytes: usize,
    rows: u64,
}

impl<R> CsvRecordSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read the header row and check the configured columns are present.
    ///
    /// Rows with fewer or more fields than the header are not a parse error:
    /// they come through and get rejected by validation, and the stream goes on.
    pub async fn open(reader: R, config: &IngestConfig) -> IngestResult<Self> {
        let mut rdr = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .buffer_capacity(64 << 10)
            .create_reader(reader);

        let headers = rdr.headers().await.map_err(classify)?.clone();
        for required in config.columns.required() {
            if !headers.iter().any(|h| h == required) {
                return Err(IngestError::MissingHeader(required.to_string()));
            }
        }

        Ok(Self {
            rdr,
            headers: Arc::new(headers),
            max_record_bytes: config.max_record_bytes,
            rows: 0,
        })
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    /// Data rows returned so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Next row, or `None` at end of input.
    pub async fn next_record(&mut self) -> IngestResult<Option<RawRecord>> {
        let mut values = StringRecord::new();
        if !self.rdr.read_record(&mut values).await.map_err(classify)? {
            return Ok(None);
        }
        self.rows += 1;

        // physical line the record starts on, quoted newlines included
        let line = values
            .position()
            .map(|pos| pos.line())
            .unwrap_or(self.rows + 1);
        let record = RawRecord::new(Arc::clone(&self.headers), values);
        if record.byte_len() > self.max_record_bytes {
            return Err(IngestError::RecordTooLarge {
                limit: self.max_record_bytes,
                line,
            });
        }
        Ok(Some(record))
    }

    pub fn into_stream(self) -> impl Stream<Item = IngestResult<RawRecord>> + Send
    where
        R: 'static,
    {
        futures::stream::try_unfold(self, |mut src| async move {
            Ok(src.next_record().await?.map(|record| (record, src)))
        })
    }
}

/// Lift a row-guard trip out of the parser's io error.
fn classify(err: csv_async::Error) -> IngestError {
    if let ErrorKind::Io(io) = err.kind() {
        if let Some(hit) = io
            .get_ref()
            .and_then(|e| e.downcast_ref::<RowLimitExceeded>())
        {
            return IngestError::RecordTooLarge {
                limit: hit.limit,
                line: hit.line,
            };
        }
    }
    IngestError::Upstream(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{build_csv_reader, UploadMeta};
    use futures::TryStreamExt;

    #[tokio::test]
    async fn parses_trimmed_rows_and_skips_blank_lines() {
        let input: &'static [u8] = b" sku , name ,price\n A1 , Widget , 9.5 \n\nB2,Gadget,3\n";
        let mut src = CsvRecordSource::open(input, &IngestConfig::default())
            .await
            .unwrap();
        assert_eq!(src.headers().iter().collect::<Vec<_>>(), ["sku", "name", "price"]);

        let first = src.next_record().await.unwrap().unwrap();
        assert_eq!(first.get("sku"), Some("A1"));
        assert_eq!(first.get("name"), Some("Widget"));
        assert_eq!(first.get("price"), Some("9.5"));

        let second = src.next_record().await.unwrap().unwrap();
        assert_eq!(second.get("sku"), Some("B2"));
        assert!(src.next_record().await.unwrap().is_none());
        assert_eq!(src.rows(), 2);
    }

    #[tokio::test]
    async fn missing_column_is_refused_up_front() {
        let input: &'static [u8] = b"sku,name\nA,b\n";
        let err = CsvRecordSource::open(input, &IngestConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::MissingHeader(ref h) if h == "price"));
    }

    #[tokio::test]
    async fn short_rows_come_through_for_validation() {
        let input: &'static [u8] = b"sku,name,price\nA\n";
        let records: Vec<_> = CsvRecordSource::open(input, &IngestConfig::default())
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("price"), None);
    }

    #[tokio::test]
    async fn ragged_rows_do_not_stop_the_stream() {
        let input: &'static [u8] = b"sku,name,price
A
B,b,1,extra
C,c,2
";
        let records: Vec<_> = CsvRecordSource::open(input, &IngestConfig::default())
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.get("sku")).collect();
        assert_eq!(keys, [Some("A"), Some("B"), Some("C")]);
        assert_eq!(records[1].get("price"), Some("1"));
    }

    #[tokio::test]
    async fn oversized_record_reports_its_physical_line() {
        let config = IngestConfig {
            max_record_bytes: 8,
            ..Default::default()
        };
        let input: &'static [u8] = b"sku,name,price\n\"a\nb\",x,1\nA,bbbbbbbbbbbb,1\n";
        let mut src = CsvRecordSource::open(input, &config).await.unwrap();

        let first = src.next_record().await.unwrap().unwrap();
        assert_eq!(first.get("sku"), Some("a\nb"));
        assert!(matches!(
            src.next_record().await,
            Err(IngestError::RecordTooLarge { limit: 8, line: 4 })
        ));
    }

    #[tokio::test]
    async fn guard_trip_surfaces_as_record_too_large() {
        let config = IngestConfig {
            max_record_bytes: 32,
            ..Default::default()
        };
        let mut body = b"sku,name,price\nA,a,1\n".to_vec();
        body.extend(std::iter::repeat(b'x').take(4096));
        let (reader, _) = build_csv_reader(std::io::Cursor::new(body), UploadMeta::default(), 32);

        let mut src = CsvRecordSource::open(reader, &config).await.unwrap();
        let mut outcome = Ok(None);
        for _ in 0..3 {
            outcome = src.next_record().await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(
            outcome,
            Err(IngestError::RecordTooLarge { limit: 32, line: 3 })
        ));
    }
}
