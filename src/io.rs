use crate::IngestResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::{RowGuard, Transcoder};

/// What we know about an upload before reading it.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// the uploaded file name (used for extension fallback and progress labels)
    pub name_hint: String,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for UploadMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

impl UploadMeta {
    /// Content-Encoding header first, then Content-Type, then file extension.
    fn is_gzip(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        let ct = self.content_type.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "gzip")
            || matches!(ct.as_str(), "application/gzip" | "application/x-gzip")
            || self.name_hint.ends_with(".gz")
    }

    fn is_zstd(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        let ct = self.content_type.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "zstd")
            || ct == "application/zstd"
            || self.name_hint.ends_with(".zst")
    }
}

/// Wrap a raw upload with optional decompression, UTF-8 transcoding and the
/// per-row size guard. The result is ready for the CSV parser.
///
/// Nothing here buffers more than one read ahead: bytes are only pulled from
/// `raw` when the parser asks for them.
pub fn build_csv_reader<R>(
    raw: R,
    meta: UploadMeta,
    max_record_bytes: usize,
) -> (impl AsyncRead + Unpin + Send, UploadMeta)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // 64 KiB keeps syscalls down without letting read-ahead dominate a small batch
    let buf = BufReader::with_capacity(64 << 10, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    };

    // transcode only when charset != UTF-8 to avoid extra copies
    let utf8: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let framed = FramedRead::new(decompressed, Transcoder::new(meta.charset));
        Box::new(StreamReader::new(framed))
    };

    let guarded = StreamReader::new(FramedRead::new(utf8, RowGuard::new(max_record_bytes)));
    (guarded, meta)
}

/// Build a reader from a local file path (lightweight meta from extension).
pub async fn reader_from_path(
    path: &Path,
    max_record_bytes: usize,
) -> IngestResult<(impl AsyncRead + Unpin + Send, UploadMeta)> {
    let file = File::open(path).await?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let mut meta = UploadMeta {
        name_hint: name,
        ..Default::default()
    };

    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match ext {
        "gz" => {
            meta.content_type = "application/gzip".into();
            meta.content_encoding = "gzip".into();
        }
        "zst" => {
            meta.content_type = "application/zstd".into();
            meta.content_encoding = "zstd".into();
        }
        _ => {
            meta.content_type = "text/csv".into();
        }
    }

    Ok(build_csv_reader(file, meta, max_record_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn compression_is_picked_from_header_type_or_name() {
        let by_header = UploadMeta {
            content_encoding: "identity, GZIP".into(),
            ..Default::default()
        };
        assert!(by_header.is_gzip());

        let by_type = UploadMeta {
            content_type: "application/zstd".into(),
            ..Default::default()
        };
        assert!(by_type.is_zstd() && !by_type.is_gzip());

        let by_name = UploadMeta {
            name_hint: "products.csv.gz".into(),
            ..Default::default()
        };
        assert!(by_name.is_gzip());
        assert!(!UploadMeta::default().is_gzip());
    }

    #[tokio::test]
    async fn plain_reader_passes_bytes_through() {
        let input: &'static [u8] = b"sku,name,price\nA,a,1\n";
        let (mut reader, meta) = build_csv_reader(input, UploadMeta::default(), 1024);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "sku,name,price\nA,a,1\n");
        assert_eq!(meta.charset, encoding_rs::UTF_8);
    }

    #[tokio::test]
    async fn oversized_row_fails_the_read() {
        let input: &'static [u8] = b"sku,name,price\nA,aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa,1\n";
        let (mut reader, _meta) = build_csv_reader(input, UploadMeta::default(), 20);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
