//! Per-file client-side compression. The transformed file replaces its
//! source: `<name>` becomes `<name><suffix>`, the source is deleted and
//! the output is owner-only. Decompression reverses by suffix.

use std::sync::Arc;

use async_compression::tokio::write::{
    BzDecoder, BzEncoder, GzipDecoder, GzipEncoder, Lz4Decoder, Lz4Encoder, ZstdDecoder,
    ZstdEncoder,
};
use async_compression::Level;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::trace;

use utils::rate_limit::TokenBucket;

use crate::conf::CompressionMethod;
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::restrict_permissions;

/// Compress one file in place. Returns the output path. The compression
/// token bucket is charged by input size before the work starts.
pub async fn compress_file(
    path: &Utf8Path,
    method: CompressionMethod,
    level: i32,
    bucket: Option<&Arc<TokenBucket>>,
) -> Result<Utf8PathBuf> {
    if method == CompressionMethod::None {
        return Ok(path.to_owned());
    }
    let out_path = Utf8PathBuf::from(format!("{path}{}", method.suffix()));
    let input = tokio::fs::read(path).await?;
    if let Some(bucket) = bucket {
        bucket.acquire(input.len() as u64).await;
    }

    let file = tokio::fs::File::create(&out_path).await?;
    let writer = BufWriter::new(file);
    let level = Level::Precise(level);
    let mut encoder: Box<dyn AsyncWrite + Send + Unpin> = match method {
        CompressionMethod::Gzip => Box::new(GzipEncoder::with_quality(writer, level)),
        CompressionMethod::Zstd => Box::new(ZstdEncoder::with_quality(writer, level)),
        CompressionMethod::Lz4 => Box::new(Lz4Encoder::with_quality(writer, level)),
        CompressionMethod::Bzip2 => Box::new(BzEncoder::with_quality(writer, level)),
        CompressionMethod::None => unreachable!(),
    };
    encoder.write_all(&input).await?;
    encoder.shutdown().await?;
    drop(encoder);

    restrict_permissions(&out_path)?;
    tokio::fs::remove_file(path).await?;
    trace!("compressed {path} -> {out_path}");
    Ok(out_path)
}

/// Reverse [`compress_file`], dispatching on the file name suffix.
pub async fn decompress_file(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let Some(method) = method_for(path) else {
        return Ok(path.to_owned());
    };
    let out_path = Utf8PathBuf::from(
        path.as_str()
            .strip_suffix(method.suffix())
            .expect("suffix just matched")
            .to_string(),
    );
    let input = tokio::fs::read(path).await?;

    let file = tokio::fs::File::create(&out_path).await?;
    let writer = BufWriter::new(file);
    let mut decoder: Box<dyn AsyncWrite + Send + Unpin> = match method {
        CompressionMethod::Gzip => Box::new(GzipDecoder::new(writer)),
        CompressionMethod::Zstd => Box::new(ZstdDecoder::new(writer)),
        CompressionMethod::Lz4 => Box::new(Lz4Decoder::new(writer)),
        CompressionMethod::Bzip2 => Box::new(BzDecoder::new(writer)),
        CompressionMethod::None => unreachable!(),
    };
    decoder
        .write_all(&input)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ChecksumMismatch, format!("corrupt compressed file {path}"), e))?;
    decoder
        .shutdown()
        .await
        .map_err(|e| Error::with_source(ErrorKind::ChecksumMismatch, format!("corrupt compressed file {path}"), e))?;
    drop(decoder);

    restrict_permissions(&out_path)?;
    tokio::fs::remove_file(path).await?;
    trace!("decompressed {path} -> {out_path}");
    Ok(out_path)
}

/// Compression method a file name's suffix announces.
pub fn method_for(path: &Utf8Path) -> Option<CompressionMethod> {
    let name = path.file_name()?;
    if name.ends_with(".gz") {
        Some(CompressionMethod::Gzip)
    } else if name.ends_with(".zstd") {
        Some(CompressionMethod::Zstd)
    } else if name.ends_with(".lz4") {
        Some(CompressionMethod::Lz4)
    } else if name.ends_with(".bz2") {
        Some(CompressionMethod::Bzip2)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    async fn roundtrip(method: CompressionMethod) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relation");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &payload).await.unwrap();

        let compressed = compress_file(&path, method, 3, None).await.unwrap();
        assert_eq!(compressed, dir.path().join(format!("relation{}", method.suffix())));
        assert!(!path.exists(), "source is deleted after transform");
        assert!(compressed.exists());

        let restored = decompress_file(&compressed).await.unwrap();
        assert_eq!(restored, path);
        assert!(!compressed.exists());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn gzip_roundtrip() {
        roundtrip(CompressionMethod::Gzip).await;
    }

    #[tokio::test]
    async fn zstd_roundtrip() {
        roundtrip(CompressionMethod::Zstd).await;
    }

    #[tokio::test]
    async fn lz4_roundtrip() {
        roundtrip(CompressionMethod::Lz4).await;
    }

    #[tokio::test]
    async fn bzip2_roundtrip() {
        roundtrip(CompressionMethod::Bzip2).await;
    }

    #[tokio::test]
    async fn none_is_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"data").await.unwrap();
        let out = compress_file(&path, CompressionMethod::None, 0, None).await.unwrap();
        assert_eq!(out, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn output_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, vec![0u8; 1000]).await.unwrap();
        let out = compress_file(&path, CompressionMethod::Gzip, 6, None).await.unwrap();
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
