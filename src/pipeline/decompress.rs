//! Content-Encoding decoding for bodies the gateway has to read

use std::io::{Cursor, Read};

use anyhow::{bail, Context};

/// Decode `body` according to a Content-Encoding header value
///
/// Stacked encodings (`gzip, br`) are undone last-applied first.
pub fn decompress(body: &[u8], encoding: &str) -> anyhow::Result<Vec<u8>> {
    let mut data = body.to_vec();
    for coding in encoding.rsplit(',').map(|c| c.trim().to_ascii_lowercase()) {
        data = match coding.as_str() {
            "" | "identity" => data,
            "gzip" | "x-gzip" => {
                let mut out = Vec::new();
                flate2::read::MultiGzDecoder::new(data.as_slice())
                    .read_to_end(&mut out)
                    .context("invalid gzip body")?;
                out
            }
            "deflate" => inflate(&data)?,
            "br" => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut Cursor::new(&data), &mut out)
                    .context("invalid brotli body")?;
                out
            }
            other => bail!("unsupported content encoding: {}", other),
        };
    }
    Ok(data)
}

/// `deflate` is zlib-wrapped per RFC 9110, but servers also send raw streams
fn inflate(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    if flate2::read::ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .context("invalid deflate body")?;
    Ok(out)
}

/// Whether the gateway can decode this Content-Encoding value
pub fn is_supported(encoding: &str) -> bool {
    encoding.split(',').all(|c| {
        matches!(
            c.trim().to_ascii_lowercase().as_str(),
            "" | "identity" | "gzip" | "x-gzip" | "deflate" | "br"
        )
    })
}
