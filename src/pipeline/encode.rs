//! Image encoding: stored page image → base64 `ImageData` for the VLM.
//!
//! Page images are already PNG on disk, so the file bytes are sent as-is.
//! `detail: "high"` makes GPT-4-class models use the full tile budget;
//! small handwritten subscripts and exponents need it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// MIME type for an image path, by extension. Unknown extensions are
/// assumed to be PNG, the format the rasteriser writes.
pub fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Base64-wrap raw image bytes.
pub fn encode_bytes(bytes: &[u8], mime: &str) -> ImageData {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, mime).with_detail("high")
}

/// Read and encode the image at `path`.
pub async fn encode_file(path: &Path) -> std::io::Result<ImageData> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_bytes(&bytes, mime_type(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_type(Path::new("a/notes_page1.png")), "image/png");
        assert_eq!(mime_type(Path::new("scan.JPG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("noext")), "image/png");
    }

    #[tokio::test]
    async fn encode_png_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
            .save(&path)
            .unwrap();

        let data = encode_file(&path).await.expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, std::fs::read(&path).unwrap());
    }
}
