//! Hiding an envelope behind an innocuous carrier file
//!
//! A container is `carrier || DELIMITER || envelope`. Readers that stop at
//! the end of the carrier's own structure (PDF, JPEG, ZIP and most document
//! formats) still open the carrier. Image carriers are first redrawn as a
//! one-page PDF so the result opens as a document.

use crate::error::{EndcryptError, ErrorCategory, ErrorKind, Result};
use pdf_writer::{Content, Filter, Finish, Name, Pdf, Rect, Ref};
use std::path::Path;

/// Marker separating carrier bytes from envelope bytes.
pub const DELIMITER: &[u8] = b"--BETTY-DELIM--";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "heic"];

/// zlib level used for PDF image streams.
const FLATE_LEVEL: u8 = 6;

/// A carrier ready for embedding, with the name it should be saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Carrier {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Append the envelope to the carrier behind the delimiter.
pub fn embed(envelope: &[u8], carrier: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(carrier.len() + DELIMITER.len() + envelope.len());
    combined.extend_from_slice(carrier);
    combined.extend_from_slice(DELIMITER);
    combined.extend_from_slice(envelope);
    combined
}

/// Split a container at the first delimiter into `(carrier, envelope)`.
pub fn extract(combined: &[u8]) -> Result<(&[u8], &[u8])> {
    let pos = find_delimiter(combined).ok_or_else(|| {
        EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::DelimiterNotFound,
            "input does not contain a hidden envelope",
        )
    })?;
    Ok((&combined[..pos], &combined[pos + DELIMITER.len()..]))
}

pub fn contains_delimiter(bytes: &[u8]) -> bool {
    find_delimiter(bytes).is_some()
}

/// The envelope part of `bytes`: everything after the first delimiter, or
/// all of `bytes` when there is none.
pub fn envelope_bytes(bytes: &[u8]) -> &[u8] {
    match find_delimiter(bytes) {
        Some(pos) => &bytes[pos + DELIMITER.len()..],
        None => bytes,
    }
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

/// Whether a carrier name has an image extension that gets converted.
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Normalize a carrier: images become a one-page PDF named `<stem>.pdf`,
/// everything else passes through untouched.
pub fn prepare_carrier(name: &str, bytes: Vec<u8>) -> Result<Carrier> {
    if !is_image_name(name) {
        return Ok(Carrier {
            name: name.to_string(),
            bytes,
        });
    }

    let pdf = image_to_pdf(&bytes).map_err(|e| e.with_context(format!("cannot convert {}", name)))?;
    let stem = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("carrier");
    tracing::debug!(carrier = name, pdf_bytes = pdf.len(), "converted image carrier to PDF");
    Ok(Carrier {
        name: format!("{}.pdf", stem),
        bytes: pdf,
    })
}

/// Normalize the carrier, then embed the envelope in it.
pub fn embed_in_carrier(envelope: &[u8], carrier_name: &str, carrier: Vec<u8>) -> Result<Carrier> {
    let prepared = prepare_carrier(carrier_name, carrier)?;
    Ok(Carrier {
        bytes: embed(envelope, &prepared.bytes),
        name: prepared.name,
    })
}

/// Draw an image full-bleed on a single PDF page sized to its pixels.
pub fn image_to_pdf(image_bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(image_bytes).map_err(|e| {
        EndcryptError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::CarrierConversionFailed,
            "image carrier could not be decoded",
            e,
        )
    })?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let (Ok(w), Ok(h)) = (i32::try_from(width), i32::try_from(height)) else {
        return Err(EndcryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::CarrierConversionFailed,
            format!("image of {}x{} pixels is too large", width, height),
        ));
    };
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(rgb.as_raw(), FLATE_LEVEL);

    let catalog_id = Ref::new(1);
    let page_tree_id = Ref::new(2);
    let page_id = Ref::new(3);
    let image_id = Ref::new(4);
    let content_id = Ref::new(5);
    let image_name = Name(b"Im1");

    let mut pdf = Pdf::new();
    pdf.catalog(catalog_id).pages(page_tree_id);
    pdf.pages(page_tree_id).kids([page_id]).count(1);

    let mut page = pdf.page(page_id);
    page.media_box(Rect::new(0.0, 0.0, width as f32, height as f32));
    page.parent(page_tree_id);
    page.contents(content_id);
    page.resources().x_objects().pair(image_name, image_id);
    page.finish();

    let mut image = pdf.image_xobject(image_id, &compressed);
    image.filter(Filter::FlateDecode);
    image.width(w);
    image.height(h);
    image.color_space().device_rgb();
    image.bits_per_component(8);
    image.finish();

    let mut content = Content::new();
    content.save_state();
    content.transform([width as f32, 0.0, 0.0, height as f32, 0.0, 0.0]);
    content.x_object(image_name);
    content.restore_state();
    pdf.stream(content_id, &content.finish());

    Ok(pdf.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_embed_extract_exact() {
        let carrier = b"%PDF-1.4 carrier bytes".to_vec();
        let envelope = br#"{"type":"password"}"#.to_vec();

        let combined = embed(&envelope, &carrier);
        let (c, e) = extract(&combined).unwrap();
        assert_eq!(c, carrier.as_slice());
        assert_eq!(e, envelope.as_slice());
        assert!(combined.starts_with(&carrier));
    }

    #[test]
    fn test_extract_uses_first_delimiter() {
        let envelope = b"env--BETTY-DELIM--with marker inside";
        let combined = embed(envelope, b"carrier");
        let (c, e) = extract(&combined).unwrap();
        assert_eq!(c, b"carrier");
        assert_eq!(e, envelope);
    }

    #[test]
    fn test_empty_parts() {
        let combined = embed(b"", b"");
        assert_eq!(combined, DELIMITER);
        let (c, e) = extract(&combined).unwrap();
        assert!(c.is_empty() && e.is_empty());
    }

    #[test]
    fn test_delimiter_not_found() {
        let err = extract(b"plain file").expect_err("expected missing delimiter");
        assert_eq!(err.kind, Some(ErrorKind::DelimiterNotFound));
        assert!(!contains_delimiter(b"--BETTY-DELIM-"));
        assert_eq!(envelope_bytes(b"{}"), b"{}");
    }

    #[test]
    fn test_image_names() {
        assert!(is_image_name("photo.PNG"));
        assert!(is_image_name("a.jpeg"));
        assert!(is_image_name("b.HeIc"));
        assert!(!is_image_name("doc.pdf"));
        assert!(!is_image_name("png"));
    }

    #[test]
    fn test_image_becomes_pdf() {
        let carrier = prepare_carrier("holiday.png", png_bytes(3, 2)).unwrap();
        assert_eq!(carrier.name, "holiday.pdf");
        assert!(carrier.bytes.starts_with(b"%PDF-"));

        let text = String::from_utf8_lossy(&carrier.bytes);
        assert!(text.contains("/MediaBox"));
        assert!(text.contains("/FlateDecode"));
        assert!(text.contains("/Width 3"));
        assert!(text.contains("/Height 2"));
    }

    #[test]
    fn test_non_image_passes_through() {
        let carrier = prepare_carrier("report.pdf", b"%PDF-1.7".to_vec()).unwrap();
        assert_eq!(carrier.name, "report.pdf");
        assert_eq!(carrier.bytes, b"%PDF-1.7");
    }

    #[test]
    fn test_undecodable_image() {
        let err = prepare_carrier("photo.heic", b"\0\0\0\x18ftypheic".to_vec())
            .expect_err("expected conversion failure");
        assert_eq!(err.kind, Some(ErrorKind::CarrierConversionFailed));
    }

    #[test]
    fn test_embed_in_image_carrier() {
        let hidden = embed_in_carrier(b"{}", "cat.jpg", png_bytes(1, 1));
        // PNG bytes under a .jpg name still decode: format is sniffed.
        let hidden = hidden.unwrap();
        assert_eq!(hidden.name, "cat.pdf");
        let (carrier, envelope) = extract(&hidden.bytes).unwrap();
        assert!(carrier.starts_with(b"%PDF-"));
        assert_eq!(envelope, b"{}");
    }
}
