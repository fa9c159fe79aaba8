//! EXIF tag extraction
//!
//! Only the primary image's IFD0 tags are reported, each as text: ASCII and
//! opaque byte values are decoded, numbers are printed, and multi-valued
//! fields render as a parenthesised list.

use std::collections::BTreeMap;
use std::io::{BufReader, Cursor};

use exif::{Context, Field, In, Reader, Tag, Value};

/// Read IFD0 tags from an image container (JPEG, PNG, TIFF, WebP, HEIF).
///
/// Returns an empty map when the data carries no readable EXIF block.
pub fn read_exif_tags(data: &[u8]) -> BTreeMap<String, String> {
    let mut reader = BufReader::new(Cursor::new(data));
    let exif = match Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(e) => {
            tracing::debug!(error = %e, "No EXIF data");
            return BTreeMap::new();
        }
    };

    exif.fields()
        .filter(|f| f.ifd_num == In::PRIMARY && f.tag.context() == Context::Tiff)
        .map(|f| (tag_name(f.tag), field_text(f)))
        .collect()
}

/// Conventional names for the IFD pointer tags; every other tag keeps its
/// standard name.
fn tag_name(tag: Tag) -> String {
    if tag == Tag::ExifIFDPointer {
        "ExifOffset".to_string()
    } else if tag == Tag::GPSInfoIFDPointer {
        "GPSInfo".to_string()
    } else if tag == Tag::InteropIFDPointer {
        "InteropOffset".to_string()
    } else {
        tag.to_string()
    }
}

fn field_text(field: &Field) -> String {
    value_text(&field.value)
}

fn listed<I, T>(items: I) -> String
where
    I: IntoIterator<Item = T>,
    T: ToString,
{
    let mut parts: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        format!("({})", parts.join(", "))
    }
}

fn decode_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Ascii(lines) => lines
            .iter()
            .map(|l| decode_bytes(l))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Undefined(bytes, _) => decode_bytes(bytes),
        Value::Byte(v) => listed(v),
        Value::Short(v) => listed(v),
        Value::Long(v) => listed(v),
        Value::SByte(v) => listed(v),
        Value::SShort(v) => listed(v),
        Value::SLong(v) => listed(v),
        Value::Rational(v) => listed(v.iter().map(|r| format!("{:?}", r.to_f64()))),
        Value::SRational(v) => listed(v.iter().map(|r| format!("{:?}", r.to_f64()))),
        Value::Float(v) => listed(v.iter().map(|f| format!("{:?}", f))),
        Value::Double(v) => listed(v.iter().map(|f| format!("{:?}", f))),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}
