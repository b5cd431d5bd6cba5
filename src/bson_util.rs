use bson::{Bson, Document};

use crate::error::{ErrorKind, Result};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

pub(crate) fn to_bson_array(docs: &[Document]) -> Bson {
    Bson::Array(docs.iter().map(|doc| Bson::Document(doc.clone())).collect())
}

pub(crate) fn to_i64_array(values: &[i64]) -> Bson {
    Bson::Array(values.iter().map(|i| Bson::Int64(*i)).collect())
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// The number of bytes the document occupies when serialized to BSON.
pub(crate) fn document_byte_size(document: &Document) -> Result<usize> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    Ok(bytes.len())
}

/// Verifies that an update document only contains update operators (i.e. all top level keys start
/// with '$').
pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    match first_key(update) {
        Some(key) => {
            if !key.starts_with('$') {
                Err(ErrorKind::InvalidArgument {
                    message: "update document must only contain update modifiers".to_string(),
                }
                .into())
            } else {
                Ok(())
            }
        }
        None => Err(ErrorKind::InvalidArgument {
            message: "update document must not be empty".to_string(),
        }
        .into()),
    }
}

/// Verifies that a replacement document does not contain update operators or dotted keys at the
/// top level.
pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    for key in replacement.keys() {
        if key.starts_with('$') {
            return Err(ErrorKind::InvalidDocument {
                message: format!("replacement document must not contain update modifiers, got {}", key),
                document: replacement.clone(),
            }
            .into());
        }
        if key.contains('.') {
            return Err(ErrorKind::InvalidDocument {
                message: format!("replacement document must not contain dotted keys, got {}", key),
                document: replacement.clone(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn get_int_coerces_lossless_numerics() {
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::Int64(5)), Some(5));
        assert_eq!(get_int(&Bson::Double(5.0)), Some(5));
        assert_eq!(get_int(&Bson::Double(5.5)), None);
        assert_eq!(get_int(&Bson::String("5".to_string())), None);
    }

    #[test]
    fn update_document_check_rejects_replacements() {
        assert!(update_document_check(&doc! { "$set": { "x": 1 } }).is_ok());
        assert!(update_document_check(&doc! { "x": 1 }).is_err());
        assert!(update_document_check(&doc! {}).is_err());
    }

    #[test]
    fn replacement_document_check_rejects_operators_and_dots() {
        assert!(replacement_document_check(&doc! { "x": 1 }).is_ok());
        assert!(replacement_document_check(&doc! { "$set": { "x": 1 } }).is_err());
        assert!(replacement_document_check(&doc! { "a.b": 1 }).is_err());
    }
}
