//! Typed, defensive access to diagnostic snapshots.
//!
//! A snapshot is an untyped BSON [`Document`] with no schema guarantee across
//! server versions. Collectors never match on [`Bson`] variants directly; they
//! go through these accessors, which treat every path segment as optional and
//! every type mismatch as absence.
//!
//! Paths are slices of keys rather than dotted strings because several
//! storage-engine field names contain spaces and dashes
//! (`"bytes currently in the cache"`, `"block-manager"`).

use mongodb::bson::{Bson, Document};

use crate::value;

/// Follows `path` through nested sub-documents.
pub fn lookup<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Bson> {
    let (last, parents) = path.split_last()?;
    let mut current = doc;
    for key in parents {
        match current.get(*key)? {
            Bson::Document(inner) => current = inner,
            _ => return None,
        }
    }
    current.get(*last)
}

/// Sub-document at `path`.
pub fn get_doc<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Document> {
    match lookup(doc, path)? {
        Bson::Document(d) => Some(d),
        _ => None,
    }
}

/// String at `path`.
pub fn get_str<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a str> {
    match lookup(doc, path)? {
        Bson::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Integer at `path` (`Int32` or `Int64` only, any sign).
pub fn get_i64(doc: &Document, path: &[&str]) -> Option<i64> {
    match lookup(doc, path)? {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

/// Double at `path` (`Double` only).
pub fn get_f64(doc: &Document, path: &[&str]) -> Option<f64> {
    match lookup(doc, path)? {
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Any numeric representation at `path`, validated by [`value::numeric`].
pub fn get_number(doc: &Document, path: &[&str]) -> Option<f64> {
    lookup(doc, path).and_then(value::numeric)
}

/// Boolean at `path`.
pub fn get_bool(doc: &Document, path: &[&str]) -> Option<bool> {
    match lookup(doc, path)? {
        Bson::Boolean(b) => Some(*b),
        _ => None,
    }
}

/// Array at `path`.
pub fn get_array<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Vec<Bson>> {
    match lookup(doc, path)? {
        Bson::Array(a) => Some(a),
        _ => None,
    }
}

/// Seconds component of a BSON timestamp (oplog `ts`), or of a datetime.
pub fn get_timestamp_secs(doc: &Document, path: &[&str]) -> Option<f64> {
    match lookup(doc, path)? {
        Bson::Timestamp(ts) => Some(ts.time as f64),
        Bson::DateTime(dt) => Some((dt.timestamp_millis() / 1000) as f64),
        _ => None,
    }
}

/// Iterates the sub-documents of an array, skipping non-document elements.
pub fn documents(array: &[Bson]) -> impl Iterator<Item = &Document> {
    array.iter().filter_map(|item| match item {
        Bson::Document(d) => Some(d),
        _ => None,
    })
}

/// Iterates `(key, sub-document)` pairs of a document, skipping scalar fields.
pub fn sub_documents(doc: &Document) -> impl Iterator<Item = (&str, &Document)> {
    doc.iter().filter_map(|(k, v)| match v {
        Bson::Document(d) => Some((k.as_str(), d)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{Timestamp, doc};

    fn sample() -> Document {
        doc! {
            "host": "db1:27017",
            "uptime": 3600.0,
            "repl": { "setName": "rs0", "ismaster": true },
            "wiredTiger": { "cache": { "bytes currently in the cache": 1024_i64 } },
            "members": [ { "name": "a" }, 5, { "name": "b" } ],
            "ts": Timestamp { time: 1_700_000_000, increment: 3 },
            "count": 7_i32,
        }
    }

    #[test]
    fn test_lookup_nested() {
        let d = sample();
        assert_eq!(get_str(&d, &["repl", "setName"]), Some("rs0"));
        assert_eq!(get_bool(&d, &["repl", "ismaster"]), Some(true));
        assert_eq!(
            get_i64(&d, &["wiredTiger", "cache", "bytes currently in the cache"]),
            Some(1024)
        );
    }

    #[test]
    fn test_lookup_through_scalar_is_absent() {
        let d = sample();
        assert_eq!(lookup(&d, &["host", "name"]), None);
        assert_eq!(lookup(&d, &[]), None);
        assert_eq!(get_doc(&d, &["missing", "deeper"]), None);
    }

    #[test]
    fn test_type_mismatch_is_absent() {
        let d = sample();
        assert_eq!(get_str(&d, &["uptime"]), None);
        assert_eq!(get_i64(&d, &["uptime"]), None);
        assert_eq!(get_f64(&d, &["count"]), None);
        assert_eq!(get_number(&d, &["count"]), Some(7.0));
        assert_eq!(get_number(&d, &["uptime"]), Some(3600.0));
    }

    #[test]
    fn test_timestamp_seconds() {
        let d = sample();
        assert_eq!(get_timestamp_secs(&d, &["ts"]), Some(1_700_000_000.0));
        assert_eq!(get_timestamp_secs(&d, &["host"]), None);
    }

    #[test]
    fn test_documents_skips_scalars() {
        let d = sample();
        let names: Vec<_> = documents(get_array(&d, &["members"]).unwrap())
            .filter_map(|m| get_str(m, &["name"]))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_sub_documents() {
        let d = doc! { "a": { "x": 1 }, "b": 2, "c": { "y": 3 } };
        let keys: Vec<_> = sub_documents(&d).map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
