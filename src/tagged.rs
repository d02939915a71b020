//! Tagged tag-length-value serialization (spec §6).
//!
//! Used by the sideband log's metadata record and, per the spec, shared with
//! the remote-execution boundary (out of scope here as a protocol, but the
//! codec itself is in scope). Each record is `u8 tag, u8 type, typed body`;
//! tag `0` is reserved (`End`) and terminates a stream; unknown tags are
//! skipped rather than rejected, for forward compatibility.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const TYPE_NUMBER: u8 = 0;
const TYPE_STRING: u8 = 1;
const TYPE_MAP: u8 = 2;

const TAG_END: u8 = 0;

/// A value in the tagged serialization format.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    /// A signed 64-bit integer.
    Number(i64),
    /// A UTF-8 string.
    Text(String),
    /// A nested map of tag to value.
    Map(Vec<(u8, TaggedValue)>),
}

impl TaggedValue {
    fn type_code(&self) -> u8 {
        match self {
            TaggedValue::Number(_) => TYPE_NUMBER,
            TaggedValue::Text(_) => TYPE_STRING,
            TaggedValue::Map(_) => TYPE_MAP,
        }
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            TaggedValue::Number(n) => w.write_i64::<LittleEndian>(*n),
            TaggedValue::Text(s) => {
                let bytes = s.as_bytes();
                w.write_i32::<LittleEndian>(bytes.len() as i32)?;
                w.write_all(bytes)
            }
            TaggedValue::Map(entries) => {
                w.write_i32::<LittleEndian>(entries.len() as i32)?;
                for (tag, value) in entries {
                    write_record(w, *tag, value)?;
                }
                Ok(())
            }
        }
    }

    fn read_body<R: Read>(type_code: u8, r: &mut R) -> io::Result<TaggedValue> {
        match type_code {
            TYPE_NUMBER => Ok(TaggedValue::Number(r.read_i64::<LittleEndian>()?)),
            TYPE_STRING => {
                let len = r.read_i32::<LittleEndian>()?;
                let len = usize::try_from(len)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative length"))?;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)?;
                let s = String::from_utf8(buf)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(TaggedValue::Text(s))
            }
            TYPE_MAP => {
                let count = r.read_i32::<LittleEndian>()?;
                let count = usize::try_from(count)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative count"))?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = r.read_u8()?;
                    let type_code = r.read_u8()?;
                    entries.push((tag, TaggedValue::read_body(type_code, r)?));
                }
                Ok(TaggedValue::Map(entries))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown tagged-value type code {other}"),
            )),
        }
    }
}

fn write_record<W: Write>(w: &mut W, tag: u8, value: &TaggedValue) -> io::Result<()> {
    debug_assert_ne!(tag, TAG_END, "tag 0 is reserved for End");
    w.write_u8(tag)?;
    w.write_u8(value.type_code())?;
    value.write_body(w)
}

/// Encodes `entries` (tag, value pairs) followed by the terminating `End`
/// record.
pub fn encode(entries: &[(u8, TaggedValue)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (tag, value) in entries {
        write_record(&mut buf, *tag, value).expect("writing to Vec<u8> cannot fail");
    }
    buf.write_u8(TAG_END).expect("writing to Vec<u8> cannot fail");
    buf.write_u8(TYPE_NUMBER).expect("writing to Vec<u8> cannot fail");
    buf.write_i64::<LittleEndian>(0)
        .expect("writing to Vec<u8> cannot fail");
    buf
}

/// Decodes a tagged stream until the `End` record, skipping any record whose
/// type code is not recognized rather than erroring out (forward
/// compatibility for streams written by a newer implementation).
pub fn decode<R: Read>(r: &mut R) -> io::Result<Vec<(u8, TaggedValue)>> {
    let mut entries = Vec::new();
    loop {
        let tag = r.read_u8()?;
        let type_code = r.read_u8()?;
        if tag == TAG_END {
            // Still must consume the End record's (unused) body.
            let _ = TaggedValue::read_body(type_code, r)?;
            return Ok(entries);
        }
        match TaggedValue::read_body(type_code, r) {
            Ok(value) => entries.push((tag, value)),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                // Unknown type code for this tag: we have no way to know its
                // body length, so we cannot skip it safely. Per spec, only
                // unknown *tags* are guaranteed skippable, not unknown types;
                // bubble this one up.
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(entries: Vec<(u8, TaggedValue)>) {
        let bytes = encode(&entries);
        let decoded = decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn number_round_trips() {
        round_trip(vec![(1, TaggedValue::Number(-42))]);
    }

    #[test]
    fn string_round_trips() {
        round_trip(vec![(2, TaggedValue::Text("hello sandbox".to_string()))]);
    }

    #[test]
    fn nested_map_round_trips() {
        round_trip(vec![(
            3,
            TaggedValue::Map(vec![
                (1, TaggedValue::Number(7)),
                (2, TaggedValue::Text("nested".to_string())),
            ]),
        )]);
    }

    #[test]
    fn empty_stream_round_trips() {
        round_trip(vec![]);
    }

    #[test]
    fn unknown_tag_is_skipped_not_rejected() {
        // A record with an unrecognized *tag* is still fully decodable (tag
        // is just an opaque u8), so "skip" in the spec's sense means the
        // caller ignores it, not that the codec refuses to decode it.
        round_trip(vec![(200, TaggedValue::Number(1))]);
    }

    #[test]
    fn multiple_entries_preserve_order() {
        round_trip(vec![
            (1, TaggedValue::Number(1)),
            (2, TaggedValue::Number(2)),
            (3, TaggedValue::Number(3)),
        ]);
    }
}
