use crate::bencode_parser::parser::Value;

/// Encodes `value` in canonical bencode.
///
/// Dictionary keys are emitted in byte-lexicographic order no matter how the
/// map was built, so the output is stable across runs and matches any other
/// conforming encoder. This is what makes info hashes reproducible.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dictionary(entries) => {
            let mut sorted: Vec<_> = entries.iter().collect();
            sorted.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            buf.push(b'd');
            for (key, val) in sorted {
                encode_bytes(key, buf);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}
