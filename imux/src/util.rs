// Logging helpers for plist values and small shared utilities

use std::sync::{Mutex, MutexGuard};

use plist::Value;

/// Locks a state mutex, ignoring poisoning
///
/// A panicking callback must not wedge the state for every other user.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Renders a plist value on one line for log output
///
/// Data blobs are shown by length only.
pub fn pretty_print_plist(p: &Value) -> String {
    let mut out = String::new();
    print_value(p, &mut out);
    out
}

pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    let mut out = String::new();
    print_dictionary(dict, &mut out);
    out
}

fn print_dictionary(dict: &plist::Dictionary, out: &mut String) {
    out.push('{');
    for (i, (k, v)) in dict.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(k);
        out.push_str(": ");
        print_value(v, out);
    }
    out.push('}');
}

fn print_value(p: &Value, out: &mut String) {
    match p {
        Value::Array(a) => {
            out.push('[');
            for (i, v) in a.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_value(v, out);
            }
            out.push(']');
        }
        Value::Dictionary(d) => print_dictionary(d, out),
        Value::Boolean(b) => out.push_str(&b.to_string()),
        Value::Data(d) => out.push_str(&format!("<{} bytes>", d.len())),
        Value::Date(d) => out.push_str(&d.to_xml_format()),
        Value::Real(r) => out.push_str(&r.to_string()),
        Value::Integer(i) => out.push_str(&i.to_string()),
        Value::String(s) => out.push_str(&format!("{s:?}")),
        Value::Uid(u) => out.push_str(&format!("uid({})", u.get())),
        _ => out.push_str("<unknown>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_is_summarised() {
        let mut d = plist::Dictionary::new();
        d.insert("PairRecordData".into(), Value::Data(vec![0; 512]));
        d.insert("MessageType".into(), "SavePairRecord".into());
        let s = pretty_print_dictionary(&d);
        assert!(s.contains("<512 bytes>"), "data should print as a length: {s}");
        assert!(s.contains("\"SavePairRecord\""));
    }
}
