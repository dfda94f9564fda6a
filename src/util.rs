// Jackson Coxson
// Plist helpers shared by the service clients

use plist::{Dictionary, Value};

use crate::IdeviceError;

/// Serializes a plist value as XML bytes
pub fn plist_to_xml_bytes(v: &Value) -> Result<Vec<u8>, IdeviceError> {
    let mut buf = Vec::new();
    v.to_writer_xml(&mut buf)?;
    Ok(buf)
}

/// Parses bytes received from the device. Anything that isn't a dictionary
/// is treated as a protocol violation rather than a local plist error.
pub fn device_dictionary(bytes: &[u8]) -> Result<Dictionary, IdeviceError> {
    let value = Value::from_reader(std::io::Cursor::new(bytes))
        .map_err(|e| IdeviceError::ProtocolError(format!("malformed plist: {e}")))?;
    value
        .into_dictionary()
        .ok_or_else(|| IdeviceError::ProtocolError("message is not a dictionary".into()))
}

/// Fetches a string key that the protocol requires
pub fn required_string(dict: &Dictionary, key: &str) -> Result<String, IdeviceError> {
    match dict.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(IdeviceError::ProtocolError(format!("{key} is not a string"))),
        None => Err(IdeviceError::ProtocolError(format!("missing {key}"))),
    }
}

/// Fetches an optional string key, rejecting other types
pub fn optional_string(dict: &Dictionary, key: &str) -> Result<Option<String>, IdeviceError> {
    match dict.get(key) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(IdeviceError::ProtocolError(format!("{key} is not a string"))),
        None => Ok(None),
    }
}

/// Fetches an optional boolean key, rejecting other types
pub fn optional_bool(dict: &Dictionary, key: &str) -> Result<Option<bool>, IdeviceError> {
    match dict.get(key) {
        Some(Value::Boolean(b)) => Ok(Some(*b)),
        Some(_) => Err(IdeviceError::ProtocolError(format!("{key} is not a boolean"))),
        None => Ok(None),
    }
}

pub fn pretty_print_dictionary(dict: &Dictionary) -> String {
    let mut out = String::new();
    print_dictionary(dict, 0, &mut out);
    out
}

pub fn pretty_print_plist(p: &Value) -> String {
    let mut out = String::new();
    print_value(p, 0, &mut out);
    out
}

fn print_dictionary(dict: &Dictionary, indent: usize, out: &mut String) {
    out.push_str("{\n");
    for (k, v) in dict {
        out.push_str(&"  ".repeat(indent + 1));
        out.push_str(k);
        out.push_str(": ");
        print_value(v, indent + 1, out);
        out.push('\n');
    }
    out.push_str(&"  ".repeat(indent));
    out.push('}');
}

fn print_value(v: &Value, indent: usize, out: &mut String) {
    match v {
        Value::Dictionary(d) => print_dictionary(d, indent, out),
        Value::Array(a) => {
            out.push_str("[\n");
            for item in a {
                out.push_str(&"  ".repeat(indent + 1));
                print_value(item, indent + 1, out);
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push(']');
        }
        Value::String(s) => out.push_str(&format!("{s:?}")),
        Value::Boolean(b) => out.push_str(&b.to_string()),
        Value::Integer(i) => out.push_str(&i.to_string()),
        Value::Real(r) => out.push_str(&r.to_string()),
        // Images and signatures are large; the length is what matters in logs
        Value::Data(d) => out.push_str(&format!("<{} bytes>", d.len())),
        Value::Date(d) => out.push_str(&format!("{d:?}")),
        Value::Uid(u) => out.push_str(&format!("{u:?}")),
        _ => out.push_str("<unknown>"),
    }
}
