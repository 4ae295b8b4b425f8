//! Plaintext name/value info protocol (proto type 1). The command core
//! only speaks it for UDF registration and removal; general info commands
//! belong to the topology layer.

use crate::commands::buffer;
use crate::errors::{Error, ErrorKind, Result};
use crate::net::Connection;
use hashbrown::HashMap;

/// Issue `names` and collect the tab-separated responses.
pub fn request(conn: &mut Connection, names: &[&str]) -> Result<HashMap<String, String>> {
    conn.buffer.data_buffer.clear();
    conn.buffer.data_offset = 8;
    for name in names {
        conn.buffer.write_str(name);
        conn.buffer.write_u8(b'\n');
    }
    conn.buffer.end(buffer::PROTO_TYPE_INFO);
    conn.flush()?;

    let size = conn.read_message()?;
    let text = conn.buffer.read_str(size)?;

    let mut values = HashMap::with_capacity(names.len());
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match line.find('\t') {
            Some(tab) => {
                values.insert(line[..tab].to_string(), line[tab + 1..].to_string());
            }
            None => {
                values.insert(line.to_string(), String::new());
            }
        }
    }
    Ok(values)
}

/// Single-command convenience: the value for `name`, with server-side
/// `error=` answers surfaced as errors.
pub fn request_one(conn: &mut Connection, name: &str) -> Result<String> {
    let values = request(conn, &[name])?;
    let value = values
        .get(name)
        .cloned()
        .unwrap_or_else(|| values.values().next().cloned().unwrap_or_default());
    check_error(&value)?;
    Ok(value)
}

/// Info responses report failures in-band as `error=<code>:<message>`. The
/// core only issues udf-put/udf-remove, so failures surface as UDF errors.
pub fn check_error(value: &str) -> Result<()> {
    if let Some(rest) = value.strip_prefix("error=") {
        return Err(Error::new(ErrorKind::Udf(rest.to_string())));
    }
    Ok(())
}
