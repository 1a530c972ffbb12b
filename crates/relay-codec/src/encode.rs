//! Relay message encoder.
//!
//! The whole body is staged in a scratch buffer so the length prefix can be
//! stamped before anything touches the transport; callers get one
//! contiguous frame per message.

use crate::object::{Hashtable, Hdata, Message, Object};

/// Serialize a message to a complete wire frame.
///
/// Frame layout: `[u32 BE total length][u8 compression=0][body]`, where the
/// total length includes the length field itself.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    // The message ID is a bare string payload, no type code.
    put_str(&mut body, Some(&msg.id));
    for obj in &msg.objects {
        body.extend_from_slice(obj.obj_type().code());
        put_payload(&mut body, obj);
    }

    let total = 4 + 1 + body.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.push(0); // compression flag
    frame.extend_from_slice(&body);
    frame
}

// ---------------------------------------------------------------------------
// Payload writers (no type codes; types are carried by context)
// ---------------------------------------------------------------------------

fn put_payload(out: &mut Vec<u8>, obj: &Object) {
    match obj {
        Object::Char(c) => out.push(*c),
        Object::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
        Object::Long(l) => put_ascii_number(out, &l.to_string()),
        Object::Str(s) => put_str(out, s.as_deref()),
        Object::Buf(b) => put_buf(out, b.as_deref()),
        Object::Ptr(p) => put_ptr(out, p),
        Object::Time(t) => put_ascii_number(out, &t.to_string()),
        Object::Hashtable(h) => put_hashtable(out, h),
        Object::Hdata(h) => put_hdata(out, h),
        Object::Info(name, value) => {
            put_str(out, name.as_deref());
            put_str(out, value.as_deref());
        }
    }
}

fn put_str(out: &mut Vec<u8>, s: Option<&str>) {
    put_buf(out, s.map(str::as_bytes));
}

fn put_buf(out: &mut Vec<u8>, b: Option<&[u8]>) {
    match b {
        None => out.extend_from_slice(&(-1i32).to_be_bytes()),
        Some(bytes) => {
            out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
    }
}

/// Pointers travel as 1-byte length + hex digits, without the `0x` prefix
/// the in-memory rendering carries. An empty pointer encodes as `"0"`.
fn put_ptr(out: &mut Vec<u8>, p: &str) {
    let hex = p.strip_prefix("0x").unwrap_or(p);
    let hex = if hex.is_empty() { "0" } else { hex };
    out.push(hex.len() as u8);
    out.extend_from_slice(hex.as_bytes());
}

/// `lon` and `tim` payloads: 1-byte length + ASCII decimal digits.
fn put_ascii_number(out: &mut Vec<u8>, digits: &str) {
    out.push(digits.len() as u8);
    out.extend_from_slice(digits.as_bytes());
}

fn put_hashtable(out: &mut Vec<u8>, h: &Hashtable) {
    out.extend_from_slice(h.key_type.code());
    out.extend_from_slice(h.val_type.code());
    out.extend_from_slice(&(h.entries.len() as i32).to_be_bytes());
    for (k, v) in &h.entries {
        put_payload(out, k);
        put_payload(out, v);
    }
}

fn put_hdata(out: &mut Vec<u8>, h: &Hdata) {
    put_str(out, Some(&h.h_path));
    put_str(out, Some(&h.keys_decl()));
    out.extend_from_slice(&(h.items.len() as i32).to_be_bytes());
    for item in &h.items {
        for ptr in &item.pointers {
            put_ptr(out, ptr);
        }
        for value in &item.values {
            put_payload(out, value);
        }
    }
}
