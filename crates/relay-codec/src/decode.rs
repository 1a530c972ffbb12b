//! Relay message decoder.
//!
//! Mirror of the encoder; used by the test suites and by any peer that
//! consumes relay frames. Input is one complete frame including the length
//! prefix.

use crate::CodecError;
use crate::object::{Hashtable, Hdata, HdataItem, Message, ObjType, Object};

/// Parse one complete frame into a message.
pub fn decode_message(frame: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(frame);
    let declared = r.take_i32()? as usize;
    if declared != frame.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }
    let flag = r.take_u8()?;
    if flag != 0 {
        return Err(CodecError::Compressed(flag));
    }

    let id = r.take_str()?.unwrap_or_default();
    let mut objects = Vec::new();
    while !r.is_empty() {
        let ty = ObjType::from_code(r.take_bytes(3)?)?;
        objects.push(r.take_payload(ty)?);
    }
    Ok(Message { id, objects })
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated { needed: n })?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                needed: end - self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_str(&mut self) -> Result<Option<String>, CodecError> {
        match self.take_buf()? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CodecError::Utf8 { context: "string" }),
        }
    }

    fn take_buf(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let len = self.take_i32()?;
        match len {
            -1 => Ok(None),
            n if n >= 0 => Ok(Some(self.take_bytes(n as usize)?.to_vec())),
            n => Err(CodecError::InvalidLength(n)),
        }
    }

    fn take_ptr(&mut self) -> Result<String, CodecError> {
        let len = self.take_u8()? as usize;
        let hex = std::str::from_utf8(self.take_bytes(len)?)
            .map_err(|_| CodecError::Utf8 { context: "pointer" })?;
        Ok(format!("0x{hex}"))
    }

    fn take_ascii_number(&mut self, context: &'static str) -> Result<i64, CodecError> {
        let len = self.take_u8()? as usize;
        let digits = std::str::from_utf8(self.take_bytes(len)?)
            .map_err(|_| CodecError::Utf8 { context })?;
        digits
            .parse::<i64>()
            .map_err(|_| CodecError::BadNumber { context })
    }

    fn take_payload(&mut self, ty: ObjType) -> Result<Object, CodecError> {
        Ok(match ty {
            ObjType::Char => Object::Char(self.take_u8()?),
            ObjType::Int => Object::Int(self.take_i32()?),
            ObjType::Long => Object::Long(self.take_ascii_number("long")?),
            ObjType::Str => Object::Str(self.take_str()?),
            ObjType::Buf => Object::Buf(self.take_buf()?),
            ObjType::Ptr => Object::Ptr(self.take_ptr()?),
            ObjType::Time => Object::Time(self.take_ascii_number("time")?),
            ObjType::Hashtable => Object::Hashtable(self.take_hashtable()?),
            ObjType::Hdata => Object::Hdata(self.take_hdata()?),
            ObjType::Info => Object::Info(self.take_str()?, self.take_str()?),
        })
    }

    fn take_hashtable(&mut self) -> Result<Hashtable, CodecError> {
        let key_type = ObjType::from_code(self.take_bytes(3)?)?;
        let val_type = ObjType::from_code(self.take_bytes(3)?)?;
        let count = self.take_i32()?;
        if count < 0 {
            return Err(CodecError::InvalidLength(count));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let k = self.take_payload(key_type)?;
            let v = self.take_payload(val_type)?;
            entries.push((k, v));
        }
        Ok(Hashtable {
            key_type,
            val_type,
            entries,
        })
    }

    fn take_hdata(&mut self) -> Result<Hdata, CodecError> {
        let h_path = self.take_str()?.unwrap_or_default();
        let decl = self.take_str()?.unwrap_or_default();
        let keys = if decl.is_empty() {
            Vec::new()
        } else {
            Hdata::parse_keys(&decl)?
        };
        let count = self.take_i32()?;
        if count < 0 {
            return Err(CodecError::InvalidLength(count));
        }
        let depth = h_path.split('/').count();
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut pointers = Vec::with_capacity(depth);
            for _ in 0..depth {
                pointers.push(self.take_ptr()?);
            }
            let mut values = Vec::with_capacity(keys.len());
            for (_, ty) in &keys {
                values.push(self.take_payload(*ty)?);
            }
            items.push(HdataItem { pointers, values });
        }
        Ok(Hdata {
            h_path,
            keys,
            items,
        })
    }
}
