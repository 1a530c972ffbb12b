//! Typed-object model for relay messages.
//!
//! `Hdata` keeps its keys in a declared-order list rather than a map: items
//! on the wire are positional, so the serialization order must match the
//! declaration string byte for byte.

use crate::CodecError;

// ---------------------------------------------------------------------------
// Type codes
// ---------------------------------------------------------------------------

/// The 3-byte ASCII type code of a relay object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    Char,
    Int,
    Long,
    Str,
    Buf,
    Ptr,
    Time,
    Hashtable,
    Hdata,
    Info,
}

impl ObjType {
    /// The wire code for this type.
    pub fn code(self) -> &'static [u8; 3] {
        match self {
            ObjType::Char => b"chr",
            ObjType::Int => b"int",
            ObjType::Long => b"lon",
            ObjType::Str => b"str",
            ObjType::Buf => b"buf",
            ObjType::Ptr => b"ptr",
            ObjType::Time => b"tim",
            ObjType::Hashtable => b"htb",
            ObjType::Hdata => b"hda",
            ObjType::Info => b"inf",
        }
    }

    pub fn from_code(code: &[u8]) -> Result<Self, CodecError> {
        match code {
            b"chr" => Ok(ObjType::Char),
            b"int" => Ok(ObjType::Int),
            b"lon" => Ok(ObjType::Long),
            b"str" => Ok(ObjType::Str),
            b"buf" => Ok(ObjType::Buf),
            b"ptr" => Ok(ObjType::Ptr),
            b"tim" => Ok(ObjType::Time),
            b"htb" => Ok(ObjType::Hashtable),
            b"hda" => Ok(ObjType::Hdata),
            b"inf" => Ok(ObjType::Info),
            other => Err(CodecError::UnknownType(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Parse the short name used in hdata key declarations (`"number:int"`).
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        Self::from_code(name.as_bytes())
    }

    pub fn name(self) -> &'static str {
        // Codes are ASCII by construction.
        std::str::from_utf8(self.code()).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// One typed object in a relay message.
///
/// `Str` and `Buf` distinguish null (`None`, length -1 on the wire) from
/// empty. `Ptr` carries the canonical `0x`-prefixed rendering; the prefix is
/// stripped on encode and restored on decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Char(u8),
    Int(i32),
    Long(i64),
    Str(Option<String>),
    Buf(Option<Vec<u8>>),
    Ptr(String),
    Time(i64),
    Hashtable(Hashtable),
    Hdata(Hdata),
    Info(Option<String>, Option<String>),
}

impl Object {
    pub fn obj_type(&self) -> ObjType {
        match self {
            Object::Char(_) => ObjType::Char,
            Object::Int(_) => ObjType::Int,
            Object::Long(_) => ObjType::Long,
            Object::Str(_) => ObjType::Str,
            Object::Buf(_) => ObjType::Buf,
            Object::Ptr(_) => ObjType::Ptr,
            Object::Time(_) => ObjType::Time,
            Object::Hashtable(_) => ObjType::Hashtable,
            Object::Hdata(_) => ObjType::Hdata,
            Object::Info(_, _) => ObjType::Info,
        }
    }

    /// Convenience for the common non-null string case.
    pub fn str(s: impl Into<String>) -> Object {
        Object::Str(Some(s.into()))
    }
}

/// A typed associative object. Key and value types are homogeneous.
#[derive(Debug, Clone, PartialEq)]
pub struct Hashtable {
    pub key_type: ObjType,
    pub val_type: ObjType,
    pub entries: Vec<(Object, Object)>,
}

impl Hashtable {
    /// A string-to-string hashtable from literal pairs.
    pub fn of_strings(pairs: &[(&str, &str)]) -> Hashtable {
        Hashtable {
            key_type: ObjType::Str,
            val_type: ObjType::Str,
            entries: pairs
                .iter()
                .map(|(k, v)| (Object::str(*k), Object::str(*v)))
                .collect(),
        }
    }
}

/// A tabular object: N items sharing a declared key schema.
///
/// `keys` is ordered; item values are serialized in exactly this order with
/// no per-value tagging.
#[derive(Debug, Clone, PartialEq)]
pub struct Hdata {
    /// The h-path, e.g. `"buffer"` or `"line_data"`. Slash-separated
    /// segments each contribute one pointer per item.
    pub h_path: String,
    pub keys: Vec<(String, ObjType)>,
    pub items: Vec<HdataItem>,
}

/// One hdata row: one pointer per path segment, then one value per key.
#[derive(Debug, Clone, PartialEq)]
pub struct HdataItem {
    pub pointers: Vec<String>,
    pub values: Vec<Object>,
}

impl Hdata {
    pub fn new(h_path: impl Into<String>, keys: Vec<(String, ObjType)>) -> Hdata {
        Hdata {
            h_path: h_path.into(),
            keys,
            items: Vec::new(),
        }
    }

    /// Parse a comma-separated declaration string (`"number:int,name:str"`).
    pub fn parse_keys(decl: &str) -> Result<Vec<(String, ObjType)>, CodecError> {
        decl.split(',')
            .map(|part| {
                let (name, ty) = part
                    .split_once(':')
                    .ok_or_else(|| CodecError::BadKeyDecl(part.to_owned()))?;
                Ok((name.to_owned(), ObjType::from_name(ty)?))
            })
            .collect()
    }

    /// The declaration string for the wire (`"key:type,..."`).
    pub fn keys_decl(&self) -> String {
        self.keys
            .iter()
            .map(|(name, ty)| format!("{}:{}", name, ty.name()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Number of pointers each item carries (one per path segment).
    pub fn path_depth(&self) -> usize {
        self.h_path.split('/').count()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A complete relay message: an ID plus a sequence of objects.
///
/// For replies the ID echoes the caller's correlation id; for
/// server-initiated events it is a well-known event name such as
/// `"_buffer_opened"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub objects: Vec<Object>,
}

impl Message {
    pub fn new(id: impl Into<String>, objects: Vec<Object>) -> Message {
        Message {
            id: id.into(),
            objects,
        }
    }

    /// Serialize to a length-framed wire frame.
    pub fn encode(&self) -> Vec<u8> {
        crate::encode_message(self)
    }

    /// Parse one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
        crate::decode_message(frame)
    }
}
