//! Dynamically typed property values and their bus variant encoding.

use dbus::arg::{RefArg, Variant};

/// The value kinds a property (or a data getter) can carry. Serialized to
/// the bus's variant encoding when answering property queries, building the
/// managed-objects snapshot, or emitting change signals.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Text(String),
    Path(String),
    Bytes(Vec<u8>),
    TextList(Vec<String>),
}

impl DataValue {
    /// D-Bus type signature of the value.
    pub fn signature(&self) -> &'static str {
        match self {
            DataValue::Boolean(_) => "b",
            DataValue::Int16(_) => "n",
            DataValue::Uint16(_) => "q",
            DataValue::Int32(_) => "i",
            DataValue::Uint32(_) => "u",
            DataValue::Int64(_) => "x",
            DataValue::Uint64(_) => "t",
            DataValue::Double(_) => "d",
            DataValue::Text(_) => "s",
            DataValue::Path(_) => "o",
            DataValue::Bytes(_) => "ay",
            DataValue::TextList(_) => "as",
        }
    }

    /// Box the value for appending as a variant.
    pub(crate) fn to_arg(&self) -> Box<dyn RefArg> {
        match self {
            DataValue::Boolean(v) => Box::new(*v),
            DataValue::Int16(v) => Box::new(*v),
            DataValue::Uint16(v) => Box::new(*v),
            DataValue::Int32(v) => Box::new(*v),
            DataValue::Uint32(v) => Box::new(*v),
            DataValue::Int64(v) => Box::new(*v),
            DataValue::Uint64(v) => Box::new(*v),
            DataValue::Double(v) => Box::new(*v),
            DataValue::Text(v) => Box::new(v.clone()),
            DataValue::Path(v) => Box::new(dbus::Path::from(v.clone())),
            DataValue::Bytes(v) => Box::new(v.clone()),
            DataValue::TextList(v) => Box::new(v.clone()),
        }
    }

    /// Wrap as the variant type used inside `a{sv}` maps.
    pub(crate) fn to_variant(&self) -> Variant<Box<dyn RefArg>> {
        Variant(self.to_arg())
    }

    /// Best-effort decode of an inbound variant (property set, write
    /// options). Returns `None` for shapes the data model does not carry.
    pub(crate) fn from_ref_arg(arg: &dyn RefArg) -> Option<DataValue> {
        use dbus::arg::ArgType;

        match arg.arg_type() {
            ArgType::Boolean => arg.as_u64().map(|v| DataValue::Boolean(v != 0)),
            ArgType::Int16 => arg.as_i64().map(|v| DataValue::Int16(v as i16)),
            ArgType::UInt16 => arg.as_u64().map(|v| DataValue::Uint16(v as u16)),
            ArgType::Int32 => arg.as_i64().map(|v| DataValue::Int32(v as i32)),
            ArgType::UInt32 => arg.as_u64().map(|v| DataValue::Uint32(v as u32)),
            ArgType::Int64 => arg.as_i64().map(DataValue::Int64),
            ArgType::UInt64 => arg.as_u64().map(DataValue::Uint64),
            ArgType::Double => arg.as_f64().map(DataValue::Double),
            ArgType::String => arg.as_str().map(|s| DataValue::Text(s.to_string())),
            ArgType::ObjectPath => arg.as_str().map(|s| DataValue::Path(s.to_string())),
            ArgType::Byte => arg.as_u64().map(|v| DataValue::Bytes(vec![v as u8])),
            ArgType::Array => {
                let mut bytes = Vec::new();
                let mut strings = Vec::new();
                let mut all_bytes = true;
                let mut all_strings = true;
                if let Some(items) = arg.as_iter() {
                    for item in items {
                        match (item.as_u64(), item.as_str()) {
                            (Some(b), None) if b <= u8::MAX as u64 => {
                                all_strings = false;
                                bytes.push(b as u8);
                            }
                            (None, Some(s)) => {
                                all_bytes = false;
                                strings.push(s.to_string());
                            }
                            _ => return None,
                        }
                    }
                }
                if all_bytes {
                    Some(DataValue::Bytes(bytes))
                } else if all_strings {
                    Some(DataValue::TextList(strings))
                } else {
                    None
                }
            }
            ArgType::Variant => {
                // Unwrap one level of nesting.
                let mut inner = arg.as_iter()?;
                inner.next().and_then(DataValue::from_ref_arg)
            }
            _ => None,
        }
    }

    /// The value as raw bytes, the way `ReadValue` replies want it.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            DataValue::Bytes(v) => v.clone(),
            DataValue::Text(v) | DataValue::Path(v) => v.as_bytes().to_vec(),
            DataValue::Boolean(v) => vec![*v as u8],
            DataValue::Int16(v) => v.to_le_bytes().to_vec(),
            DataValue::Uint16(v) => v.to_le_bytes().to_vec(),
            DataValue::Int32(v) => v.to_le_bytes().to_vec(),
            DataValue::Uint32(v) => v.to_le_bytes().to_vec(),
            DataValue::Int64(v) => v.to_le_bytes().to_vec(),
            DataValue::Uint64(v) => v.to_le_bytes().to_vec(),
            DataValue::Double(v) => v.to_le_bytes().to_vec(),
            DataValue::TextList(v) => v.join("\n").into_bytes(),
        }
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> DataValue {
        DataValue::Text(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> DataValue {
        DataValue::Text(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> DataValue {
        DataValue::Boolean(v)
    }
}

impl From<Vec<u8>> for DataValue {
    fn from(v: Vec<u8>) -> DataValue {
        DataValue::Bytes(v)
    }
}

impl From<Vec<String>> for DataValue {
    fn from(v: Vec<String>) -> DataValue {
        DataValue::TextList(v)
    }
}
