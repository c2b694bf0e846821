use std::fmt;

#[derive(Clone, Debug)]
pub enum JsValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(JsString),
    Symbol(JsSymbol),
    Object(JsObject),
}

// UTF-16 code unit string
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JsString {
    pub code_units: Vec<u16>,
}

impl JsString {
    pub fn from_str(s: &str) -> Self {
        Self {
            code_units: s.encode_utf16().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code_units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.code_units.len()
    }

    pub fn to_rust_string(&self) -> String {
        String::from_utf16_lossy(&self.code_units)
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rust_string())
    }
}

#[derive(Clone, Debug)]
pub struct JsSymbol {
    pub id: u64,
    pub description: Option<JsString>,
}

impl JsSymbol {
    /// Convert to the internal property key string.
    /// Well-known symbols (description starts with "Symbol.") use a stable format
    /// without id, so intrinsic lookups like "Symbol(Symbol.iterator)" work.
    /// User-created symbols include the unique id to avoid collisions.
    pub fn to_property_key(&self) -> String {
        match &self.description {
            Some(desc) if desc.to_string().starts_with("Symbol.") => {
                format!("Symbol({})", desc)
            }
            Some(desc) => format!("Symbol({})#{}", desc, self.id),
            None => format!("Symbol()#{}", self.id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WellKnownSymbol {
    AsyncIterator,
    Iterator,
    ToStringTag,
}

impl WellKnownSymbol {
    pub fn description(self) -> &'static str {
        match self {
            WellKnownSymbol::AsyncIterator => "Symbol.asyncIterator",
            WellKnownSymbol::Iterator => "Symbol.iterator",
            WellKnownSymbol::ToStringTag => "Symbol.toStringTag",
        }
    }

    pub fn property_key(self) -> String {
        format!("Symbol({})", self.description())
    }
}

/// Handle into the interpreter's object table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JsObject {
    pub id: u64,
}

impl JsValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, JsValue::Object(_))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<JsObject> {
        match self {
            JsValue::Object(o) => Some(*o),
            _ => None,
        }
    }

    pub fn from_str(s: &str) -> Self {
        JsValue::String(JsString::from_str(s))
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Boolean(b)
    }
}

// SameValueZero, for hosts and tests comparing results. Script-level
// equality goes through the interpreter's own comparisons.
impl PartialEq for JsValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Boolean(a), JsValue::Boolean(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Symbol(a), JsValue::Symbol(b)) => a.id == b.id,
            (JsValue::Object(a), JsValue::Object(b)) => a == b,
            _ => false,
        }
    }
}

// Number type operations
pub mod number_ops {
    pub fn exponentiate(base: f64, exp: f64) -> f64 {
        base.powf(exp)
    }

    pub fn left_shift(x: f64, y: f64) -> f64 {
        let lnum = to_int32(x);
        let shift = to_uint32(y) & 0x1F;
        f64::from(lnum.wrapping_shl(shift))
    }

    pub fn signed_right_shift(x: f64, y: f64) -> f64 {
        let lnum = to_int32(x);
        let shift = to_uint32(y) & 0x1F;
        f64::from(lnum.wrapping_shr(shift))
    }

    pub fn unsigned_right_shift(x: f64, y: f64) -> f64 {
        let lnum = to_uint32(x);
        let shift = to_uint32(y) & 0x1F;
        lnum.wrapping_shr(shift) as f64
    }

    pub fn bitwise_not(x: f64) -> f64 {
        f64::from(!to_int32(x))
    }

    pub fn bitwise_and(x: f64, y: f64) -> f64 {
        f64::from(to_int32(x) & to_int32(y))
    }

    pub fn bitwise_xor(x: f64, y: f64) -> f64 {
        f64::from(to_int32(x) ^ to_int32(y))
    }

    pub fn bitwise_or(x: f64, y: f64) -> f64 {
        f64::from(to_int32(x) | to_int32(y))
    }

    pub fn to_string(x: f64) -> String {
        if x.is_nan() {
            return "NaN".to_string();
        }
        if x == 0.0 {
            return "0".to_string();
        }
        if x.is_infinite() {
            return if x > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
        }
        // Use ryu for the shortest round-tripping representation
        let mut buf = ryu_js::Buffer::new();
        buf.format(x).to_string()
    }

    // ToInt32
    pub fn to_int32(x: f64) -> i32 {
        if x.is_nan() || x.is_infinite() || x == 0.0 {
            return 0;
        }
        (x.trunc() as i64 as u32) as i32
    }

    // ToUint32
    pub fn to_uint32(x: f64) -> u32 {
        if x.is_nan() || x.is_infinite() || x == 0.0 {
            return 0;
        }
        x.trunc() as i64 as u32
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::Undefined => write!(f, "undefined"),
            JsValue::Null => write!(f, "null"),
            JsValue::Boolean(b) => write!(f, "{b}"),
            JsValue::Number(n) => write!(f, "{}", number_ops::to_string(*n)),
            JsValue::String(s) => write!(f, "{s}"),
            JsValue::Symbol(s) => {
                if let Some(desc) = &s.description {
                    write!(f, "Symbol({desc})")
                } else {
                    write!(f, "Symbol()")
                }
            }
            JsValue::Object(_) => write!(f, "[object Object]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_special_values() {
        assert_eq!(number_ops::to_string(f64::NAN), "NaN");
        assert_eq!(number_ops::to_string(-0.0), "0");
        assert_eq!(number_ops::to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(number_ops::to_string(42.0), "42");
        assert_eq!(number_ops::to_string(0.5), "0.5");
    }

    #[test]
    fn to_int32_basics() {
        assert_eq!(number_ops::to_int32(f64::NAN), 0);
        assert_eq!(number_ops::to_int32(42.9), 42);
        assert_eq!(number_ops::to_int32(-42.9), -42);
        assert_eq!(number_ops::unsigned_right_shift(-1.0, 0.0), 4294967295.0);
    }

    #[test]
    fn well_known_symbol_keys_are_stable() {
        let sym = JsSymbol {
            id: 7,
            description: Some(JsString::from_str("Symbol.iterator")),
        };
        assert_eq!(sym.to_property_key(), WellKnownSymbol::Iterator.property_key());
        let user = JsSymbol {
            id: 7,
            description: Some(JsString::from_str("tag")),
        };
        assert_eq!(user.to_property_key(), "Symbol(tag)#7");
    }

    #[test]
    fn display_values() {
        assert_eq!(format!("{}", JsValue::Undefined), "undefined");
        assert_eq!(format!("{}", JsValue::Boolean(true)), "true");
        assert_eq!(format!("{}", JsValue::Number(42.0)), "42");
        assert_eq!(format!("{}", JsValue::from_str("hi")), "hi");
    }

    #[test]
    fn host_equality_is_same_value_zero() {
        assert_eq!(JsValue::Number(f64::NAN), JsValue::Number(f64::NAN));
        assert_eq!(JsValue::Number(0.0), JsValue::Number(-0.0));
        assert_ne!(JsValue::Number(1.0), JsValue::from_str("1"));
    }
}
