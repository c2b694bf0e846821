use super::*;

// ToBoolean
pub(crate) fn to_boolean(val: &JsValue) -> bool {
    match val {
        JsValue::Undefined | JsValue::Null => false,
        JsValue::Boolean(b) => *b,
        JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
        JsValue::String(s) => !s.is_empty(),
        JsValue::Symbol(_) | JsValue::Object(_) => true,
    }
}

// ToNumber
pub(crate) fn to_number(val: &JsValue) -> f64 {
    match val {
        JsValue::Undefined => f64::NAN,
        JsValue::Null => 0.0,
        JsValue::Boolean(b) => *b as u8 as f64,
        JsValue::Number(n) => *n,
        JsValue::String(s) => string_to_number(s),
        _ => f64::NAN,
    }
}

fn string_to_number(s: &JsString) -> f64 {
    let rust_str = s.to_rust_string();
    let trimmed = rust_str.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

pub(crate) fn to_js_string(val: &JsValue) -> String {
    format!("{val}")
}

pub(crate) fn is_string(val: &JsValue) -> bool {
    matches!(val, JsValue::String(_))
}

pub(crate) fn strict_equality(left: &JsValue, right: &JsValue) -> bool {
    match (left, right) {
        (JsValue::Undefined, JsValue::Undefined) => true,
        (JsValue::Null, JsValue::Null) => true,
        (JsValue::Boolean(a), JsValue::Boolean(b)) => a == b,
        (JsValue::Number(a), JsValue::Number(b)) => a == b,
        (JsValue::String(a), JsValue::String(b)) => a == b,
        (JsValue::Symbol(a), JsValue::Symbol(b)) => a.id == b.id,
        (JsValue::Object(a), JsValue::Object(b)) => a.id == b.id,
        _ => false,
    }
}

pub(crate) fn abstract_equality(left: &JsValue, right: &JsValue) -> bool {
    // Same type
    if std::mem::discriminant(left) == std::mem::discriminant(right) {
        return strict_equality(left, right);
    }
    match (left, right) {
        (JsValue::Null, JsValue::Undefined) | (JsValue::Undefined, JsValue::Null) => true,
        (JsValue::Number(_), JsValue::String(_)) => {
            abstract_equality(left, &JsValue::Number(to_number(right)))
        }
        (JsValue::String(_), JsValue::Number(_)) => {
            abstract_equality(&JsValue::Number(to_number(left)), right)
        }
        (JsValue::Boolean(_), _) => abstract_equality(&JsValue::Number(to_number(left)), right),
        (_, JsValue::Boolean(_)) => abstract_equality(left, &JsValue::Number(to_number(right))),
        _ => false,
    }
}

/// `left < right`; `None` when either side is NaN.
pub(crate) fn abstract_relational(left: &JsValue, right: &JsValue) -> Option<bool> {
    if is_string(left) && is_string(right) {
        let ls = to_js_string(left);
        let rs = to_js_string(right);
        return Some(ls < rs);
    }
    let ln = to_number(left);
    let rn = to_number(right);
    if ln.is_nan() || rn.is_nan() {
        return None;
    }
    Some(ln < rn)
}

pub(crate) fn typeof_val<'a>(
    val: &JsValue,
    objects: &[Option<Rc<RefCell<JsObjectData>>>],
) -> &'a str {
    match val {
        JsValue::Undefined => "undefined",
        JsValue::Null => "object",
        JsValue::Boolean(_) => "boolean",
        JsValue::Number(_) => "number",
        JsValue::String(_) => "string",
        JsValue::Symbol(_) => "symbol",
        JsValue::Object(o) => {
            if let Some(Some(obj)) = objects.get(o.id as usize)
                && obj.borrow().callable.is_some()
            {
                return "function";
            }
            "object"
        }
    }
}

/// Property key for a computed member access.
pub(crate) fn to_property_key(val: &JsValue) -> String {
    match val {
        JsValue::Symbol(s) => s.to_property_key(),
        other => to_js_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!to_boolean(&JsValue::Number(f64::NAN)));
        assert!(!to_boolean(&JsValue::from_str("")));
        assert!(to_boolean(&JsValue::from_str("0")));
        assert!(to_boolean(&JsValue::Object(crate::types::JsObject { id: 0 })));
    }

    #[test]
    fn numeric_conversion() {
        assert_eq!(to_number(&JsValue::from_str(" 42 ")), 42.0);
        assert_eq!(to_number(&JsValue::from_str("0x10")), 16.0);
        assert!(to_number(&JsValue::from_str("abc")).is_nan());
        assert_eq!(to_number(&JsValue::Boolean(true)), 1.0);
    }

    #[test]
    fn equality() {
        assert!(abstract_equality(&JsValue::Null, &JsValue::Undefined));
        assert!(abstract_equality(&JsValue::Number(1.0), &JsValue::from_str("1")));
        assert!(!strict_equality(&JsValue::Number(1.0), &JsValue::from_str("1")));
        assert!(!strict_equality(&JsValue::Number(f64::NAN), &JsValue::Number(f64::NAN)));
        assert_eq!(abstract_relational(&JsValue::Number(1.0), &JsValue::Number(2.0)), Some(true));
        assert_eq!(abstract_relational(&JsValue::Number(f64::NAN), &JsValue::Number(2.0)), None);
    }
}
