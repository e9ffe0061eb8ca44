//! JavaScript value -> JSON conversion
//!
//! Follows `JSON.stringify`: `toJSON` is honoured, functions, symbols and
//! `undefined` vanish from objects and become `null` in arrays, non-finite
//! numbers become `null`. On top of that:
//!
//! - denylisted field names are dropped at every depth
//! - a reference back to an ancestor is dropped (`null` in arrays)
//! - nesting past `max_depth` is cut to `null`
//! - output is bounded by a byte budget, so a huge value fails fast

use crate::environment::Intrinsics;
use boa_engine::{js_string, Context, JsError, JsObject, JsString, JsValue};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy)]
pub(crate) struct SerializeOptions<'a> {
    pub denylist: &'a [String],
    pub max_depth: usize,
    /// Approximate ceiling on the serialized size, in bytes
    pub budget: usize,
}

#[derive(Debug)]
pub(crate) enum SerializeError {
    /// A `toJSON` method or getter threw
    Js(JsError),
    /// The value is larger than the budget
    TooLarge,
}

impl From<JsError> for SerializeError {
    fn from(err: JsError) -> Self {
        SerializeError::Js(err)
    }
}

/// Convert a value as `JSON.stringify` would. A value that serializes to
/// nothing at the top level (`undefined`, a function) becomes `null`.
pub(crate) fn to_json(
    value: &JsValue,
    intrinsics: &Intrinsics,
    options: SerializeOptions<'_>,
    context: &mut Context,
) -> Result<Value, SerializeError> {
    let mut writer = JsonWriter {
        options,
        intrinsics,
        ancestors: Vec::new(),
        remaining: options.budget,
    };
    Ok(writer.write("", value, 0, context)?.unwrap_or(Value::Null))
}

struct JsonWriter<'a> {
    options: SerializeOptions<'a>,
    intrinsics: &'a Intrinsics,
    ancestors: Vec<JsObject>,
    remaining: usize,
}

impl JsonWriter<'_> {
    fn charge(&mut self, bytes: usize) -> Result<(), SerializeError> {
        self.remaining = self
            .remaining
            .checked_sub(bytes)
            .ok_or(SerializeError::TooLarge)?;
        Ok(())
    }

    /// `None` means "omit": the value has no JSON form
    fn write(
        &mut self,
        key: &str,
        value: &JsValue,
        depth: usize,
        context: &mut Context,
    ) -> Result<Option<Value>, SerializeError> {
        let value = self.apply_to_json(key, value, context)?;

        if value.is_null() {
            self.charge(4)?;
            return Ok(Some(Value::Null));
        }
        if value.is_undefined() || value.is_symbol() {
            return Ok(None);
        }
        if let Some(flag) = value.as_boolean() {
            self.charge(5)?;
            return Ok(Some(Value::Bool(flag)));
        }
        if let Some(number) = value.as_number() {
            self.charge(8)?;
            return Ok(Some(number_to_json(number)));
        }
        if let Some(string) = value.as_string() {
            let string = string.to_std_string_escaped();
            self.charge(string.len() + 2)?;
            return Ok(Some(Value::String(string)));
        }
        if value.is_bigint() {
            let digits = value.to_string(context)?.to_std_string_escaped();
            self.charge(digits.len() + 2)?;
            return Ok(Some(Value::String(digits)));
        }

        let Some(object) = value.as_object().map(|object| object.clone()) else {
            return Ok(None);
        };
        if object.is_callable() {
            return Ok(None);
        }
        if self
            .ancestors
            .iter()
            .any(|ancestor| JsObject::equals(ancestor, &object))
        {
            return Ok(None);
        }
        if depth >= self.options.max_depth {
            self.charge(4)?;
            return Ok(Some(Value::Null));
        }

        self.ancestors.push(object.clone());
        let written = if self.is_array(&value, context)? {
            self.write_array(&object, depth, context)
        } else {
            self.write_object(&object, depth, context)
        };
        self.ancestors.pop();
        written.map(Some)
    }

    fn apply_to_json(
        &mut self,
        key: &str,
        value: &JsValue,
        context: &mut Context,
    ) -> Result<JsValue, SerializeError> {
        let Some(object) = value.as_object().map(|object| object.clone()) else {
            return Ok(value.clone());
        };
        let method = object.get(js_string!("toJSON"), context)?;
        match method.as_object().map(|method| method.clone()) {
            Some(method) if method.is_callable() => {
                Ok(method.call(value, &[JsString::from(key).into()], context)?)
            }
            _ => Ok(value.clone()),
        }
    }

    fn is_array(&self, value: &JsValue, context: &mut Context) -> Result<bool, SerializeError> {
        let answer = self
            .intrinsics
            .is_array
            .call(&JsValue::undefined(), &[value.clone()], context)?;
        Ok(answer.to_boolean())
    }

    fn write_array(
        &mut self,
        array: &JsObject,
        depth: usize,
        context: &mut Context,
    ) -> Result<Value, SerializeError> {
        let length = array.get(js_string!("length"), context)?.to_length(context)?;
        self.charge(2)?;
        let mut items = Vec::new();
        for index in 0..length {
            self.charge(1)?;
            let index = u32::try_from(index).map_err(|_| SerializeError::TooLarge)?;
            let item = array.get(index, context)?;
            let item = self
                .write(&index.to_string(), &item, depth + 1, context)?
                .unwrap_or(Value::Null);
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn write_object(
        &mut self,
        object: &JsObject,
        depth: usize,
        context: &mut Context,
    ) -> Result<Value, SerializeError> {
        let keys = self
            .intrinsics
            .keys
            .call(&JsValue::undefined(), &[object.clone().into()], context)?;
        let keys = keys.as_object().map(|keys| keys.clone());
        let count = match &keys {
            Some(keys) => keys.get(js_string!("length"), context)?.to_length(context)?,
            None => 0,
        };

        self.charge(2)?;
        let mut map = Map::new();
        for index in 0..count {
            let Some(keys) = &keys else { break };
            let index = u32::try_from(index).map_err(|_| SerializeError::TooLarge)?;
            let key = keys
                .get(index, context)?
                .to_string(context)?
                .to_std_string_escaped();
            if self.options.denylist.iter().any(|denied| *denied == key) {
                continue;
            }
            let value = object.get(JsString::from(key.as_str()), context)?;
            if let Some(value) = self.write(&key, &value, depth + 1, context)? {
                self.charge(key.len() + 4)?;
                map.insert(key, value);
            }
        }
        Ok(Value::Object(map))
    }
}

fn number_to_json(number: f64) -> Value {
    if !number.is_finite() {
        return Value::Null;
    }
    if number.fract() == 0.0 && number.abs() < 9_007_199_254_740_992.0 {
        // -0 prints as 0, as JSON.stringify does
        return Value::Number(Number::from(number as i64));
    }
    Number::from_f64(number).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Intrinsics;
    use boa_engine::Source;

    fn convert(source: &str, denylist: &[&str], max_depth: usize) -> Value {
        let mut context = Context::default();
        let intrinsics = Intrinsics::capture(&mut context).unwrap();
        let value = context.eval(Source::from_bytes(source)).unwrap();
        let denylist: Vec<String> = denylist.iter().map(|s| s.to_string()).collect();
        let options = SerializeOptions {
            denylist: &denylist,
            max_depth,
            budget: 1024 * 1024,
        };
        to_json(&value, &intrinsics, options, &mut context).unwrap()
    }

    #[test]
    fn test_primitives() {
        assert_eq!(convert("2", &[], 8), serde_json::json!(2));
        assert_eq!(convert("1.5", &[], 8), serde_json::json!(1.5));
        assert_eq!(convert("'hi'", &[], 8), serde_json::json!("hi"));
        assert_eq!(convert("true", &[], 8), serde_json::json!(true));
        assert_eq!(convert("null", &[], 8), Value::Null);
        assert_eq!(convert("undefined", &[], 8), Value::Null);
        assert_eq!(convert("NaN", &[], 8), Value::Null);
        assert_eq!(convert("10n ** 20n", &[], 8), serde_json::json!("100000000000000000000"));
    }

    #[test]
    fn test_object_keeps_property_order() {
        let value = convert("({ b: 1, a: 2, c: [1, 'x'] })", &[], 8);
        assert_eq!(value.to_string(), r#"{"b":1,"a":2,"c":[1,"x"]}"#);
    }

    #[test]
    fn test_functions_and_undefined() {
        let value = convert("({ f() {}, u: undefined, list: [undefined, () => 1] })", &[], 8);
        assert_eq!(value, serde_json::json!({ "list": [null, null] }));
    }

    #[test]
    fn test_cycle_is_dropped() {
        let value = convert("const o = { name: 'x' }; o.self = o; o.list = [o, 1]; o", &[], 8);
        assert_eq!(value, serde_json::json!({ "name": "x", "list": [null, 1] }));
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        let value = convert("const s = { v: 1 }; ({ a: s, b: s })", &[], 8);
        assert_eq!(value, serde_json::json!({ "a": { "v": 1 }, "b": { "v": 1 } }));
    }

    #[test]
    fn test_denylist_at_every_depth() {
        let value = convert(
            "({ config: 1, data: { request: 2, keep: 3 } })",
            &["config", "request"],
            8,
        );
        assert_eq!(value, serde_json::json!({ "data": { "keep": 3 } }));
    }

    #[test]
    fn test_to_json_is_honoured() {
        let value = convert("({ when: { toJSON() { return 'later'; } } })", &[], 8);
        assert_eq!(value, serde_json::json!({ "when": "later" }));
    }

    #[test]
    fn test_depth_limit() {
        let value = convert("({ a: { b: { c: 1 } } })", &[], 2);
        assert_eq!(value, serde_json::json!({ "a": { "b": null } }));
    }

    #[test]
    fn test_budget_exceeded() {
        let mut context = Context::default();
        let intrinsics = Intrinsics::capture(&mut context).unwrap();
        let value = context
            .eval(Source::from_bytes("'x'.repeat(100)"))
            .unwrap();
        let options = SerializeOptions {
            denylist: &[],
            max_depth: 8,
            budget: 16,
        };
        assert!(matches!(
            to_json(&value, &intrinsics, options, &mut context),
            Err(SerializeError::TooLarge)
        ));
    }

    #[test]
    fn test_number_conversion() {
        assert_eq!(number_to_json(-0.0), serde_json::json!(0));
        assert_eq!(number_to_json(f64::INFINITY), Value::Null);
        assert_eq!(number_to_json(3.0).to_string(), "3");
    }
}
