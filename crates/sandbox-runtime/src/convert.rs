//! JSON ⇄ QuickJS value conversion.
//!
//! Call arguments arrive as `serde_json::Value` and results leave the same
//! way; nothing engine-specific ever crosses the sandbox boundary. Functions
//! and other non-data values serialize to `null`, mirroring what
//! `JSON.stringify` would drop.

use rquickjs::{Array, Ctx, Object, Value};
use serde_json::{Map, Number, Value as JsonValue};

/// Converts a JSON value into a QuickJS value inside `ctx`.
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &JsonValue) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        JsonValue::Null => Value::new_null(ctx.clone()),
        JsonValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Value::new_int(ctx.clone(), small)
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    Value::new_float(ctx.clone(), i as f64)
                }
            } else {
                Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into(),
        JsonValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, json_to_js(ctx, item)?)?;
            }
            array.into()
        }
        JsonValue::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            object.into()
        }
    })
}

/// Converts a QuickJS value into JSON.
///
/// `undefined`, functions, and non-finite numbers become `null`.
pub(crate) fn js_to_json(value: &Value<'_>) -> rquickjs::Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(JsonValue::Number(Number::from(i)));
    }
    if let Some(f) = value.as_float() {
        return Ok(Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number));
    }
    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_string()?));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            items.push(js_to_json(&item?)?);
        }
        return Ok(JsonValue::Array(items));
    }
    if value.is_function() {
        return Ok(JsonValue::Null);
    }
    if let Some(object) = value.as_object() {
        let mut map = Map::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop?;
            map.insert(key, js_to_json(&item)?);
        }
        return Ok(JsonValue::Object(map));
    }
    Ok(JsonValue::Null)
}
