//! `uuid`: random identifiers

use boa_engine::object::ObjectInitializer;
use boa_engine::{js_string, Context, JsObject, JsResult, JsString, JsValue, NativeFunction};

pub(crate) fn module(context: &mut Context) -> JsObject {
    ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(v4), js_string!("v4"), 0)
        .build()
}

fn v4(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    let id = ::uuid::Uuid::new_v4().to_string();
    Ok(JsString::from(id.as_str()).into())
}
