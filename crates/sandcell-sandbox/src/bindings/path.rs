//! `path`: POSIX path utilities
//!
//! Pure string manipulation; nothing here touches the filesystem. The
//! working directory for `resolve` is `/`.

use super::arg_string;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsObject, JsResult, JsString, JsValue, NativeFunction};

pub(crate) fn module(context: &mut Context) -> JsObject {
    ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(js_join), js_string!("join"), 0)
        .function(NativeFunction::from_fn_ptr(js_normalize), js_string!("normalize"), 1)
        .function(NativeFunction::from_fn_ptr(js_resolve), js_string!("resolve"), 0)
        .function(NativeFunction::from_fn_ptr(js_basename), js_string!("basename"), 2)
        .function(NativeFunction::from_fn_ptr(js_dirname), js_string!("dirname"), 1)
        .function(NativeFunction::from_fn_ptr(js_extname), js_string!("extname"), 1)
        .function(NativeFunction::from_fn_ptr(js_is_absolute), js_string!("isAbsolute"), 1)
        .property(js_string!("sep"), js_string!("/"), Attribute::all())
        .property(js_string!("delimiter"), js_string!(":"), Attribute::all())
        .build()
}

fn all_strings(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    (0..args.len())
        .map(|index| arg_string(args, index, context))
        .collect()
}

fn string_value(value: String) -> JsResult<JsValue> {
    Ok(JsString::from(value.as_str()).into())
}

fn js_join(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    string_value(join(&all_strings(args, context)?))
}

fn js_normalize(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    string_value(normalize(&arg_string(args, 0, context)?))
}

fn js_resolve(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    string_value(resolve(&all_strings(args, context)?))
}

fn js_basename(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = arg_string(args, 0, context)?;
    let ext = match args.get(1) {
        Some(ext) if !ext.is_undefined() => Some(arg_string(args, 1, context)?),
        _ => None,
    };
    string_value(basename(&path, ext.as_deref()))
}

fn js_dirname(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    string_value(dirname(&arg_string(args, 0, context)?))
}

fn js_extname(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    string_value(extname(&arg_string(args, 0, context)?))
}

fn js_is_absolute(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(arg_string(args, 0, context)?.starts_with('/')))
}

pub(crate) fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last().copied() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let mut normalized = parts.join("/");
    if normalized.is_empty() && !absolute {
        normalized.push('.');
    }
    if trailing && !normalized.is_empty() && normalized != "." {
        normalized.push('/');
    }
    if absolute {
        normalized.insert(0, '/');
    }
    normalized
}

pub(crate) fn join(segments: &[String]) -> String {
    let joined = segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("/");
    normalize(&joined)
}

pub(crate) fn resolve(segments: &[String]) -> String {
    let mut resolved = String::new();
    for segment in segments.iter().rev() {
        if segment.is_empty() {
            continue;
        }
        resolved = if resolved.is_empty() {
            segment.clone()
        } else {
            format!("{segment}/{resolved}")
        };
        if segment.starts_with('/') {
            break;
        }
    }
    if !resolved.starts_with('/') {
        resolved.insert(0, '/');
    }
    let normalized = normalize(&resolved);
    match normalized.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => normalized,
    }
}

pub(crate) fn basename(path: &str, ext: Option<&str>) -> String {
    let trimmed = path.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or("");
    match ext {
        Some(ext) if !ext.is_empty() && base != ext => {
            base.strip_suffix(ext).unwrap_or(base).to_string()
        }
        _ => base.to_string(),
    }
}

pub(crate) fn dirname(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(index) => {
            let parent = trimmed[..index].trim_end_matches('/');
            if parent.is_empty() && absolute {
                "/".to_string()
            } else {
                parent.to_string()
            }
        }
        None => ".".to_string(),
    }
}

pub(crate) fn extname(path: &str) -> String {
    let base = basename(path, None);
    match base.rfind('.') {
        Some(0) | None => String::new(),
        Some(index) => base[index..].to_string(),
    }
}
