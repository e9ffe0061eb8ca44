//! `fs`: synchronous filesystem facade confined to one directory

use super::arg_string;
use crate::capabilities::FsPolicy;
use crate::environment::Host;
use boa_engine::object::ObjectInitializer;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction,
};
use boa_gc::{empty_trace, Finalize, Trace};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

type Operation = fn(&Confined, &[JsValue], &mut Context) -> JsResult<JsValue>;

/// The policy plus the host that records refusals
struct Confined {
    policy: FsPolicy,
    host: Rc<Host>,
}

#[derive(Finalize)]
struct FsCapture {
    confined: Rc<Confined>,
    operation: Operation,
}

unsafe impl Trace for FsCapture {
    empty_trace!();
}

pub(crate) fn module(policy: FsPolicy, host: Rc<Host>, context: &mut Context) -> JsObject {
    let confined = Rc::new(Confined { policy, host });
    let operations: [(&str, Operation, usize); 7] = [
        ("readFileSync", read_file, 2),
        ("writeFileSync", write_file, 2),
        ("appendFileSync", append_file, 2),
        ("existsSync", exists, 1),
        ("readdirSync", read_dir, 1),
        ("mkdirSync", make_dir, 2),
        ("unlinkSync", unlink, 1),
    ];

    let mut module = ObjectInitializer::new(context);
    for (name, operation, length) in operations {
        let function = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &FsCapture, ctx| {
                (captures.operation)(&captures.confined, args, ctx)
            },
            FsCapture {
                confined: confined.clone(),
                operation,
            },
        );
        module.function(function, JsString::from(name), length);
    }
    module.build()
}

/// Why a requested path was refused
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Confinement {
    /// Climbs above the root, or resolves (through a link) outside it
    Escapes,
    /// Not a usable path at all
    Invalid,
}

/// Map a sandbox path onto the host filesystem
///
/// Paths are relative to the root; a leading `/` names the root itself.
/// `..` is resolved lexically and may not climb above the root. The deepest
/// existing ancestor is canonicalised and must still lie inside the root.
pub(crate) fn confine(root: &Path, requested: &str) -> Result<PathBuf, Confinement> {
    if requested.is_empty() || requested.contains('\0') {
        return Err(Confinement::Invalid);
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in requested.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop().ok_or(Confinement::Escapes)?;
            }
            other => parts.push(other),
        }
    }
    let path = parts.iter().fold(root.to_path_buf(), |path, part| path.join(part));

    let mut ancestor = Some(path.as_path());
    while let Some(candidate) = ancestor {
        if candidate.exists() {
            let canonical = candidate.canonicalize().map_err(|_| Confinement::Invalid)?;
            if !canonical.starts_with(root) {
                return Err(Confinement::Escapes);
            }
            break;
        }
        ancestor = candidate.parent();
    }
    Ok(path)
}

fn target(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<(String, PathBuf)> {
    let requested = arg_string(args, 0, context)?;
    match confine(&confined.policy.root, &requested) {
        Ok(path) => Ok((requested, path)),
        Err(Confinement::Escapes) => Err(confined.host.refuse(
            &format!("Path '{requested}' escapes the sandbox filesystem root"),
            context,
        )),
        Err(Confinement::Invalid) => Err(JsNativeError::typ()
            .with_message(format!("Invalid path '{requested}'"))
            .into()),
    }
}

fn io_error(operation: &str, requested: &str, err: io::Error) -> JsError {
    JsNativeError::error()
        .with_message(format!("{operation} '{requested}': {err}"))
        .into()
}

fn payload(policy: &FsPolicy, args: &[JsValue], context: &mut Context) -> JsResult<String> {
    let data = arg_string(args, 1, context)?;
    if data.len() > policy.max_write_bytes {
        return Err(JsNativeError::range()
            .with_message(format!(
                "Write of {} bytes exceeds the {} byte limit",
                data.len(),
                policy.max_write_bytes
            ))
            .into());
    }
    Ok(data)
}

fn read_file(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    let bytes = fs::read(&path).map_err(|e| io_error("open", &requested, e))?;
    Ok(JsString::from(String::from_utf8_lossy(&bytes).as_ref()).into())
}

fn write_file(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    let data = payload(&confined.policy, args, context)?;
    fs::write(&path, data).map_err(|e| io_error("open", &requested, e))?;
    Ok(JsValue::undefined())
}

fn append_file(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    let data = payload(&confined.policy, args, context)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(data.as_bytes()))
        .map_err(|e| io_error("open", &requested, e))?;
    Ok(JsValue::undefined())
}

fn exists(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let requested = arg_string(args, 0, context)?;
    let found = confine(&confined.policy.root, &requested)
        .map(|path| path.exists())
        .unwrap_or(false);
    Ok(JsValue::from(found))
}

fn read_dir(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    let mut names = fs::read_dir(&path)
        .and_then(|entries| {
            entries
                .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
                .collect::<io::Result<Vec<_>>>()
        })
        .map_err(|e| io_error("scandir", &requested, e))?;
    names.sort();
    JsValue::from_json(&serde_json::json!(names), context)
}

fn make_dir(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    let recursive = match args.get(1).and_then(|options| options.as_object().map(|o| o.clone())) {
        Some(options) => options.get(js_string!("recursive"), context)?.to_boolean(),
        None => false,
    };
    let created = if recursive {
        fs::create_dir_all(&path)
    } else {
        fs::create_dir(&path)
    };
    created.map_err(|e| io_error("mkdir", &requested, e))?;
    Ok(JsValue::undefined())
}

fn unlink(confined: &Confined, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (requested, path) = target(confined, args, context)?;
    fs::remove_file(&path).map_err(|e| io_error("unlink", &requested, e))?;
    Ok(JsValue::undefined())
}
