//! Modules installed in every normal isolate.

use super::{Isolate, ModuleLoader, NativeFn, NativeReturn, Request, Value};
use crate::runtime::ChannelKind;

pub const PLEXUS_MODULE: &str = "plexus";
pub const COROUTINE_MODULE: &str = "coroutine";
pub const HANDLE_MODULE: &str = "handle";

/// Loaders run on every isolate the runtime creates, in order.
pub fn standard_loaders() -> Vec<ModuleLoader> {
    vec![open_base, open_plexus, open_coroutine, open_handle]
}

pub fn open_standard(isolate: &mut Isolate) -> Result<(), String> {
    for loader in standard_loaders() {
        loader(isolate)?;
    }
    Ok(())
}

pub fn number_to_string(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::Num(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 => format!("{:.1}", n),
        Value::Num(n) if n.is_nan() => "nan".to_string(),
        Value::Num(n) if n.is_infinite() => (if *n > 0.0 { "inf" } else { "-inf" }).to_string(),
        Value::Num(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

/// Printable form of any value.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(_) | Value::Num(_) => number_to_string(value),
        Value::Str(s) => s.to_string(),
        Value::Table(r) => format!("table: 0x{:08x}", r.raw()),
        Value::Function(r) => format!("function: 0x{:08x}", r.raw()),
        Value::Native(n) => format!("function: builtin: {}", n.name),
        Value::Handle(r) => format!("handle: 0x{:08x}", r.raw()),
        Value::Thread(r) => format!("thread: 0x{:08x}", r.raw()),
    }
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}

fn check_str(args: &[Value], i: usize, fname: &str) -> Result<String, String> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(v @ (Value::Int(_) | Value::Num(_))) => Ok(number_to_string(v)),
        other => Err(format!(
            "bad argument #{} to '{}' (string expected, got {})",
            i + 1,
            fname,
            other.map(Value::type_name).unwrap_or("no value")
        )),
    }
}

fn check_int(args: &[Value], i: usize, fname: &str) -> Result<i64, String> {
    args.get(i).and_then(Value::as_int).ok_or_else(|| {
        format!(
            "bad argument #{} to '{}' (integer expected, got {})",
            i + 1,
            fname,
            args.get(i).map(Value::type_name).unwrap_or("no value")
        )
    })
}

fn check_handle(args: &[Value], i: usize, fname: &str) -> Result<super::ObjRef, String> {
    match args.get(i) {
        Some(Value::Handle(h)) => Ok(*h),
        other => Err(format!(
            "bad argument #{} to '{}' (handle expected, got {})",
            i + 1,
            fname,
            other.map(Value::type_name).unwrap_or("no value")
        )),
    }
}

// === base ===

pub fn open_base(isolate: &mut Isolate) -> Result<(), String> {
    let base: [(&'static str, NativeFn); 5] = [
        ("print", base_print),
        ("type", base_type),
        ("tostring", base_tostring),
        ("error", base_error),
        ("select", base_select),
    ];
    for (name, func) in base {
        isolate.set_global(name, Value::Native(super::Native::new(name, func)))?;
    }
    Ok(())
}

fn base_print(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
    log::info!(target: "plexus::print", "{}", line);
    Ok(NativeReturn::none())
}

fn base_type(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let value = args.first().ok_or("bad argument #1 to 'type' (value expected)")?;
    Ok(NativeReturn::one(Value::string(value.type_name())))
}

fn base_tostring(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    Ok(NativeReturn::one(Value::from(display_value(&arg(&args, 0)))))
}

fn base_error(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    Err(display_value(&arg(&args, 0)))
}

fn base_select(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let rest = args.len().saturating_sub(1) as i64;
    if arg(&args, 0).as_str() == Some("#") {
        return Ok(NativeReturn::one(Value::Int(rest)));
    }
    let n = check_int(&args, 0, "select")?;
    let start = match n {
        n if n < 0 && -n <= rest => rest + n + 1,
        n if n > 0 => n.min(rest + 1),
        _ => return Err("bad argument #1 to 'select' (index out of range)".to_string()),
    };
    Ok(NativeReturn::Values(args.into_iter().skip(start as usize).collect()))
}

// === plexus ===

pub fn open_plexus(isolate: &mut Isolate) -> Result<(), String> {
    isolate.register_natives(
        PLEXUS_MODULE,
        &[
            ("spawn", plexus_spawn),
            ("send", plexus_send),
            ("receive", plexus_receive),
            ("newchannel", plexus_newchannel),
            ("delchannel", plexus_delchannel),
            ("barrier", plexus_barrier),
            ("setnumworkers", plexus_setnumworkers),
            ("getnumworkers", plexus_getnumworkers),
            ("recycle", plexus_recycle),
        ],
    )?;
    Ok(())
}

/// `spawn(fn, args...)`: the function and its arguments travel in the outbox.
fn plexus_spawn(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    if args.is_empty() {
        return Err("bad argument #1 to 'spawn' (function expected, got no value)".to_string());
    }
    isolate.outbox = args;
    Ok(NativeReturn::Request(Request::Spawn))
}

fn plexus_send(isolate: &mut Isolate, mut args: Vec<Value>) -> Result<NativeReturn, String> {
    let channel = check_str(&args, 0, "send")?;
    args.remove(0);
    isolate.outbox = args;
    Ok(NativeReturn::Request(Request::Send { channel }))
}

fn plexus_receive(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let channel = check_str(&args, 0, "receive")?;
    let nonblocking = arg(&args, 1).is_truthy();
    Ok(NativeReturn::Request(Request::Receive { channel, nonblocking }))
}

fn plexus_newchannel(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let name = check_str(&args, 0, "newchannel")?;
    let kind = if arg(&args, 1).is_truthy() {
        ChannelKind::Async
    } else {
        ChannelKind::Sync
    };
    Ok(NativeReturn::Request(Request::CreateChannel { name, kind }))
}

fn plexus_delchannel(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let name = check_str(&args, 0, "delchannel")?;
    Ok(NativeReturn::Request(Request::DestroyChannel { name }))
}

fn plexus_barrier(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let channel = check_str(&args, 0, "barrier")?;
    let expected = check_int(&args, 1, "barrier")?;
    Ok(NativeReturn::Request(Request::Barrier { channel, expected }))
}

fn plexus_setnumworkers(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let n = check_int(&args, 0, "setnumworkers")?;
    Ok(NativeReturn::Request(Request::SetWorkers(n)))
}

fn plexus_getnumworkers(_: &mut Isolate, _: Vec<Value>) -> Result<NativeReturn, String> {
    Ok(NativeReturn::Request(Request::GetWorkers))
}

fn plexus_recycle(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let n = check_int(&args, 0, "recycle")?;
    Ok(NativeReturn::Request(Request::SetRecycleLimit(n)))
}

// === coroutine ===

pub fn open_coroutine(isolate: &mut Isolate) -> Result<(), String> {
    isolate.register_natives(COROUTINE_MODULE, &[("create", coroutine_create), ("status", coroutine_status)])?;
    Ok(())
}

fn coroutine_create(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let body = arg(&args, 0);
    if !matches!(body, Value::Function(_) | Value::Native(_)) {
        return Err(format!(
            "bad argument #1 to 'create' (function expected, got {})",
            body.type_name()
        ));
    }
    Ok(NativeReturn::one(isolate.new_thread(body)))
}

fn coroutine_status(_: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    match arg(&args, 0) {
        Value::Thread(_) => Ok(NativeReturn::one(Value::string("suspended"))),
        other => Err(format!(
            "bad argument #1 to 'status' (thread expected, got {})",
            other.type_name()
        )),
    }
}

// === handle ===

pub fn open_handle(isolate: &mut Isolate) -> Result<(), String> {
    isolate.register_natives(
        HANDLE_MODULE,
        &[
            ("new", handle_new),
            ("size", handle_size),
            ("read", handle_read),
            ("typename", handle_typename),
            ("register", handle_register),
        ],
    )?;
    Ok(())
}

fn handle_new(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let type_name = check_str(&args, 0, "new")?;
    let contents = match arg(&args, 1) {
        Value::Nil => Vec::new(),
        _ => check_str(&args, 1, "new")?.into_bytes(),
    };
    Ok(NativeReturn::one(isolate.new_handle(&type_name, contents)))
}

fn handle_size(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let handle = check_handle(&args, 0, "size")?;
    let bytes = isolate.handle_bytes(handle).map_err(|e| e.to_string())?;
    Ok(NativeReturn::one(Value::Int(bytes.len() as i64)))
}

/// Contents as a string, or `(nil, message)` once the handle moved away.
fn handle_read(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let handle = check_handle(&args, 0, "read")?;
    match isolate.handle_bytes(handle) {
        Ok(bytes) => Ok(NativeReturn::one(Value::from(String::from_utf8_lossy(bytes).into_owned()))),
        Err(e) => Ok(NativeReturn::Values(vec![Value::Nil, Value::from(e.to_string())])),
    }
}

fn handle_typename(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let handle = check_handle(&args, 0, "typename")?;
    Ok(NativeReturn::one(match isolate.handle_type(handle)? {
        Some(name) => Value::string(name),
        None => Value::Nil,
    }))
}

fn handle_register(isolate: &mut Isolate, args: Vec<Value>) -> Result<NativeReturn, String> {
    let type_name = check_str(&args, 0, "register")?;
    isolate.register_handle_type(&type_name);
    Ok(NativeReturn::none())
}
