//! C-ABI embedding surface.
//!
//! Every `puppet_create_*`/`puppet_*_clone` hands the caller a pointer
//! from `Box::into_raw`, and the matching `puppet_free_*` reclaims it
//! with `Box::from_raw`. [`PuppetValue`] is `#[repr(transparent)]` over
//! [`Value`] so array/hash element accessors can hand out pointers
//! straight into the container without an extra allocation per element;
//! pointers read that way are owned by the container and must not be
//! freed by the caller.
//!
//! This module only evaluates manifests for their resulting value (a
//! scripting-style entry point, isolated per call); it does not build a
//! catalog. [`crate::session::Session`] is the catalog-building entry
//! point a Rust embedder should prefer; this module exists for foreign
//! callers that can only cross an FFI boundary.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use crate::ast::Lambda;
use crate::context::Context;
use crate::eval::{Evaluator, NativeDispatch};
use crate::fact::MapFactSource;
use crate::fault::{EvalFault, Fault};
use crate::log::{LogEntry, LogLevel, LogSink};
use crate::parser::Parser;
use crate::position::{Position, Span};
use crate::registry::Registry;
use crate::validator;
use crate::value::{IterationItem, Type, Value};

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(str::to_string)
}

unsafe fn utf8_string_to_str<'a>(data: *const PuppetUtf8String) -> Option<&'a str> {
    let data = data.as_ref()?;
    if data.bytes.is_null() {
        return None;
    }
    let slice = std::slice::from_raw_parts(data.bytes as *const u8, data.size as usize);
    std::str::from_utf8(slice).ok()
}

fn is_mutable(value: &Value) -> bool {
    !matches!(value, Value::VariableRef(_) | Value::Iterator(_))
}

/// A UTF-8 string view; `bytes` points into data owned by the value or
/// exception it was read from and is valid only until that handle is
/// freed or mutated.
#[repr(C)]
pub struct PuppetUtf8String {
    pub size: u64,
    pub bytes: *const c_char,
}

impl PuppetUtf8String {
    pub fn empty() -> Self {
        PuppetUtf8String { size: 0, bytes: std::ptr::null() }
    }

    /// Borrows `s`; the view is valid only as long as `s` is.
    pub fn borrowed(s: &str) -> Self {
        PuppetUtf8String { size: s.len() as u64, bytes: s.as_ptr() as *const c_char }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuppetLogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Alert,
    Emergency,
    Critical,
}

impl From<PuppetLogLevel> for LogLevel {
    fn from(level: PuppetLogLevel) -> Self {
        match level {
            PuppetLogLevel::Debug => LogLevel::Debug,
            PuppetLogLevel::Info => LogLevel::Info,
            PuppetLogLevel::Notice => LogLevel::Notice,
            PuppetLogLevel::Warning => LogLevel::Warning,
            PuppetLogLevel::Error => LogLevel::Error,
            PuppetLogLevel::Alert => LogLevel::Alert,
            PuppetLogLevel::Emergency => LogLevel::Emergency,
            PuppetLogLevel::Critical => LogLevel::Critical,
        }
    }
}

impl From<LogLevel> for PuppetLogLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => PuppetLogLevel::Debug,
            LogLevel::Info => PuppetLogLevel::Info,
            LogLevel::Notice => PuppetLogLevel::Notice,
            LogLevel::Warning => PuppetLogLevel::Warning,
            LogLevel::Error => PuppetLogLevel::Error,
            LogLevel::Alert => PuppetLogLevel::Alert,
            LogLevel::Emergency => PuppetLogLevel::Emergency,
            LogLevel::Critical => PuppetLogLevel::Critical,
        }
    }
}

#[repr(C)]
pub struct PuppetLogEntry {
    pub level: PuppetLogLevel,
    pub line: u64,
    pub column: u64,
    pub span: u64,
    pub text: PuppetUtf8String,
    pub path: PuppetUtf8String,
    pub message: PuppetUtf8String,
}

/// Adapts a caller-supplied log callback into this crate's [`LogSink`].
struct CallbackSink {
    callback: extern "C" fn(*const PuppetLogEntry),
}

impl LogSink for CallbackSink {
    fn push(&self, entry: LogEntry) {
        let path = entry.path.clone().unwrap_or_default();
        let ffi_entry = PuppetLogEntry {
            level: entry.level.into(),
            line: entry.span.begin.line as u64,
            column: entry.column as u64,
            span: entry.span.end.offset.saturating_sub(entry.span.begin.offset) as u64,
            text: PuppetUtf8String::borrowed(&entry.message),
            path: PuppetUtf8String::borrowed(&path),
            message: PuppetUtf8String::borrowed(&entry.message),
        };
        (self.callback)(&ffi_entry as *const PuppetLogEntry);
    }
}

/// Used when `puppet_create_session` is given a null callback: no
/// messages are logged in that case.
struct NullSink;

impl LogSink for NullSink {
    fn push(&self, _entry: LogEntry) {}
}

/// An opaque owned value handle. `#[repr(transparent)]` so a `&Value`
/// borrowed out of a container (array element, hash entry) can be handed
/// across the boundary as a `*const PuppetValue` without copying it into
/// its own allocation.
#[repr(transparent)]
pub struct PuppetValue(pub(crate) Value);

fn value_ptr(value: &Value) -> *const PuppetValue {
    (value as *const Value).cast::<PuppetValue>()
}

#[no_mangle]
pub extern "C" fn puppet_create_value() -> *mut PuppetValue {
    Box::into_raw(Box::new(PuppetValue(Value::Undef)))
}

/// # Safety
/// `value` must be null or a live handle returned by one of this
/// module's `puppet_create_*`/`puppet_value_clone` functions.
#[no_mangle]
pub unsafe extern "C" fn puppet_value_clone(value: *const PuppetValue) -> *mut PuppetValue {
    match value.as_ref() {
        Some(v) => Box::into_raw(Box::new(PuppetValue(v.0.clone()))),
        None => std::ptr::null_mut(),
    }
}

/// # Safety
/// `value` must be null or a handle this module allocated, not yet freed.
#[no_mangle]
pub unsafe extern "C" fn puppet_free_value(value: *mut PuppetValue) {
    if !value.is_null() {
        drop(Box::from_raw(value));
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuppetValueKind {
    Undef,
    Default,
    Integer,
    Float,
    Boolean,
    String,
    Regexp,
    Type,
    Array,
    Hash,
    SequenceIterator,
    KeyValueIterator,
}

/// # Safety
/// `value` and `kind` must each be null or point at valid memory of the
/// expected type.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_value_kind(value: *const PuppetValue, kind: *mut PuppetValueKind) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    if kind.is_null() {
        return 0;
    }
    let resolved = match v.0.resolve() {
        Value::Undef => PuppetValueKind::Undef,
        Value::Default => PuppetValueKind::Default,
        Value::Integer(_) => PuppetValueKind::Integer,
        Value::Float(_) => PuppetValueKind::Float,
        Value::Boolean(_) => PuppetValueKind::Boolean,
        Value::String(_) => PuppetValueKind::String,
        Value::Regex(_) => PuppetValueKind::Regexp,
        Value::Type(_) => PuppetValueKind::Type,
        Value::Array(_) => PuppetValueKind::Array,
        Value::Hash(_) => PuppetValueKind::Hash,
        Value::Iterator(items) => {
            if items.iter().any(|i| matches!(i, IterationItem::Pair(..))) {
                PuppetValueKind::KeyValueIterator
            } else {
                PuppetValueKind::SequenceIterator
            }
        }
        Value::VariableRef(_) => unreachable!("resolve() strips VariableRef"),
    };
    *kind = resolved;
    1
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_is_immutable(value: *const PuppetValue) -> c_int {
    match value.as_ref() {
        Some(v) => (!is_mutable(&v.0)) as c_int,
        None => 0,
    }
}

unsafe fn set_if_mutable(value: *mut PuppetValue, new: Value) -> c_int {
    match value.as_mut() {
        Some(v) if is_mutable(&v.0) => {
            v.0 = new;
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_undef(value: *mut PuppetValue) -> c_int {
    set_if_mutable(value, Value::Undef)
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_default(value: *mut PuppetValue) -> c_int {
    set_if_mutable(value, Value::Default)
}

/// # Safety
/// `value` must be null or a live handle; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_integer(value: *const PuppetValue, data: *mut i64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    match v.0.as_integer() {
        Some(n) if !data.is_null() => {
            *data = n;
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_integer(value: *mut PuppetValue, data: i64) -> c_int {
    set_if_mutable(value, Value::Integer(data))
}

/// # Safety
/// `value` must be null or a live handle; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_float(value: *const PuppetValue, data: *mut f64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    match v.0.resolve() {
        Value::Float(f) if !data.is_null() => {
            *data = *f;
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_float(value: *mut PuppetValue, data: f64) -> c_int {
    set_if_mutable(value, Value::Float(data))
}

/// # Safety
/// `value` must be null or a live handle; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_boolean(value: *const PuppetValue, data: *mut u8) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    match v.0.resolve() {
        Value::Boolean(b) if !data.is_null() => {
            *data = *b as u8;
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_boolean(value: *mut PuppetValue, data: u8) -> c_int {
    set_if_mutable(value, Value::Boolean(data != 0))
}

/// # Safety
/// `value` must be null or a live handle; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_string(value: *const PuppetValue, data: *mut PuppetUtf8String) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let s = match v.0.resolve() {
        Value::String(s) => s,
        _ => return 0,
    };
    if data.is_null() {
        return 0;
    }
    *data = PuppetUtf8String::borrowed(s);
    1
}

/// # Safety
/// `value` must be null or a live handle; `data` must point at a valid
/// [`PuppetUtf8String`] whose bytes are readable for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_string(value: *mut PuppetValue, data: *const PuppetUtf8String) -> c_int {
    let v = match value.as_mut() {
        Some(v) => v,
        None => return 0,
    };
    if !is_mutable(&v.0) {
        return 0;
    }
    match utf8_string_to_str(data) {
        Some(s) => {
            v.0 = Value::String(s.to_string());
            1
        }
        None => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_regexp(value: *const PuppetValue, data: *mut PuppetUtf8String) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let pattern = match v.0.resolve() {
        Value::Regex(p) => p,
        _ => return 0,
    };
    if data.is_null() {
        return 0;
    }
    *data = PuppetUtf8String::borrowed(pattern);
    1
}

/// # Safety
/// Same as [`puppet_set_string`].
#[no_mangle]
pub unsafe extern "C" fn puppet_set_regexp(value: *mut PuppetValue, data: *const PuppetUtf8String) -> c_int {
    let v = match value.as_mut() {
        Some(v) => v,
        None => return 0,
    };
    if !is_mutable(&v.0) {
        return 0;
    }
    let pattern = match utf8_string_to_str(data) {
        Some(p) => p,
        None => return 0,
    };
    if regex::Regex::new(pattern).is_err() {
        return 0;
    }
    v.0 = Value::Regex(pattern.to_string());
    1
}

/// # Safety
/// `value` must be null or a live handle; `specification` must be a
/// null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn puppet_set_type(value: *mut PuppetValue, specification: *const c_char) -> c_int {
    let v = match value.as_mut() {
        Some(v) => v,
        None => return 0,
    };
    if !is_mutable(&v.0) {
        return 0;
    }
    let spec = match cstr_to_string(specification) {
        Some(s) => s,
        None => return 0,
    };
    match Type::parse(&spec) {
        Ok(t) => {
            v.0 = Value::Type(t);
            1
        }
        Err(_) => 0,
    }
}

#[no_mangle]
pub extern "C" fn puppet_create_array(capacity: u64) -> *mut PuppetValue {
    Box::into_raw(Box::new(PuppetValue(Value::Array(Vec::with_capacity(capacity as usize)))))
}

/// # Safety
/// `value` must be null or a live handle; `size` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_array_size(value: *const PuppetValue, size: *mut u64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    match v.0.resolve() {
        Value::Array(items) if !size.is_null() => {
            *size = items.len() as u64;
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle; `elements` must be writable for
/// at least `count` pointers. The returned pointers alias `value`'s own
/// storage and are valid only until `value` is next mutated or freed.
#[no_mangle]
pub unsafe extern "C" fn puppet_array_elements(value: *const PuppetValue, elements: *mut *const PuppetValue, count: u64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let items = match v.0.resolve() {
        Value::Array(items) => items,
        _ => return 0,
    };
    if elements.is_null() {
        return 0;
    }
    let n = (count as usize).min(items.len());
    for (i, item) in items.iter().take(n).enumerate() {
        *elements.add(i) = value_ptr(item);
    }
    1
}

/// # Safety
/// `value` must be null or a live handle; `element` must be a valid
/// pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_array_get(value: *const PuppetValue, index: u64, element: *mut *const PuppetValue) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let items = match v.0.resolve() {
        Value::Array(items) => items,
        _ => return 0,
    };
    match items.get(index as usize) {
        Some(item) if !element.is_null() => {
            *element = value_ptr(item);
            1
        }
        _ => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle; `element` is consumed (freed or
/// moved into the array) regardless of whether the call succeeds.
#[no_mangle]
pub unsafe extern "C" fn puppet_array_set(value: *mut PuppetValue, index: u64, element: *mut PuppetValue) -> c_int {
    let v = match value.as_mut() {
        Some(v) => v,
        None => return 0,
    };
    let owned = match element.as_mut() {
        Some(_) => Box::from_raw(element).0,
        None => return 0,
    };
    if !is_mutable(&v.0) {
        return 0;
    }
    match v.0.array_set(index as usize, owned) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

/// # Safety
/// Same as [`puppet_array_set`].
#[no_mangle]
pub unsafe extern "C" fn puppet_array_push(value: *mut PuppetValue, element: *mut PuppetValue) -> c_int {
    let v = match value.as_mut() {
        Some(v) => v,
        None => return 0,
    };
    let owned = match element.as_mut() {
        Some(_) => Box::from_raw(element).0,
        None => return 0,
    };
    if !is_mutable(&v.0) {
        return 0;
    }
    match &mut v.0 {
        Value::Array(items) => {
            items.push(owned);
            1
        }
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn puppet_create_hash() -> *mut PuppetValue {
    Box::into_raw(Box::new(PuppetValue(Value::Hash(Vec::new()))))
}

/// # Safety
/// `value` must be null or a live handle; `size` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_hash_size(value: *const PuppetValue, size: *mut u64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    match v.0.resolve() {
        Value::Hash(pairs) if !size.is_null() => {
            *size = pairs.len() as u64;
            1
        }
        _ => 0,
    }
}

#[repr(C)]
pub struct PuppetHashElement {
    pub key: *const PuppetValue,
    pub value: *const PuppetValue,
}

/// # Safety
/// Same aliasing contract as [`puppet_array_elements`].
#[no_mangle]
pub unsafe extern "C" fn puppet_hash_elements(value: *const PuppetValue, elements: *mut PuppetHashElement, count: u64) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let pairs = match v.0.resolve() {
        Value::Hash(pairs) => pairs,
        _ => return 0,
    };
    if elements.is_null() {
        return 0;
    }
    let n = (count as usize).min(pairs.len());
    for (i, (k, val)) in pairs.iter().take(n).enumerate() {
        *elements.add(i) = PuppetHashElement { key: value_ptr(k), value: value_ptr(val) };
    }
    1
}

/// # Safety
/// `hash` and `key` must be null or live handles; `value` must be a
/// valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_hash_get(hash: *const PuppetValue, key: *const PuppetValue, value: *mut *const PuppetValue) -> c_int {
    let h = match hash.as_ref() {
        Some(h) => h,
        None => return 0,
    };
    let k = match key.as_ref() {
        Some(k) => k,
        None => return 0,
    };
    if value.is_null() {
        return 0;
    }
    match h.0.as_hash() {
        Some(pairs) => {
            *value = pairs.iter().find(|(pk, _)| pk.equals(&k.0)).map(|(_, v)| value_ptr(v)).unwrap_or(std::ptr::null());
            1
        }
        None => 0,
    }
}

/// # Safety
/// `hash` must be null or a live handle; `key`/`value` are each consumed
/// regardless of success.
#[no_mangle]
pub unsafe extern "C" fn puppet_hash_set(hash: *mut PuppetValue, key: *mut PuppetValue, value: *mut PuppetValue) -> c_int {
    let h = match hash.as_mut() {
        Some(h) => h,
        None => return 0,
    };
    let k = match key.as_mut() {
        Some(_) => Box::from_raw(key).0,
        None => return 0,
    };
    let val = match value.as_mut() {
        Some(_) => Box::from_raw(value).0,
        None => return 0,
    };
    if !is_mutable(&h.0) {
        return 0;
    }
    match h.0.hash_set(k, val) {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

/// # Safety
/// `value` must be null or a live handle; `callback`, if given, is
/// invoked once per element with key/value pointers valid only for the
/// duration of that call.
#[no_mangle]
pub unsafe extern "C" fn puppet_iterate(
    value: *const PuppetValue,
    data: *const c_void,
    callback: Option<extern "C" fn(*const c_void, *const PuppetValue, *const PuppetValue) -> c_int>,
) -> c_int {
    let v = match value.as_ref() {
        Some(v) => v,
        None => return 0,
    };
    let items = match v.0.iterate() {
        Some(items) => items,
        None => return 0,
    };
    let callback = match callback {
        Some(cb) => cb,
        None => return 1,
    };
    for item in &items {
        let (key, val) = match item {
            IterationItem::Single(v) => (None, v.clone()),
            IterationItem::Pair(k, v) => (Some(k.clone()), v.clone()),
        };
        let key_box = key.map(|k| Box::new(PuppetValue(k)));
        let val_box = Box::new(PuppetValue(val));
        let key_ptr = key_box.as_deref().map(|b| b as *const PuppetValue).unwrap_or(std::ptr::null());
        let val_ptr = val_box.as_ref() as *const PuppetValue;
        let keep_going = callback(data, key_ptr, val_ptr);
        drop(key_box);
        drop(val_box);
        if keep_going == 0 {
            break;
        }
    }
    1
}

/// # Safety
/// `value` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn puppet_value_to_string(value: *const PuppetValue) -> *mut PuppetValue {
    match value.as_ref() {
        Some(v) => Box::into_raw(Box::new(PuppetValue(Value::String(v.0.to_display_string())))),
        None => std::ptr::null_mut(),
    }
}

/// An opaque owned exception handle: a snapshot of a [`Fault`] plus the
/// backtrace frames and backing strings the FFI struct needs to stay
/// alive until `puppet_free_exception`.
pub struct PuppetException {
    message: String,
    path: String,
    line: u64,
    column: u64,
    span: u64,
    frames: Vec<(String, Span)>,
}

impl PuppetException {
    fn from_fault(fault: Fault) -> Self {
        let (message, span, column, path, frames) = match fault {
            Fault::Lex(e) => (e.message, e.span, e.column, e.path.unwrap_or_default(), Vec::new()),
            Fault::Parse(e) => (e.message, e.span, e.column, e.path.unwrap_or_default(), Vec::new()),
            Fault::Validation(e) => (e.message, e.span, e.column, e.path.unwrap_or_default(), Vec::new()),
            Fault::Eval(e) => {
                let frames = e.backtrace.iter().map(|f| (f.scope_name.clone(), f.span)).collect();
                (e.message, e.span, e.column, e.path.unwrap_or_default(), frames)
            }
            Fault::Finalization(e) => (e.message, Span::point(Position::start()), 1, String::new(), Vec::new()),
            Fault::Config(e) => (e.message, Span::point(Position::start()), 1, e.path.map(|p| p.display().to_string()).unwrap_or_default(), Vec::new()),
            Fault::Io(message) => (message, Span::point(Position::start()), 1, String::new(), Vec::new()),
        };
        PuppetException {
            line: span.begin.line as u64,
            column: column as u64,
            span: span.end.offset.saturating_sub(span.begin.offset) as u64,
            message,
            path,
            frames,
        }
    }

    fn message_text(&self) -> &str {
        &self.message
    }
}

#[repr(C)]
pub struct PuppetSourcePosition {
    pub line: u64,
    pub offset: u64,
}

#[repr(C)]
pub struct PuppetStackFrame {
    pub name: PuppetUtf8String,
    pub path: PuppetUtf8String,
    pub begin: PuppetSourcePosition,
    pub end: PuppetSourcePosition,
}

#[repr(C)]
pub struct PuppetExceptionData {
    pub message: *const c_char,
    pub line: u64,
    pub column: u64,
    pub span: u64,
    pub text: PuppetUtf8String,
    pub path: PuppetUtf8String,
    pub frame_count: u32,
    pub frames: *const PuppetStackFrame,
}

/// # Safety
/// `message` must be a null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn puppet_create_exception(message: *const c_char) -> *mut PuppetException {
    let msg = match cstr_to_string(message) {
        Some(m) => m,
        None => return std::ptr::null_mut(),
    };
    Box::into_raw(Box::new(PuppetException::from_fault(Fault::Eval(EvalFault::new(msg, Span::point(Position::start()))))))
}

/// # Safety
/// `message` must be a null-terminated UTF-8 string; `context`, if
/// non-null, must be a live [`PuppetCallContext`].
#[no_mangle]
pub unsafe extern "C" fn puppet_create_exception_with_context(message: *const c_char, context: *const PuppetCallContext) -> *mut PuppetException {
    let msg = match cstr_to_string(message) {
        Some(m) => m,
        None => return std::ptr::null_mut(),
    };
    let span = context.as_ref().map(|c| c.span).unwrap_or_else(|| Span::point(Position::start()));
    Box::into_raw(Box::new(PuppetException::from_fault(Fault::Eval(EvalFault::new(msg, span)))))
}

/// # Safety
/// `exception` must be null or a live handle; `data` must be a valid
/// pointer. The returned `message`/`text`/`path`/`frames` fields borrow
/// from `exception` and are valid until it is freed.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_exception_data(exception: *const PuppetException, data: *mut PuppetExceptionData) -> c_int {
    let e = match exception.as_ref() {
        Some(e) => e,
        None => return 0,
    };
    if data.is_null() {
        return 0;
    }
    // `frames` is rebuilt fresh on every call rather than cached on
    // `PuppetException`, so its pointer is only valid until the next
    // call; documented via the "valid until freed" contract the whole
    // exception handle already carries.
    let frames: Vec<PuppetStackFrame> = e
        .frames
        .iter()
        .map(|(name, span)| PuppetStackFrame {
            name: PuppetUtf8String::borrowed(name),
            path: PuppetUtf8String::borrowed(&e.path),
            begin: PuppetSourcePosition { line: span.begin.line as u64, offset: span.begin.offset as u64 },
            end: PuppetSourcePosition { line: span.end.line as u64, offset: span.end.offset as u64 },
        })
        .collect();
    *data = PuppetExceptionData {
        message: e.message_text().as_ptr() as *const c_char,
        line: e.line,
        column: e.column,
        span: e.span,
        text: PuppetUtf8String::empty(),
        path: PuppetUtf8String::borrowed(&e.path),
        frame_count: frames.len() as u32,
        frames: if frames.is_empty() { std::ptr::null() } else { Box::into_raw(frames.into_boxed_slice()) as *const PuppetStackFrame },
    };
    1
}

/// # Safety
/// `exception` must be null or a handle this module allocated.
#[no_mangle]
pub unsafe extern "C" fn puppet_free_exception(exception: *mut PuppetException) {
    if !exception.is_null() {
        drop(Box::from_raw(exception));
    }
}

#[repr(C)]
pub struct PuppetEvaluationResult {
    pub value: *mut PuppetValue,
    pub exception: *mut PuppetException,
}

impl PuppetEvaluationResult {
    fn ok(value: Value) -> Self {
        PuppetEvaluationResult { value: Box::into_raw(Box::new(PuppetValue(value))), exception: std::ptr::null_mut() }
    }

    fn err(fault: Fault) -> Self {
        PuppetEvaluationResult { value: std::ptr::null_mut(), exception: Box::into_raw(Box::new(PuppetException::from_fault(fault))) }
    }
}

/// Opaque context handed to a native function's callback for the
/// duration of one call: lets it check for a passed block, read the
/// caller's source position, and yield to the block. `eval`/`ctx` point
/// at the live evaluator/context for that call; neither escapes it.
pub struct PuppetCallContext {
    eval: *mut Evaluator,
    ctx: *mut Context,
    block: Option<*const Lambda>,
    span: Span,
}

/// # Safety
/// `context` must be null or a live [`PuppetCallContext`], valid only
/// for the duration of the native function call it was created for.
#[no_mangle]
pub unsafe extern "C" fn puppet_block_passed(context: *mut PuppetCallContext) -> c_int {
    match context.as_ref() {
        Some(c) => c.block.is_some() as c_int,
        None => 0,
    }
}

#[repr(C)]
pub struct PuppetCallerData {
    pub path: PuppetUtf8String,
    pub line: u64,
}

/// # Safety
/// Same as [`puppet_block_passed`]; `data` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn puppet_get_caller_data(context: *const PuppetCallContext, data: *mut PuppetCallerData) -> c_int {
    let c = match context.as_ref() {
        Some(c) => c,
        None => return 0,
    };
    if data.is_null() {
        return 0;
    }
    // The evaluator does not track a "current file" per call frame (see
    // DESIGN.md), so the caller path is always empty; the line still
    // comes from the call's own span.
    *data = PuppetCallerData { path: PuppetUtf8String::empty(), line: c.span.begin.line as u64 };
    1
}

/// # Safety
/// `context` must be null or a live [`PuppetCallContext`] with a block
/// passed; `arguments` must be readable for `count` value handles, each
/// consumed by this call.
#[no_mangle]
pub unsafe extern "C" fn puppet_yield(context: *mut PuppetCallContext, arguments: *mut *mut PuppetValue, count: u64) -> PuppetEvaluationResult {
    let c = match context.as_mut() {
        Some(c) => c,
        None => return PuppetEvaluationResult::err(Fault::Io("null call context".to_string())),
    };
    let lambda = match c.block.and_then(|b| b.as_ref()) {
        Some(l) => l,
        None => return PuppetEvaluationResult::err(Fault::Eval(EvalFault::new("no block was passed", c.span))),
    };
    let mut args = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let ptr = *arguments.add(i);
        if !ptr.is_null() {
            args.push(Box::from_raw(ptr).0);
        }
    }
    let eval = &mut *c.eval;
    let ctx = &mut *c.ctx;
    match eval.call_lambda(lambda, args, ctx, c.span) {
        Ok(value) => PuppetEvaluationResult::ok(value),
        Err(fault) => PuppetEvaluationResult::err(Fault::Eval(fault)),
    }
}

/// One dispatch entry in a `puppet_define_function` call: a type
/// specification string plus the native callback it should route to.
#[repr(C)]
pub struct PuppetFunctionDispatch {
    pub specification: *const c_char,
    pub data: *mut c_void,
    pub callback: extern "C" fn(*mut PuppetCallContext, *mut c_void, *const *const PuppetValue, u64) -> PuppetEvaluationResult,
}

unsafe fn ffi_result_to_eval(result: PuppetEvaluationResult, span: Span) -> Result<Value, EvalFault> {
    if !result.exception.is_null() {
        let exception = Box::from_raw(result.exception);
        return Err(EvalFault::new(exception.message.clone(), span));
    }
    if result.value.is_null() {
        return Ok(Value::Undef);
    }
    Ok(Box::from_raw(result.value).0)
}

/// # Safety
/// `session` must be null or a live [`PuppetSession`]; `name` must be a
/// null-terminated UTF-8 string; `dispatches` must be readable for
/// `count` entries, each with a null-terminated `specification`.
#[no_mangle]
pub unsafe extern "C" fn puppet_define_function(
    session: *mut PuppetSession,
    name: *const c_char,
    dispatches: *const PuppetFunctionDispatch,
    count: u64,
) -> c_int {
    let session = match session.as_mut() {
        Some(s) => s,
        None => return 0,
    };
    let name = match cstr_to_string(name) {
        Some(n) => n,
        None => return 0,
    };
    if dispatches.is_null() && count > 0 {
        return 0;
    }
    let mut native_dispatches = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let raw = &*dispatches.add(i);
        let spec = match cstr_to_string(raw.specification) {
            Some(s) => s,
            None => return 0,
        };
        let signature = match Type::parse(&spec) {
            Ok(t) => t,
            Err(_) => return 0,
        };
        let data = raw.data as usize;
        let callback = raw.callback;
        native_dispatches.push(NativeDispatch {
            signature,
            callback: Rc::new(move |eval: &mut Evaluator, ctx: &mut Context, args: Vec<Value>, block: Option<&Lambda>, span: Span| {
                let raw_args: Vec<*mut PuppetValue> = args.into_iter().map(|a| Box::into_raw(Box::new(PuppetValue(a)))).collect();
                let arg_ptrs: Vec<*const PuppetValue> = raw_args.iter().map(|p| *p as *const PuppetValue).collect();
                let mut call_ctx =
                    PuppetCallContext { eval: eval as *mut Evaluator, ctx: ctx as *mut Context, block: block.map(|b| b as *const Lambda), span };
                let result = unsafe { (callback)(&mut call_ctx as *mut PuppetCallContext, data as *mut c_void, arg_ptrs.as_ptr(), arg_ptrs.len() as u64) };
                for p in raw_args {
                    if !p.is_null() {
                        drop(unsafe { Box::from_raw(p) });
                    }
                }
                unsafe { ffi_result_to_eval(result, span) }
            }),
        });
    }
    session.evaluator.define_function(&name, native_dispatches) as c_int
}

/// A compiler session for the scripting-style `puppet_evaluate_file`
/// entry point: an evaluator (carrying registered native functions and
/// hoisted user functions across calls) plus the registry accumulated
/// from every file evaluated on it so far.
pub struct PuppetSession {
    node_name: String,
    registry: Registry,
    evaluator: Evaluator,
    facts: Arc<MapFactSource>,
    log_sink: Arc<dyn LogSink>,
    log_level: LogLevel,
}

/// # Safety
/// `name` must be a null-terminated UTF-8 string; `directory` may be
/// null. `callback`, if given, is invoked (possibly many times, from
/// this same thread) for every log entry at or above `level`.
#[no_mangle]
pub unsafe extern "C" fn puppet_create_session(
    name: *const c_char,
    _directory: *const c_char,
    level: PuppetLogLevel,
    callback: Option<extern "C" fn(*const PuppetLogEntry)>,
) -> *mut PuppetSession {
    let name = match cstr_to_string(name) {
        Some(n) => n,
        None => return std::ptr::null_mut(),
    };
    let log_sink: Arc<dyn LogSink> = match callback {
        Some(cb) => Arc::new(CallbackSink { callback: cb }),
        None => Arc::new(NullSink),
    };
    let session = PuppetSession {
        node_name: name,
        registry: Registry::new(),
        evaluator: Evaluator::new(),
        facts: Arc::new(MapFactSource::new()),
        log_sink,
        log_level: level.into(),
    };
    Box::into_raw(Box::new(session))
}

/// # Safety
/// `session` must be null or a handle this module allocated.
#[no_mangle]
pub unsafe extern "C" fn puppet_free_session(session: *mut PuppetSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

fn evaluate_file_inner(session: &mut PuppetSession, path: &Path) -> Result<Value, Fault> {
    let text = std::fs::read_to_string(path).map_err(|e| Fault::Io(e.to_string()))?;
    let tree = Parser::parse_manifest(&text, Some(path.display().to_string()))?;
    validator::validate(&tree.body).map_err(|e| Fault::from(e).locate(&text))?;
    session.registry.scan_and_commit(&tree.body).map_err(|e| Fault::from(e).locate(&text))?;
    session.evaluator.hoist_functions(&tree.body);
    // Each file gets a fresh context: variables assigned in one file are
    // not visible to subsequent files. The registry and the evaluator's
    // function tables persist across calls on the same session.
    let mut ctx = Context::new(session.node_name.clone(), session.node_name.clone(), session.facts.clone(), session.log_sink.clone(), session.log_level);
    ctx.registry = session.registry.clone();
    ctx.source_text = tree.source.clone();
    let value = session.evaluator.eval_body(&tree.body, &mut ctx).map_err(|e| Fault::from(e).locate(&text))?;
    Ok(value)
}

/// # Safety
/// `session` must be null or a live [`PuppetSession`]; `path` must be a
/// null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn puppet_evaluate_file(session: *mut PuppetSession, path: *const c_char) -> PuppetEvaluationResult {
    let session = match session.as_mut() {
        Some(s) => s,
        None => return PuppetEvaluationResult::err(Fault::Io("null session".to_string())),
    };
    let path = match cstr_to_string(path) {
        Some(p) => p,
        None => return PuppetEvaluationResult::err(Fault::Io("invalid path".to_string())),
    };
    match evaluate_file_inner(session, Path::new(&path)) {
        Ok(value) => PuppetEvaluationResult::ok(value),
        Err(fault) => PuppetEvaluationResult::err(fault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Write;

    fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn array_round_trips_through_the_c_abi_shape() {
        unsafe {
            let array = puppet_create_array(2);
            let one = puppet_create_value();
            assert_eq!(puppet_set_integer(one, 1), 1);
            assert_eq!(puppet_array_push(array, one), 1);

            let mut size = 0u64;
            assert_eq!(puppet_array_size(array, &mut size), 1);
            assert_eq!(size, 1);

            let mut element: *const PuppetValue = std::ptr::null();
            assert_eq!(puppet_array_get(array, 0, &mut element), 1);
            let mut value = 0i64;
            assert_eq!(puppet_get_integer(element, &mut value), 1);
            assert_eq!(value, 1);

            puppet_free_value(array);
        }
    }

    #[test]
    fn hash_set_then_get_finds_the_value_back() {
        unsafe {
            let hash = puppet_create_hash();
            let key = puppet_create_value();
            puppet_set_string(key, &PuppetUtf8String::borrowed("name"));
            let value = puppet_create_value();
            puppet_set_string(value, &PuppetUtf8String::borrowed("puppetc"));
            assert_eq!(puppet_hash_set(hash, key, value), 1);

            let lookup_key = puppet_create_value();
            puppet_set_string(lookup_key, &PuppetUtf8String::borrowed("name"));
            let mut found: *const PuppetValue = std::ptr::null();
            assert_eq!(puppet_hash_get(hash, lookup_key, &mut found), 1);
            assert!(!found.is_null());

            puppet_free_value(hash);
            puppet_free_value(lookup_key);
        }
    }

    #[test]
    fn a_variable_ref_cannot_be_mutated() {
        unsafe {
            let inner = std::rc::Rc::new(Value::Integer(5));
            let handle = Box::into_raw(Box::new(PuppetValue(Value::VariableRef(inner))));
            assert_eq!(puppet_is_immutable(handle), 1);
            assert_eq!(puppet_set_integer(handle, 9), 0);
            puppet_free_value(handle);
        }
    }

    #[test]
    fn evaluating_a_file_returns_its_last_expression() {
        let manifest = write_manifest("1 + 1");
        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        unsafe {
            let name = CString::new("test-node").unwrap();
            let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);
            let result = puppet_evaluate_file(session, path.as_ptr());
            assert!(result.exception.is_null());
            let mut value = 0i64;
            assert_eq!(puppet_get_integer(result.value, &mut value), 1);
            assert_eq!(value, 2);
            puppet_free_value(result.value);
            puppet_free_session(session);
        }
    }

    #[test]
    fn a_malformed_manifest_surfaces_as_an_exception() {
        let manifest = write_manifest("file { 'x': ensure =>");
        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        unsafe {
            let name = CString::new("test-node").unwrap();
            let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);
            let result = puppet_evaluate_file(session, path.as_ptr());
            assert!(result.value.is_null());
            assert!(!result.exception.is_null());

            let mut data = PuppetExceptionData {
                message: std::ptr::null(),
                line: 0,
                column: 0,
                span: 0,
                text: PuppetUtf8String::empty(),
                path: PuppetUtf8String::empty(),
                frame_count: 0,
                frames: std::ptr::null(),
            };
            assert_eq!(puppet_get_exception_data(result.exception, &mut data), 1);
            assert!(!data.message.is_null());

            puppet_free_exception(result.exception);
            puppet_free_session(session);
        }
    }

    extern "C" fn double_callback(
        _context: *mut PuppetCallContext,
        _data: *mut c_void,
        args: *const *const PuppetValue,
        count: u64,
    ) -> PuppetEvaluationResult {
        unsafe {
            if count != 1 {
                return PuppetEvaluationResult::err(Fault::Io("expected exactly one argument".to_string()));
            }
            let arg = &*(*args);
            let n = arg.0.as_integer().unwrap_or(0);
            PuppetEvaluationResult::ok(Value::Integer(n * 2))
        }
    }

    #[test]
    fn a_native_function_defined_through_the_c_abi_is_callable_from_a_manifest() {
        let manifest = write_manifest("double(21)");
        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        unsafe {
            let name = CString::new("test-node").unwrap();
            let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);

            let fn_name = CString::new("double").unwrap();
            let spec = CString::new("Callable[Integer]").unwrap();
            let dispatch = PuppetFunctionDispatch { specification: spec.as_ptr(), data: std::ptr::null_mut(), callback: double_callback };
            assert_eq!(puppet_define_function(session, fn_name.as_ptr(), &dispatch, 1), 1);

            let result = puppet_evaluate_file(session, path.as_ptr());
            assert!(result.exception.is_null(), "expected success");
            let mut value = 0i64;
            assert_eq!(puppet_get_integer(result.value, &mut value), 1);
            assert_eq!(value, 42);

            puppet_free_value(result.value);
            puppet_free_session(session);
        }
    }
}
