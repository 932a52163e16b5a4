//! The C-ABI embedding surface, driven from Rust the way a foreign
//! runtime would drive it: opaque handles, explicit frees, UTF-8 string
//! views, and callback-based iteration and function dispatch.

use std::ffi::CString;
use std::io::Write;
use std::os::raw::c_void;

use puppetc::embed::*;

fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

unsafe fn string_value(text: &str) -> *mut PuppetValue {
    let value = puppet_create_value();
    assert_eq!(puppet_set_string(value, &PuppetUtf8String::borrowed(text)), 1);
    value
}

unsafe fn utf8_to_string(view: &PuppetUtf8String) -> String {
    let bytes = std::slice::from_raw_parts(view.bytes as *const u8, view.size as usize);
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =============================================================================
// Value handles
// =============================================================================

#[test]
fn fresh_values_are_undef_until_set() {
    unsafe {
        let value = puppet_create_value();
        let mut kind = PuppetValueKind::Integer;
        assert_eq!(puppet_get_value_kind(value, &mut kind), 1);
        assert_eq!(kind, PuppetValueKind::Undef);

        assert_eq!(puppet_set_boolean(value, 1), 1);
        assert_eq!(puppet_get_value_kind(value, &mut kind), 1);
        assert_eq!(kind, PuppetValueKind::Boolean);
        puppet_free_value(value);
    }
}

#[test]
fn string_views_carry_byte_lengths_not_nul_terminators() {
    unsafe {
        let value = string_value("héllo");
        let mut view = PuppetUtf8String::empty();
        assert_eq!(puppet_get_string(value, &mut view), 1);
        assert_eq!(view.size, "héllo".len() as u64);
        assert_eq!(utf8_to_string(&view), "héllo");
        puppet_free_value(value);
    }
}

#[test]
fn setting_an_invalid_regexp_fails() {
    unsafe {
        let value = puppet_create_value();
        assert_eq!(puppet_set_regexp(value, &PuppetUtf8String::borrowed("([")), 0);
        assert_eq!(puppet_set_regexp(value, &PuppetUtf8String::borrowed("^a+$")), 1);
        puppet_free_value(value);
    }
}

#[test]
fn type_values_parse_their_specification() {
    unsafe {
        let value = puppet_create_value();
        let spec = CString::new("Array[Integer, 1, 3]").unwrap();
        assert_eq!(puppet_set_type(value, spec.as_ptr()), 1);
        let mut kind = PuppetValueKind::Undef;
        puppet_get_value_kind(value, &mut kind);
        assert_eq!(kind, PuppetValueKind::Type);
        puppet_free_value(value);
    }
}

#[test]
fn clone_is_deep_and_independent() {
    unsafe {
        let original = string_value("before");
        let copy = puppet_value_clone(original);
        assert_eq!(puppet_set_string(original, &PuppetUtf8String::borrowed("after")), 1);
        let mut view = PuppetUtf8String::empty();
        assert_eq!(puppet_get_string(copy, &mut view), 1);
        assert_eq!(utf8_to_string(&view), "before");
        puppet_free_value(original);
        puppet_free_value(copy);
    }
}

#[test]
fn variable_handles_from_evaluation_are_immutable() {
    // A manifest ending in a variable reference hands back an immutable
    // handle onto the scope's value.
    let manifest = write_manifest("$x = 5 $x");
    unsafe {
        let name = CString::new("node").unwrap();
        let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);
        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        let result = puppet_evaluate_file(session, path.as_ptr());
        assert!(result.exception.is_null());

        assert_eq!(puppet_is_immutable(result.value), 1);
        assert_eq!(puppet_set_integer(result.value, 2), 0);
        assert_eq!(puppet_set_undef(result.value), 0);
        assert_eq!(puppet_set_string(result.value, &PuppetUtf8String::borrowed("x")), 0);
        // Reads still resolve through the handle.
        let mut n = 0i64;
        assert_eq!(puppet_get_integer(result.value, &mut n), 1);
        assert_eq!(n, 5);

        puppet_free_value(result.value);
        puppet_free_session(session);
    }
}

// =============================================================================
// Containers and iteration
// =============================================================================

#[test]
fn arrays_grow_by_push_and_read_back_elements() {
    unsafe {
        let array = puppet_create_array(0);
        for n in 0..3i64 {
            let element = puppet_create_value();
            puppet_set_integer(element, n * 10);
            assert_eq!(puppet_array_push(array, element), 1);
        }
        let mut size = 0u64;
        assert_eq!(puppet_array_size(array, &mut size), 1);
        assert_eq!(size, 3);

        let mut element: *const PuppetValue = std::ptr::null();
        assert_eq!(puppet_array_get(array, 2, &mut element), 1);
        let mut n = 0i64;
        assert_eq!(puppet_get_integer(element, &mut n), 1);
        assert_eq!(n, 20);

        assert_eq!(puppet_array_get(array, 9, &mut element), 0);
        puppet_free_value(array);
    }
}

#[test]
fn array_set_extends_with_undef_holes() {
    unsafe {
        let array = puppet_create_array(0);
        let element = puppet_create_value();
        puppet_set_integer(element, 7);
        assert_eq!(puppet_array_set(array, 2, element), 1);
        let mut size = 0u64;
        puppet_array_size(array, &mut size);
        assert_eq!(size, 3);

        let mut first: *const PuppetValue = std::ptr::null();
        puppet_array_get(array, 0, &mut first);
        let mut kind = PuppetValueKind::Integer;
        puppet_get_value_kind(first, &mut kind);
        assert_eq!(kind, PuppetValueKind::Undef);
        puppet_free_value(array);
    }
}

#[test]
fn hash_set_replaces_existing_keys() {
    unsafe {
        let hash = puppet_create_hash();
        assert_eq!(puppet_hash_set(hash, string_value("k"), string_value("one")), 1);
        assert_eq!(puppet_hash_set(hash, string_value("k"), string_value("two")), 1);

        let mut size = 0u64;
        assert_eq!(puppet_hash_size(hash, &mut size), 1);
        assert_eq!(size, 1);

        let key = string_value("k");
        let mut found: *const PuppetValue = std::ptr::null();
        assert_eq!(puppet_hash_get(hash, key, &mut found), 1);
        let mut view = PuppetUtf8String::empty();
        assert_eq!(puppet_get_string(found, &mut view), 1);
        assert_eq!(utf8_to_string(&view), "two");
        puppet_free_value(key);
        puppet_free_value(hash);
    }
}

extern "C" fn count_items(data: *const c_void, key: *const PuppetValue, _value: *const PuppetValue) -> i32 {
    unsafe {
        let counters = &mut *(data as *mut (u32, u32));
        counters.0 += 1;
        if !key.is_null() {
            counters.1 += 1;
        }
        1
    }
}

extern "C" fn stop_after_first(data: *const c_void, _key: *const PuppetValue, _value: *const PuppetValue) -> i32 {
    unsafe {
        *(data as *mut u32) += 1;
        0
    }
}

#[test]
fn iteration_visits_every_element_and_hands_keys_for_hashes() {
    unsafe {
        let hash = puppet_create_hash();
        puppet_hash_set(hash, string_value("a"), string_value("1"));
        puppet_hash_set(hash, string_value("b"), string_value("2"));
        let mut counters = (0u32, 0u32);
        assert_eq!(
            puppet_iterate(hash, &mut counters as *mut _ as *const c_void, Some(count_items)),
            1
        );
        assert_eq!(counters, (2, 2));
        puppet_free_value(hash);
    }
}

#[test]
fn a_falsy_callback_return_stops_iteration() {
    unsafe {
        let array = puppet_create_array(0);
        for n in 0..5i64 {
            let element = puppet_create_value();
            puppet_set_integer(element, n);
            puppet_array_push(array, element);
        }
        let mut visits = 0u32;
        puppet_iterate(array, &mut visits as *mut _ as *const c_void, Some(stop_after_first));
        assert_eq!(visits, 1);
        puppet_free_value(array);
    }
}

#[test]
fn to_string_matches_the_evaluators_display_form() {
    unsafe {
        let array = puppet_create_array(0);
        puppet_array_push(array, string_value("a"));
        let element = puppet_create_value();
        puppet_set_integer(element, 1);
        puppet_array_push(array, element);

        let rendered = puppet_value_to_string(array);
        let mut view = PuppetUtf8String::empty();
        assert_eq!(puppet_get_string(rendered, &mut view), 1);
        assert_eq!(utf8_to_string(&view), "['a', 1]");
        puppet_free_value(rendered);
        puppet_free_value(array);
    }
}

// =============================================================================
// Sessions, evaluation, and native functions
// =============================================================================

#[test]
fn evaluate_file_returns_the_last_value_and_accumulates_definitions() {
    let first = write_manifest("function triple($n) { $n * 3 } triple(5)");
    let second = write_manifest("triple(7)");
    unsafe {
        let name = CString::new("node").unwrap();
        let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);

        let path = CString::new(first.path().to_str().unwrap()).unwrap();
        let result = puppet_evaluate_file(session, path.as_ptr());
        assert!(result.exception.is_null());
        let mut n = 0i64;
        assert_eq!(puppet_get_integer(result.value, &mut n), 1);
        assert_eq!(n, 15);
        puppet_free_value(result.value);

        // Function definitions persist across files on the same session.
        let path = CString::new(second.path().to_str().unwrap()).unwrap();
        let result = puppet_evaluate_file(session, path.as_ptr());
        assert!(result.exception.is_null());
        assert_eq!(puppet_get_integer(result.value, &mut n), 1);
        assert_eq!(n, 21);
        puppet_free_value(result.value);

        puppet_free_session(session);
    }
}

#[test]
fn exceptions_carry_message_line_and_column() {
    let manifest = write_manifest("\n\n  fail('boom')");
    unsafe {
        let name = CString::new("node").unwrap();
        let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);
        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
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
        assert_eq!(data.line, 3);
        assert_eq!(data.column, 3);
        puppet_free_exception(result.exception);
        puppet_free_session(session);
    }
}

extern "C" fn sum_callback(
    _context: *mut PuppetCallContext,
    _data: *mut c_void,
    args: *const *const PuppetValue,
    count: u64,
) -> PuppetEvaluationResult {
    unsafe {
        let mut total = 0i64;
        for i in 0..count as usize {
            let mut n = 0i64;
            if puppet_get_integer(*args.add(i), &mut n) == 1 {
                total += n;
            }
        }
        let out = puppet_create_value();
        puppet_set_integer(out, total);
        PuppetEvaluationResult { value: out, exception: std::ptr::null_mut() }
    }
}

extern "C" fn yielding_callback(
    context: *mut PuppetCallContext,
    _data: *mut c_void,
    _args: *const *const PuppetValue,
    _count: u64,
) -> PuppetEvaluationResult {
    unsafe {
        assert_eq!(puppet_block_passed(context), 1);
        let arg = puppet_create_value();
        puppet_set_integer(arg, 21);
        let mut arguments = [arg];
        puppet_yield(context, arguments.as_mut_ptr(), 1)
    }
}

#[test]
fn native_functions_dispatch_on_their_type_specification() {
    let manifest = write_manifest("sum(1, 2, 3)");
    unsafe {
        let name = CString::new("node").unwrap();
        let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);

        let fn_name = CString::new("sum").unwrap();
        let spec = CString::new("Callable[Integer, Integer, Integer]").unwrap();
        let dispatch = PuppetFunctionDispatch {
            specification: spec.as_ptr(),
            data: std::ptr::null_mut(),
            callback: sum_callback,
        };
        assert_eq!(puppet_define_function(session, fn_name.as_ptr(), &dispatch, 1), 1);
        // A second definition under the same name is rejected.
        assert_eq!(puppet_define_function(session, fn_name.as_ptr(), &dispatch, 1), 0);

        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        let result = puppet_evaluate_file(session, path.as_ptr());
        assert!(result.exception.is_null());
        let mut n = 0i64;
        assert_eq!(puppet_get_integer(result.value, &mut n), 1);
        assert_eq!(n, 6);
        puppet_free_value(result.value);
        puppet_free_session(session);
    }
}

#[test]
fn yield_invokes_the_callers_block() {
    let manifest = write_manifest("apply() |$n| { $n * 2 }");
    unsafe {
        let name = CString::new("node").unwrap();
        let session = puppet_create_session(name.as_ptr(), std::ptr::null(), PuppetLogLevel::Notice, None);

        let fn_name = CString::new("apply").unwrap();
        let spec = CString::new("Callable").unwrap();
        let dispatch = PuppetFunctionDispatch {
            specification: spec.as_ptr(),
            data: std::ptr::null_mut(),
            callback: yielding_callback,
        };
        assert_eq!(puppet_define_function(session, fn_name.as_ptr(), &dispatch, 1), 1);

        let path = CString::new(manifest.path().to_str().unwrap()).unwrap();
        let result = puppet_evaluate_file(session, path.as_ptr());
        assert!(result.exception.is_null());
        let mut n = 0i64;
        assert_eq!(puppet_get_integer(result.value, &mut n), 1);
        assert_eq!(n, 42);
        puppet_free_value(result.value);
        puppet_free_session(session);
    }
}
