//! End-to-end tests over the public engine surface.
//!
//! These drive the whole pipeline — declaration parsing, type layout, data
//! marshaling and the libffi trampoline — against real libc functions
//! resolved from the running process.

use cdef::{CTypeKind, Error, Ffi, Value};

fn int_of(v: Value) -> i64 {
    match v {
        Value::Int(n) => n,
        other => panic!("expected an integer, got {other:?}"),
    }
}

#[test]
fn struct_layout_and_introspection() {
    let ffi = Ffi::cdef("typedef struct P { int x; char y; } P;", None).unwrap();
    let t = ffi.ctype("P").unwrap();
    assert_eq!(t.kind(), CTypeKind::Struct);
    assert_eq!(t.size(), 8);
    assert_eq!(t.align(), 4);
    assert_eq!(t.struct_field_offset("y"), Some(4));
    assert_eq!(t.struct_field_names(), vec!["x".to_string(), "y".to_string()]);
    assert_eq!(t.name(), "struct P");
}

#[test]
#[cfg(target_endian = "little")]
fn union_members_alias_the_same_bytes() {
    let ffi = Ffi::cdef("union U { uint32_t i; uint8_t b[4]; };", None).unwrap();
    let u = ffi.new("union U").unwrap();
    u.write_field("i", &Value::Int(0x01020304)).unwrap();
    let bytes = match u.read_field("b").unwrap() {
        Value::CData(b) => b,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(int_of(bytes.read_index(0).unwrap()), 0x04);
    assert_eq!(int_of(bytes.read_index(3).unwrap()), 0x01);
}

#[test]
fn bit_fields_round_trip_and_pack_tightly() {
    let ffi = Ffi::cdef(
        "struct B { unsigned a:3; unsigned b:5; unsigned c:8; };",
        None,
    )
    .unwrap();
    let b = ffi.new("struct B").unwrap();
    b.write_field("a", &Value::Int(7)).unwrap();
    b.write_field("b", &Value::Int(1)).unwrap();
    b.write_field("c", &Value::Int(255)).unwrap();
    assert_eq!(int_of(b.read_field("a").unwrap()), 7);
    assert_eq!(int_of(b.read_field("b").unwrap()), 1);
    assert_eq!(int_of(b.read_field("c").unwrap()), 255);

    // Raw bytes: 0x0F 0xFF 0x00 0x00.
    let raw = ffi.cast("uint8_t[4]", &Value::CData(b.clone())).unwrap();
    let got: Vec<i64> = (0..4).map(|i| int_of(raw.read_index(i).unwrap())).collect();
    assert_eq!(got, vec![0x0f, 0xff, 0x00, 0x00]);
}

#[test]
fn mixed_width_bit_fields_share_one_word() {
    // The packing unit is a 32-bit word regardless of the base types, so
    // three char-based nibbles land in a single 4-byte struct.
    let ffi = Ffi::cdef(
        "struct M { unsigned char a:4; unsigned char b:4; unsigned char c:4; };",
        None,
    )
    .unwrap();
    let m = ffi.new("struct M").unwrap();
    m.write_field("a", &Value::Int(0xa)).unwrap();
    m.write_field("b", &Value::Int(0x5)).unwrap();
    m.write_field("c", &Value::Int(0xc)).unwrap();
    assert_eq!(int_of(m.read_field("a").unwrap()), 0xa);
    assert_eq!(int_of(m.read_field("b").unwrap()), 0x5);
    assert_eq!(int_of(m.read_field("c").unwrap()), 0xc);
    assert_eq!(Ffi::size_of(&Value::CData(m.clone())).unwrap(), 4);
}

#[test]
fn zero_width_bit_field_restarts_packing() {
    let ffi = Ffi::cdef("struct Z { unsigned a:3; unsigned :0; unsigned b:3; };", None).unwrap();
    let t = ffi.ctype("struct Z").unwrap();
    assert_eq!(t.size(), 8);
    let z = ffi.new("struct Z").unwrap();
    z.write_field("a", &Value::Int(5)).unwrap();
    z.write_field("b", &Value::Int(6)).unwrap();
    assert_eq!(int_of(z.read_field("a").unwrap()), 5);
    assert_eq!(int_of(z.read_field("b").unwrap()), 6);
    // b lives in the second word, past the forced unit break.
    let raw = ffi.cast("uint8_t[8]", &Value::CData(z.clone())).unwrap();
    assert_eq!(int_of(raw.read_index(0).unwrap()), 5);
    assert_eq!(int_of(raw.read_index(4).unwrap()), 6);
}

#[test]
fn signed_bit_fields_sign_extend() {
    let ffi = Ffi::cdef("struct S { int v:4; };", None).unwrap();
    let s = ffi.new("struct S").unwrap();
    s.write_field("v", &Value::Int(-1)).unwrap();
    assert_eq!(int_of(s.read_field("v").unwrap()), -1);
}

#[test]
fn strlen_returns_the_byte_count() {
    let ffi = Ffi::cdef("unsigned long strlen(const char *s);", None).unwrap();
    assert_eq!(int_of(ffi.call("strlen", &[Value::Str("abc".into())]).unwrap()), 3);
}

#[test]
fn array_reads_are_bounds_checked() {
    let ffi = Ffi::empty();
    let a = ffi.new("int[4]").unwrap();
    assert!(a.read_index(3).is_ok());
    assert!(matches!(a.read_index(4), Err(Error::OutOfBounds)));
    assert!(matches!(a.write_index(4, &Value::Int(0)), Err(Error::OutOfBounds)));
}

#[test]
fn pointer_arithmetic_matches_element_strides() {
    let ffi = Ffi::empty();
    let a = ffi.new("int[4]").unwrap();
    for i in 0..4 {
        a.write_index(i, &Value::Int(i * 11)).unwrap();
    }
    let p = a.add(0).unwrap();
    let p2 = p.add(2).unwrap();
    assert_eq!(p2.diff(&p).unwrap(), 2);
    assert_eq!(int_of(p2.read_index(0).unwrap()), 22);
    // (p + n) - n walks back to p.
    assert_eq!(p2.sub(2).unwrap().diff(&p).unwrap(), 0);
}

#[test]
fn void_pointer_accepts_any_object_pointer() {
    let ffi = Ffi::cdef("struct H { void *vp; double *dp; };", None).unwrap();
    let h = ffi.new("struct H").unwrap();
    let n = ffi.new("int").unwrap();
    let p = Ffi::addr(&n).unwrap();

    h.write_field("vp", &Value::CData(p.clone())).unwrap();
    assert!(matches!(
        h.write_field("dp", &Value::CData(p)),
        Err(Error::IncompatibleAssignment { .. })
    ));
}

#[test]
fn owned_data_does_not_leak_into_pointers() {
    let ffi = Ffi::cdef("struct O { int *ip; };", None).unwrap();
    let o = ffi.new("struct O").unwrap();
    let owned = ffi.new("int").unwrap();
    assert!(matches!(
        o.write_field("ip", &Value::CData(owned)),
        Err(Error::AssignOwnedPointer)
    ));
}

#[test]
fn variadic_printf_formats_arguments() {
    let ffi = Ffi::cdef("int printf(const char *format, ...);", None).unwrap();
    let n = int_of(ffi.call("printf", &[Value::Str("x=%d\n".into()), Value::Int(42)]).unwrap());
    assert!(n > 0);
}

#[test]
fn variadic_calls_respect_the_fixed_count() {
    let ffi = Ffi::cdef("int printf(const char *format, ...);", None).unwrap();
    assert!(matches!(
        ffi.call("printf", &[]),
        Err(Error::WrongArgCount { expected: 1, got: 0 })
    ));
}

#[test]
fn snprintf_writes_into_engine_memory() {
    let ffi = Ffi::cdef(
        "int snprintf(char *str, size_t size, const char *format, ...);",
        None,
    )
    .unwrap();
    let buf = ffi.new("char[32]").unwrap();
    let n = ffi
        .call(
            "snprintf",
            &[
                Value::CData(buf.clone()),
                Value::Int(32),
                Value::Str("%d-%d".into()),
                Value::Int(4),
                Value::Int(2),
            ],
        )
        .unwrap();
    assert_eq!(int_of(n), 3);
    assert_eq!(Ffi::string(&buf, None).unwrap(), "4-2");
}

#[test]
fn returned_c_strings_become_host_strings() {
    // atoi exercises string passing, getenv pointer returns.
    let ffi = Ffi::cdef(
        "int atoi(const char *nptr);
         char *getenv(const char *name);",
        None,
    )
    .unwrap();
    assert_eq!(int_of(ffi.call("atoi", &[Value::Str("42".into())]).unwrap()), 42);

    match ffi.call("getenv", &[Value::Str("PATH".into())]).unwrap() {
        Value::CData(p) => {
            assert!(!Ffi::is_null(&p).unwrap());
            assert!(!Ffi::string(&p, None).unwrap().is_empty());
        }
        Value::Null => {} // PATH genuinely unset; nothing more to check.
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn const_char_pointer_returns_read_as_strings() {
    // strerror returns a NUL-terminated message we may not modify.
    let ffi = Ffi::cdef("const char *strerror(int errnum);", None).unwrap();
    match ffi.call("strerror", &[Value::Int(0)]).unwrap() {
        Value::Str(s) => assert!(!s.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn cast_to_own_type_is_bit_identical() {
    let ffi = Ffi::empty();
    let c = ffi.new("int32_t").unwrap();
    Ffi::memset(&c, 0x7f, 4).unwrap();
    let t = Ffi::type_of(&c);
    let copy = Ffi::cast_typed(&t, &Value::CData(c.clone())).unwrap();
    assert_eq!(
        Ffi::memcmp(&Value::CData(c), &Value::CData(copy), 4).unwrap(),
        0
    );
}

#[test]
fn memcpy_accepts_string_sources() {
    let ffi = Ffi::empty();
    let buf = ffi.new("char[8]").unwrap();
    Ffi::memcpy(&buf, &Value::Str("hi".into()), 2).unwrap();
    assert_eq!(Ffi::string(&buf, None).unwrap(), "hi");
    assert!(matches!(
        Ffi::memcpy(&buf, &Value::Str("way too long".into()), 12),
        Err(Error::OutOfBounds)
    ));
}

#[test]
fn enum_constants_are_readable_symbols() {
    let ffi = Ffi::cdef("enum rc { RC_OK = 0, RC_FAIL = -1, RC_RETRY = 5 };", None).unwrap();
    assert_eq!(int_of(ffi.get("RC_RETRY").unwrap()), 5);
    assert_eq!(int_of(ffi.get("RC_FAIL").unwrap()), -1);
}

#[test]
fn global_variables_resolve_and_read() {
    let ffi = Ffi::cdef("extern char **environ;", None).unwrap();
    match ffi.get("environ").unwrap() {
        Value::CData(p) => assert!(!Ffi::is_null(&p).unwrap()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn function_symbols_read_as_callable_pointers() {
    let ffi = Ffi::cdef("unsigned long strlen(const char *s);", None).unwrap();
    match ffi.get("strlen").unwrap() {
        Value::CData(f) => {
            let n = Ffi::call_data(&f, &[Value::Str("four".into())]).unwrap();
            assert_eq!(int_of(n), 4);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn iteration_observes_element_order() {
    let ffi = Ffi::empty();
    let a = ffi.new("int16_t[3]").unwrap();
    for i in 0..3 {
        a.write_index(i, &Value::Int(100 + i)).unwrap();
    }
    let values: Vec<i64> = a.iter().unwrap().map(|v| int_of(v.unwrap())).collect();
    assert_eq!(values, vec![100, 101, 102]);
}

#[test]
fn preloaded_scopes_are_shared() {
    let path = std::env::temp_dir().join("cdef_engine_scope_test.h");
    std::fs::write(
        &path,
        "#define FFI_SCOPE \"engine_test_scope\"\nunsigned long strlen(const char *s);\n",
    )
    .unwrap();

    assert_eq!(cdef::preload(path.to_str().unwrap()), 1);
    let ffi = Ffi::scope("engine_test_scope").unwrap();
    assert_eq!(int_of(ffi.call("strlen", &[Value::Str("scope".into())]).unwrap()), 5);

    assert!(matches!(
        Ffi::scope("never_registered"),
        Err(Error::UnknownScope(_))
    ));
}

#[test]
fn missing_symbols_fail_the_cdef() {
    assert!(matches!(
        Ffi::cdef("int this_function_does_not_exist_anywhere(int);", None),
        Err(Error::SymbolResolve(_))
    ));
}

#[test]
fn struct_returns_copy_into_owned_data() {
    // div_t div(int numerator, int denominator); returns a small struct
    // by value.
    let ffi = Ffi::cdef(
        "typedef struct { int quot; int rem; } div_t;
         div_t div(int numerator, int denominator);",
        None,
    )
    .unwrap();
    match ffi.call("div", &[Value::Int(7), Value::Int(2)]).unwrap() {
        Value::CData(r) => {
            assert_eq!(int_of(r.read_field("quot").unwrap()), 3);
            assert_eq!(int_of(r.read_field("rem").unwrap()), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn struct_by_value_arguments_pass_through() {
    // ldiv takes two longs; exercise multiple fixed arguments and a
    // struct return together.
    let ffi = Ffi::cdef(
        "typedef struct { long quot; long rem; } ldiv_t;
         ldiv_t ldiv(long numerator, long denominator);",
        None,
    )
    .unwrap();
    match ffi.call("ldiv", &[Value::Int(9), Value::Int(4)]).unwrap() {
        Value::CData(r) => {
            assert_eq!(int_of(r.read_field("quot").unwrap()), 2);
            assert_eq!(int_of(r.read_field("rem").unwrap()), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn null_pointer_dereference_is_reported() {
    let ffi = Ffi::empty();
    let p = ffi.cast("int*", &Value::Null).unwrap();
    assert!(Ffi::is_null(&p).unwrap());
    assert!(matches!(p.read_index(0), Err(Error::NullDeref)));
}

#[test]
fn freeing_unowned_data_releases_it() {
    let ffi = Ffi::empty();
    let cd = ffi.new_with("int", false, false).unwrap();
    Ffi::free(&cd).unwrap();
    assert!(matches!(cd.read_field("x"), Err(Error::UseAfterFree)));
}

#[test]
fn array_type_builds_nested_dimensions() {
    let ffi = Ffi::empty();
    let elem = ffi.ctype("int").unwrap();
    let arr = Ffi::array_type(&elem, &[2, 3]).unwrap();
    assert_eq!(arr.name(), "int32_t[2][3]");
    assert_eq!(arr.size(), 24);
    assert_eq!(arr.array_length(), Some(2));
}

