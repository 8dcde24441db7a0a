//! Configuration gating, isolated in its own process because the switch is
//! process-wide.

use cdef::{Enable, Error, Ffi, FfiConfig, Value, configure, initialize};

#[test]
fn enable_modes_gate_the_entry_points() {
    configure(FfiConfig {
        enable: Enable::Off,
        preload: None,
    });
    assert!(matches!(Ffi::cdef("int x;", None), Err(Error::Disabled)));
    assert!(matches!(Ffi::scope("anything"), Err(Error::Disabled)));

    // Preload mode: runtime definitions stay blocked, preloaded scopes and
    // data calls work.
    let path = std::env::temp_dir().join("cdef_config_scope_test.h");
    std::fs::write(
        &path,
        "#define FFI_SCOPE \"config_test_scope\"\nint atoi(const char *nptr);\n",
    )
    .unwrap();
    configure(FfiConfig {
        enable: Enable::Preload,
        preload: Some(path.to_str().unwrap().to_string()),
    });
    initialize();

    assert!(matches!(
        Ffi::cdef("int atoi(const char *nptr);", None),
        Err(Error::Disabled)
    ));
    let ffi = Ffi::scope("config_test_scope").unwrap();
    match ffi.call("atoi", &[Value::Str("7".into())]).unwrap() {
        Value::Int(7) => {}
        other => panic!("unexpected {other:?}"),
    }

    configure(FfiConfig::default());
    assert!(Ffi::cdef("int atoi(const char *nptr);", None).is_ok());

    // Skip-on-error preload behavior, still serialized behind the same
    // process-wide switch.
    let good = std::env::temp_dir().join("cdef_config_good.h");
    std::fs::write(
        &good,
        "#define FFI_SCOPE \"config_skip_scope\"\nint abs(int j);\n",
    )
    .unwrap();
    let list = format!("/does/not/exist.h;{}", good.to_str().unwrap());
    assert_eq!(cdef::preload(&list), 1);
    assert!(Ffi::scope("config_skip_scope").is_ok());
}
