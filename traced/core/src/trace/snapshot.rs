//! Size-bounded capture of arguments and results.
//!
//! Capturing must never fail the traced call: any error or panic while
//! converting a value is recorded as an unserializable placeholder.

use std::any::type_name;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use traced_proto::prelude::{Snapshot, Value};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("cannot capture {type_name}: {reason}")]
    Unsupported {
        type_name: &'static str,
        reason: String,
    },

    #[error("capturing {0} panicked")]
    Panicked(&'static str),
}

/// Conversion of a traced argument or result into a [`Value`].
pub trait Capture {
    fn capture(&self) -> Result<Value, SnapshotError>;

    fn type_name(&self) -> &'static str {
        type_name::<Self>()
    }
}

/// Captures `value` and bounds its rendering to `max_bytes`.
pub fn capture<T: Capture + ?Sized>(value: &T, max_bytes: usize) -> Snapshot {
    match panic::catch_unwind(AssertUnwindSafe(|| value.capture())) {
        Ok(Ok(captured)) => bound(captured, max_bytes),
        Ok(Err(err)) => {
            log::debug!("snapshot skipped: {err}");
            Snapshot::Unserializable {
                type_name: value.type_name().to_string(),
            }
        }
        Err(_) => {
            log::debug!("snapshot skipped: {}", SnapshotError::Panicked(value.type_name()));
            Snapshot::Unserializable {
                type_name: value.type_name().to_string(),
            }
        }
    }
}

/// Keeps `value` inline when its rendering fits, otherwise keeps a prefix
/// cut at a character boundary.
pub fn bound(value: Value, max_bytes: usize) -> Snapshot {
    let rendered = value.to_string();
    if rendered.len() <= max_bytes {
        return Snapshot::Inline(value);
    }
    let mut cut = max_bytes;
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Snapshot::Truncated {
        preview: rendered[..cut].to_string(),
        original_bytes: rendered.len() as u64,
    }
}

/// Captures any `Serialize` value through its JSON form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> Capture for Json<T> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        serde_json::to_value(&self.0)
            .map(|json| Value::from_json(&json))
            .map_err(|e| SnapshotError::Unsupported {
                type_name: type_name::<T>(),
                reason: e.to_string(),
            })
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Records only the type name of a value that has no meaningful capture
/// (handles, sockets, closures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Opaque<T>(pub T);

impl<T> Opaque<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Capture for Opaque<T> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Opaque(type_name::<T>().to_string()))
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

macro_rules! capture_as {
    ($variant:ident, $target:ty: $($t:ty),*) => {
        $(
            impl Capture for $t {
                fn capture(&self) -> Result<Value, SnapshotError> {
                    Ok(Value::$variant(*self as $target))
                }
            }
        )*
    };
}

capture_as!(Int, i64: i8, i16, i32, i64, isize, u8, u16, u32);
capture_as!(UInt, u64: u64, usize);
capture_as!(Float, f64: f32, f64);

impl Capture for () {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Nil)
    }
}

impl Capture for bool {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Bool(*self))
    }
}

impl Capture for char {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Text(self.to_string()))
    }
}

impl Capture for str {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Text(self.to_string()))
    }
}

impl Capture for String {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Text(self.clone()))
    }
}

impl Capture for Value {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(self.clone())
    }
}

impl Capture for serde_json::Value {
    fn capture(&self) -> Result<Value, SnapshotError> {
        Ok(Value::from_json(self))
    }
}

impl<T: Capture + ?Sized> Capture for &T {
    fn capture(&self) -> Result<Value, SnapshotError> {
        (**self).capture()
    }

    fn type_name(&self) -> &'static str {
        (**self).type_name()
    }
}

impl<T: Capture + ?Sized> Capture for Box<T> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        (**self).capture()
    }
}

impl<T: Capture> Capture for Option<T> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        match self {
            Some(inner) => inner.capture(),
            None => Ok(Value::Nil),
        }
    }
}

impl<T: Capture> Capture for [T] {
    fn capture(&self) -> Result<Value, SnapshotError> {
        self.iter()
            .map(Capture::capture)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }
}

impl<T: Capture, const N: usize> Capture for [T; N] {
    fn capture(&self) -> Result<Value, SnapshotError> {
        self.as_slice().capture()
    }
}

impl<T: Capture> Capture for Vec<T> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        self.as_slice().capture()
    }
}

impl<K: Display, V: Capture> Capture for BTreeMap<K, V> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        self.iter()
            .map(|(k, v)| Ok((k.to_string(), v.capture()?)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Map)
    }
}

impl<K: Display, V: Capture, S> Capture for HashMap<K, V, S> {
    fn capture(&self) -> Result<Value, SnapshotError> {
        let mut entries = self
            .iter()
            .map(|(k, v)| Ok((k.to_string(), v.capture()?)))
            .collect::<Result<Vec<_>, SnapshotError>>()?;
        // Iteration order is random; sort so equal maps render equally.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Value::Map(entries))
    }
}

macro_rules! capture_tuple {
    ($($name:ident),+) => {
        impl<$($name: Capture),+> Capture for ($($name,)+) {
            #[allow(non_snake_case)]
            fn capture(&self) -> Result<Value, SnapshotError> {
                let ($($name,)+) = self;
                Ok(Value::List(vec![$($name.capture()?),+]))
            }
        }
    };
}

capture_tuple!(A);
capture_tuple!(A, B);
capture_tuple!(A, B, C);
capture_tuple!(A, B, C, D);
capture_tuple!(A, B, C, D, E);
capture_tuple!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;
    use traced_proto::types::TRUNCATED_MARKER;

    struct Exploding;

    impl Capture for Exploding {
        fn capture(&self) -> Result<Value, SnapshotError> {
            panic!("no capture for you")
        }
    }

    struct Refusing;

    impl Capture for Refusing {
        fn capture(&self) -> Result<Value, SnapshotError> {
            Err(SnapshotError::Unsupported {
                type_name: "Refusing",
                reason: "closed handle".to_string(),
            })
        }
    }

    #[test]
    fn test_tuple_args_capture_in_order() {
        let snapshot = capture(&(3, "x", Some(1.5)), 4096);
        assert_eq!(snapshot.render(), r#"[3,"x",1.5]"#);
    }

    #[test]
    fn test_oversized_value_is_truncated_with_marker() {
        let big: Vec<u32> = (0..10_000).collect();
        let snapshot = capture(&big, 64);
        match &snapshot {
            Snapshot::Truncated {
                preview,
                original_bytes,
            } => {
                assert!(preview.len() <= 64);
                assert!(*original_bytes > 64);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
        assert!(snapshot.render().contains(TRUNCATED_MARKER));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "é".repeat(100);
        match capture(&text, 10) {
            Snapshot::Truncated { preview, .. } => {
                assert!(preview.len() <= 10);
                assert!(preview.starts_with('"'));
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_failures_become_unserializable() {
        assert!(matches!(
            capture(&Refusing, 4096),
            Snapshot::Unserializable { .. }
        ));
        assert!(matches!(
            capture(&Exploding, 4096),
            Snapshot::Unserializable { .. }
        ));
    }

    #[test]
    fn test_json_and_opaque_adapters() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        assert_eq!(
            capture(&Json(Point { x: 1, y: 2 }), 4096).render(),
            r#"{"x":1,"y":2}"#
        );
        let opaque = capture(&Opaque(std::sync::Mutex::new(0)), 4096);
        assert!(opaque.render().contains("Mutex"));
    }

    #[test]
    fn test_hash_map_renders_sorted() {
        let map: HashMap<&str, i32> = [("b", 2), ("a", 1), ("c", 3)].into_iter().collect();
        assert_eq!(capture(&map, 4096).render(), r#"{"a":1,"b":2,"c":3}"#);
    }
}
