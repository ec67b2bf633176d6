//! The built-in function registry.
//!
//! Natives are ordinary globals holding `Native` objects; the VM installs
//! every entry of [`registry`] at construction time. A native reports
//! failure by returning `Err`, which the VM surfaces as a runtime error with
//! the native's message.

use indexmap::IndexMap;

use lox_runtime::{BoundMethod, NativeCtx, NativeError, NativeFn, Object, Value};

/// All built-ins, in registration order.
pub fn registry() -> IndexMap<&'static str, NativeFn> {
    let mut natives: IndexMap<&'static str, NativeFn> = IndexMap::new();

    // Property tools.
    natives.insert("has", native_has as NativeFn);
    natives.insert("get", native_get as NativeFn);
    natives.insert("set", native_set as NativeFn);

    // Array/string tools.
    natives.insert("size", native_size as NativeFn);

    // General tools.
    natives.insert("getTypeName", native_get_type_name as NativeFn);
    natives.insert("toString", native_to_string as NativeFn);
    natives.insert("clock", native_clock as NativeFn);

    natives
}

fn expect_args(args: &[Value], want: usize) -> Result<(), NativeError> {
    if args.len() != want {
        return Err(NativeError::new(format!(
            "Expected {want} arguments but got {}",
            args.len()
        )));
    }
    Ok(())
}

/// `has(v, name)` -> true iff `v` is an instance with field `name`. Never
/// errors: non-instances and non-string names simply report false.
fn native_has(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 2)?;
    let Some(name) = ctx.heap.as_string(args[1]) else {
        return Ok(Value::Bool(false));
    };
    let Some(reference) = args[0].as_obj() else {
        return Ok(Value::Bool(false));
    };
    if !matches!(ctx.heap.get(reference), Object::Instance(_)) {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(
        ctx.heap.instance_field(reference, name).is_some(),
    ))
}

/// `get(v, name)` -> the field, or the method bound to `v`.
fn native_get(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 2)?;
    let Some(name) = ctx.heap.as_string(args[1]) else {
        return Err(NativeError::new("Cannot have non-string property of object"));
    };

    let receiver = args[0];
    if let Some(reference) = receiver.as_obj() {
        if matches!(ctx.heap.get(reference), Object::Instance(_)) {
            if let Some(value) = ctx.heap.instance_field(reference, name) {
                return Ok(value);
            }
            let class = ctx.heap.instance(reference).class;
            if let Some(Value::Obj(method)) = ctx.heap.class_method(class, name) {
                let bound = ctx.heap.alloc(Object::BoundMethod(BoundMethod {
                    receiver,
                    method,
                }));
                return Ok(Value::Obj(bound));
            }
        }
    }

    Err(NativeError::new(format!(
        "Undefined property '{}' of object '{}'.",
        ctx.heap.str_chars(name),
        ctx.heap.stringify(receiver)
    )))
}

/// `set(instance, name, value)` -> nil.
fn native_set(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 3)?;
    let Some(name) = ctx.heap.as_string(args[1]) else {
        return Err(NativeError::new("Cannot have non-string property of object"));
    };
    let Some(reference) = args[0].as_obj() else {
        return Err(NativeError::new("Only instances have fields."));
    };
    if !matches!(ctx.heap.get(reference), Object::Instance(_)) {
        return Err(NativeError::new("Only instances have fields."));
    }
    ctx.heap.set_instance_field(reference, name, args[2]);
    Ok(Value::Nil)
}

/// `size(v)` -> length of a string or array.
fn native_size(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 1)?;
    if let Some(reference) = args[0].as_obj() {
        match ctx.heap.get(reference) {
            Object::String(s) => return Ok(Value::Number(s.chars.len() as f64)),
            Object::Array(a) => return Ok(Value::Number(a.items.len() as f64)),
            _ => {}
        }
    }
    Err(NativeError::new(
        "Only strings, arrays, and tables have size/length",
    ))
}

/// `getTypeName(v)` -> the kind of value, or the class name of an instance.
fn native_get_type_name(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 1)?;
    let name = match args[0] {
        Value::Nil => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Obj(reference) => match ctx.heap.get(reference) {
            Object::Class(_) => "class",
            Object::Closure(_) => "closure",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Upvalue(_) => "upvalue",
            Object::String(_) => "string",
            Object::Array(_) => "array",
            Object::BoundMethod(_) => "closure",
            Object::Instance(instance) => {
                // The class name is already interned; hand it back directly.
                let class = instance.class;
                let name = ctx.heap.class(class).name;
                return Ok(name.into());
            }
        },
    };
    Ok(ctx.heap.intern_value(name))
}

/// `toString(v)` -> the printed form as an interned string.
fn native_to_string(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 1)?;
    let text = ctx.heap.stringify(args[0]);
    Ok(ctx.heap.intern_value(&text))
}

/// `clock()` -> seconds since the VM started, as a number.
fn native_clock(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    expect_args(args, 0)?;
    Ok(Value::Number(ctx.started.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_runtime::Heap;
    use std::time::Instant;

    fn ctx(heap: &mut Heap) -> NativeCtx<'_> {
        NativeCtx {
            heap,
            started: Instant::now(),
        }
    }

    #[test]
    fn registry_lists_all_builtins_in_order() {
        let names: Vec<_> = registry().keys().copied().collect();
        assert_eq!(
            names,
            vec!["has", "get", "set", "size", "getTypeName", "toString", "clock"]
        );
    }

    #[test]
    fn clock_is_nonnegative_number() {
        let mut heap = Heap::new();
        let mut ctx = ctx(&mut heap);
        match native_clock(&mut ctx, &[]) {
            Ok(Value::Number(n)) => assert!(n >= 0.0),
            other => panic!("unexpected clock result: {other:?}"),
        }
    }

    #[test]
    fn arg_count_is_enforced() {
        let mut heap = Heap::new();
        let mut ctx = ctx(&mut heap);
        let err = native_clock(&mut ctx, &[Value::Nil]).expect_err("arity error");
        assert_eq!(err.0, "Expected 0 arguments but got 1");
    }

    #[test]
    fn size_of_strings_and_arrays() {
        let mut heap = Heap::new();
        let text = heap.intern_value("four");
        let array = heap.alloc(Object::Array(lox_runtime::Array {
            items: vec![Value::Nil; 7],
        }));
        let mut ctx = ctx(&mut heap);
        assert_eq!(native_size(&mut ctx, &[text]), Ok(Value::Number(4.0)));
        assert_eq!(
            native_size(&mut ctx, &[Value::Obj(array)]),
            Ok(Value::Number(7.0))
        );
        assert!(native_size(&mut ctx, &[Value::Number(3.0)]).is_err());
    }

    #[test]
    fn type_names_for_primitives() {
        let mut heap = Heap::new();
        let text = heap.intern_value("s");
        let mut ctx = ctx(&mut heap);
        for (value, expected) in [
            (Value::Nil, "nil"),
            (Value::Bool(true), "boolean"),
            (Value::Number(1.0), "number"),
            (text, "string"),
        ] {
            let result = native_get_type_name(&mut ctx, &[value]).expect("type name");
            assert_eq!(ctx.heap.stringify(result), expected);
        }
    }

    #[test]
    fn has_is_false_for_non_instances() {
        let mut heap = Heap::new();
        let name = heap.intern_value("field");
        let mut ctx = ctx(&mut heap);
        assert_eq!(
            native_has(&mut ctx, &[Value::Number(1.0), name]),
            Ok(Value::Bool(false))
        );
        // Non-string name is false, not an error.
        assert_eq!(
            native_has(&mut ctx, &[Value::Number(1.0), Value::Nil]),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn to_string_interns_rendering() {
        let mut heap = Heap::new();
        let expected = heap.intern_value("2.5");
        let mut ctx = ctx(&mut heap);
        let rendered = native_to_string(&mut ctx, &[Value::Number(2.5)]).expect("renders");
        assert_eq!(rendered, expected);
    }
}
