//! Bootstrap of the primitive classes and the standard foreign
//! functions. `load_builtins` builds the Object/Class metaclass knot,
//! hangs the primitive classes off it and registers the global bindings
//! the compiler pre-binds into every main function.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::context::Context;
use crate::memory::{Ptr, Root};
use crate::strings;
use crate::value::{Array, Class, ForeignFunction, Object, Value};
use crate::vm::{Vm, VmError};

type Coerced<T> = Result<T, VmError>;

/// Builds a script exception carrying `text`.
fn throw<T>(ctx: &Context, text: String) -> Result<T, VmError> {
    Err(VmError::Exception(Value::Str(ctx.alloc(text).clone())))
}

/// Renders a coercion failure, naming the offending value's class via
/// the script-level `inspect` protocol where possible.
fn type_error<T>(vm: &mut Vm<'_>, who: &str, value: &Value, expected: &str) -> Coerced<T> {
    let class = Value::Class(value.class_of(vm.ctx()));
    let actual = match vm.send(&class, "inspect") {
        Ok(result) => match &*result {
            Value::Str(s) => s.get().clone(),
            _ => value.inspect(),
        },
        Err(_) => value.inspect(),
    };
    throw(
        vm.ctx(),
        format!("{}: encountered {} instead of {}", who, actual, expected),
    )
}

fn coerce_nil(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<()> {
    match value {
        Value::Nil => Ok(()),
        _ => type_error(vm, who, value, "Nil"),
    }
}

fn coerce_bool(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => type_error(vm, who, value, "Bool"),
    }
}

fn coerce_int(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        _ => type_error(vm, who, value, "Int"),
    }
}

fn coerce_string(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<Ptr<String>> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        _ => type_error(vm, who, value, "String"),
    }
}

fn coerce_array(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<Ptr<Array>> {
    match value {
        Value::Array(a) => Ok(a.clone()),
        _ => type_error(vm, who, value, "Array"),
    }
}

fn coerce_class(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<Ptr<Class>> {
    match value {
        Value::Class(c) => Ok(c.clone()),
        _ => type_error(vm, who, value, "Class"),
    }
}

/// Accepts both script and foreign functions, as a value.
fn coerce_function(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<Value> {
    match value {
        Value::Function(_) | Value::Foreign(_) => Ok(value.clone()),
        _ => type_error(vm, who, value, "Function"),
    }
}

/// Accepts both native and foreign objects, as a value.
fn coerce_object(vm: &mut Vm<'_>, value: &Value, who: &str) -> Coerced<Value> {
    match value {
        Value::Object(_) | Value::ForeignObject(_) => Ok(value.clone()),
        _ => type_error(vm, who, value, "Object"),
    }
}

/// An index into a sequence of length `len`, in `[0, len]`. Negative
/// indices count from the end.
fn coerce_uindex(vm: &mut Vm<'_>, len: usize, value: &Value, who: &str) -> Coerced<usize> {
    let signed = coerce_int(vm, value, who)?;
    let index = if signed >= 0 {
        signed as usize
    } else {
        len.wrapping_sub(signed.unsigned_abs() as usize)
    };
    if index > len {
        return throw(vm.ctx(), format!("{}: index out of range", who));
    }
    Ok(index)
}

/// An index into a sequence of length `len`, in `[0, len)`.
fn coerce_index(vm: &mut Vm<'_>, len: usize, value: &Value, who: &str) -> Coerced<usize> {
    let index = coerce_uindex(vm, len, value, who)?;
    if index == len {
        return throw(vm.ctx(), format!("{}: index out of range", who));
    }
    Ok(index)
}

/// A clamped `[lower, upper)` range over a sequence of length `len`.
fn coerce_range(
    vm: &mut Vm<'_>,
    len: usize,
    lower: &Value,
    upper: &Value,
    who: &str,
) -> Coerced<(usize, usize)> {
    let clamp = |signed: i64| -> usize {
        if signed >= 0 {
            std::cmp::min(signed as usize, len)
        } else {
            len - std::cmp::min(signed.unsigned_abs() as usize, len)
        }
    };
    let a = clamp(coerce_int(vm, lower, who)?);
    let b = clamp(coerce_int(vm, upper, who)?);
    Ok((a, std::cmp::max(a, b)))
}

fn define(ctx: &Context, class: &Ptr<Class>, name: &str, function: ForeignFunction) {
    let function = ctx.alloc(function);
    class
        .get_mut()
        .define(ctx, name, Value::Foreign(function.clone()));
}

fn define_meta(ctx: &Context, class: &Ptr<Class>, name: &str, function: ForeignFunction) {
    let meta = class.get().meta().clone();
    define(ctx, &meta, name, function);
}

fn identity(value: &Value) -> i64 {
    value.cell_address().unwrap_or(0) as i64
}

fn load_object(ctx: &mut Context) {
    let cls = ctx.classes().object.clone();
    ctx.define_builtin("Object", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let this = coerce_object(vm, this, "Object.==")?;
            let same = match (&this, &args[0]) {
                (Value::Object(x), Value::Object(y)) => x.ptr_eq(y),
                (Value::ForeignObject(x), Value::ForeignObject(y)) => x.ptr_eq(y),
                _ => false,
            };
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "!=",
        ForeignFunction::method(1, |vm, this, args| {
            let equal = vm.send_call(this, "==", args)?;
            vm.send(&equal, "!")
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let obj = coerce_object(vm, &args[0], "Object.hash")?;
            Ok(vm.ctx().root(Value::Int(identity(&obj))))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let obj = coerce_object(vm, &args[0], "Object.inspect")?;
            let text = format!("<Object#{:x}>", identity(&obj));
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "display",
        ForeignFunction::lambda(1, |vm, args| vm.send(&args[0], "inspect")),
    );
    define(
        ctx,
        &cls,
        "class",
        ForeignFunction::lambda(1, |vm, args| {
            let class = args[0].class_of(vm.ctx());
            Ok(vm.ctx().root(Value::Class(class)))
        }),
    );
    define(
        ctx,
        &cls,
        "instance?",
        ForeignFunction::method(1, |vm, this, args| {
            let base = coerce_class(vm, &args[0], "Object.instance?")?;
            let mut class = this.class_of(vm.ctx());
            let result = loop {
                if class.ptr_eq(&base) {
                    break true;
                }
                match class.get().base.clone() {
                    Some(next) => class = next,
                    None => break false,
                }
            };
            Ok(vm.ctx().root(Value::Bool(result)))
        }),
    );
    define(
        ctx,
        &cls,
        "send",
        ForeignFunction::method(1, |vm, this, args| {
            let msg = coerce_string(vm, &args[0], "Object.send")?;
            let msg = msg.get().clone();
            vm.send(this, &msg)
        }),
    );

    define_meta(
        ctx,
        &cls,
        "allocate",
        ForeignFunction::lambda(1, |vm, args| {
            let class = coerce_class(vm, &args[0], "Object.class.allocate")?;
            let object = vm.ctx().alloc(Object::new(class));
            Ok(vm.ctx().root(Value::Object(object.clone())))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let class = coerce_class(vm, &args[0], "Object.class.inspect")?;
            let text = if class.ptr_eq(&vm.ctx().classes().object) {
                "Object".to_owned()
            } else {
                format!("Object#{:x}", class.address())
            };
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
}

fn load_class(ctx: &mut Context) {
    let cls = ctx.classes().class.clone();
    ctx.define_builtin("Class", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_class(vm, this, "Class.==")?;
            let same = matches!(&args[0], Value::Class(y) if x.ptr_eq(y));
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_class(vm, &args[0], "Class.hash")?;
            Ok(vm.ctx().root(Value::Int(x.address() as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let class = coerce_class(vm, &args[0], "Class.inspect")?;
            let text = if class.ptr_eq(&vm.ctx().classes().class) {
                "Class".to_owned()
            } else {
                format!("Class#{:x}", class.address())
            };
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "subclass",
        ForeignFunction::lambda(1, |vm, args| {
            let base = coerce_class(vm, &args[0], "Class.subclass")?;
            let class = Class::subclass(vm.ctx(), &base);
            Ok(vm.ctx().root(Value::Class(class.clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "superclass",
        ForeignFunction::lambda(1, |vm, args| {
            let class = coerce_class(vm, &args[0], "Class.superclass")?;
            let base = class.get().base.clone();
            Ok(vm.ctx().root(match base {
                Some(base) => Value::Class(base),
                None => Value::Nil,
            }))
        }),
    );
    define(
        ctx,
        &cls,
        "lookup",
        ForeignFunction::method(1, |vm, this, args| {
            let class = coerce_class(vm, this, "Class.lookup")?;
            let name = coerce_string(vm, &args[0], "Class.lookup")?;
            let method = class.get_mut().lookup(name.get());
            Ok(vm.ctx().root(method.unwrap_or(Value::Nil)))
        }),
    );
    define(
        ctx,
        &cls,
        "define",
        ForeignFunction::method(2, |vm, this, args| {
            let class = coerce_class(vm, this, "Class.define")?;
            let name = coerce_string(vm, &args[0], "Class.define")?;
            let name = name.get().clone();
            class.get_mut().define(vm.ctx(), &name, args[1].clone());
            Ok(vm.ctx().root(Value::Nil))
        }),
    );
    define(
        ctx,
        &cls,
        "undefine",
        ForeignFunction::method(1, |vm, this, args| {
            let class = coerce_class(vm, this, "Class.undefine")?;
            let name = coerce_string(vm, &args[0], "Class.undefine")?;
            class.get_mut().remove(name.get());
            Ok(vm.ctx().root(Value::Nil))
        }),
    );
}

fn load_nil(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().nil = cls.clone();
    ctx.define_builtin("nil", Value::Nil);
    ctx.define_builtin("Nil", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            coerce_nil(vm, this, "Nil.==")?;
            Ok(vm.ctx().root(Value::Bool(matches!(args[0], Value::Nil))))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, _args| Ok(vm.ctx().root(Value::Int(-1)))),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            coerce_nil(vm, &args[0], "Nil.inspect")?;
            let text = vm.ctx().alloc("nil".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("Nil".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
}

fn load_bool(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().boolean = cls.clone();
    ctx.define_builtin("true", Value::Bool(true));
    ctx.define_builtin("false", Value::Bool(false));
    ctx.define_builtin("Bool", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_bool(vm, this, "Bool.==")?;
            let same = matches!(args[0], Value::Bool(y) if x == y);
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_bool(vm, &args[0], "Bool.hash")?;
            Ok(vm.ctx().root(Value::Int(x as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_bool(vm, &args[0], "Bool.inspect")?;
            let text = vm.ctx().alloc(x.to_string());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "!",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_bool(vm, &args[0], "Bool.!")?;
            Ok(vm.ctx().root(Value::Bool(!x)))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("Bool".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
}

fn int_binop(
    ctx: &mut Context,
    cls: &Ptr<Class>,
    name: &'static str,
    op: fn(&mut Vm<'_>, i64, i64) -> Result<Value, VmError>,
) {
    define(
        ctx,
        cls,
        name,
        ForeignFunction::method(1, move |vm, this, args| {
            // Coerce inline; the method name is only spelled out on the
            // error path so the arithmetic hot path never allocates.
            let x = match this {
                Value::Int(x) => *x,
                _ => return type_error(vm, &format!("Int.{}", name), this, "Int"),
            };
            let y = match &args[0] {
                Value::Int(y) => *y,
                _ => return type_error(vm, &format!("Int.{}", name), &args[0], "Int"),
            };
            let result = op(vm, x, y)?;
            Ok(vm.ctx().root(result))
        }),
    );
}

fn load_int(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().int = cls.clone();
    ctx.define_builtin("Int", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_int(vm, this, "Int.==")?;
            let same = matches!(args[0], Value::Int(y) if x == y);
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_int(vm, &args[0], "Int.hash")?;
            Ok(vm.ctx().root(Value::Int(x)))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_int(vm, &args[0], "Int.inspect")?;
            let text = vm.ctx().alloc(x.to_string());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "~",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_int(vm, &args[0], "Int.~")?;
            match x.checked_neg() {
                Some(n) => Ok(vm.ctx().root(Value::Int(n))),
                None => throw(vm.ctx(), "Int overflow".to_owned()),
            }
        }),
    );
    int_binop(ctx, &cls, "+", |vm, x, y| match x.checked_add(y) {
        Some(z) => Ok(Value::Int(z)),
        None => throw(vm.ctx(), "Int overflow".to_owned()),
    });
    int_binop(ctx, &cls, "-", |vm, x, y| match x.checked_sub(y) {
        Some(z) => Ok(Value::Int(z)),
        None => throw(vm.ctx(), "Int overflow".to_owned()),
    });
    int_binop(ctx, &cls, "*", |vm, x, y| match x.checked_mul(y) {
        Some(z) => Ok(Value::Int(z)),
        None => throw(vm.ctx(), "Int overflow".to_owned()),
    });
    int_binop(ctx, &cls, "/", |vm, x, y| {
        if y == 0 {
            return throw(vm.ctx(), "Division by zero".to_owned());
        }
        match x.checked_div(y) {
            Some(z) => Ok(Value::Int(z)),
            None => throw(vm.ctx(), "Int overflow".to_owned()),
        }
    });
    int_binop(ctx, &cls, "<", |_vm, x, y| Ok(Value::Bool(x < y)));
    int_binop(ctx, &cls, ">", |_vm, x, y| Ok(Value::Bool(x > y)));
    int_binop(ctx, &cls, "<=", |_vm, x, y| Ok(Value::Bool(x <= y)));
    int_binop(ctx, &cls, ">=", |_vm, x, y| Ok(Value::Bool(x >= y)));

    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("Int".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "max",
        ForeignFunction::lambda(1, |vm, _args| Ok(vm.ctx().root(Value::Int(i64::MAX)))),
    );
    define_meta(
        ctx,
        &cls,
        "min",
        ForeignFunction::lambda(1, |vm, _args| Ok(vm.ctx().root(Value::Int(i64::MIN)))),
    );
}

/// Byte-based substring, tolerant of multi-byte boundaries.
fn substring(string: &str, from: usize, to: usize) -> String {
    String::from_utf8_lossy(&string.as_bytes()[from..to]).into_owned()
}

fn load_string(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().string = cls.clone();
    ctx.define_builtin("String", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_string(vm, this, "String.==")?;
            let same = matches!(&args[0], Value::Str(y) if x.get() == y.get());
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_string(vm, &args[0], "String.hash")?;
            let mut hasher = DefaultHasher::new();
            x.get().hash(&mut hasher);
            Ok(vm.ctx().root(Value::Int(hasher.finish() as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_string(vm, &args[0], "String.inspect")?;
            let text = vm.ctx().alloc(strings::quote(x.get()));
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "display",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_string(vm, &args[0], "String.display")?;
            Ok(vm.ctx().root(Value::Str(x)))
        }),
    );
    define(
        ctx,
        &cls,
        "++",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_string(vm, this, "String.++")?;
            let arg = match &args[0] {
                Value::Str(_) => vm.ctx().root(args[0].clone()),
                other => {
                    let shown = vm.send(&other.clone(), "display")?;
                    vm.ctx().root(shown.clone())
                }
            };
            let y = coerce_string(vm, &arg, "String.++")?;
            let joined = format!("{}{}", x.get(), y.get());
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(joined).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "len",
        ForeignFunction::lambda(1, |vm, args| {
            let x = coerce_string(vm, &args[0], "String.len")?;
            Ok(vm.ctx().root(Value::Int(x.get().len() as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "get",
        ForeignFunction::method(1, |vm, this, args| {
            let x = coerce_string(vm, this, "String.get")?;
            let i = coerce_index(vm, x.get().len(), &args[0], "String.get")?;
            let text = substring(x.get(), i, i + 1);
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    let get = cls.get_mut().lookup("get").unwrap_or(Value::Nil);
    cls.get_mut().define(ctx, "[]", get);
    define(
        ctx,
        &cls,
        "slice",
        ForeignFunction::method(2, |vm, this, args| {
            let x = coerce_string(vm, this, "String.slice")?;
            let (a, b) = coerce_range(vm, x.get().len(), &args[0], &args[1], "String.slice")?;
            let text = substring(x.get(), a, b);
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("String".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
}

fn load_array(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().array = cls.clone();
    ctx.define_builtin("Array", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.==")?;
            let ys = coerce_array(vm, &args[0], "Array.==")?;
            let result = {
                if xs.get().len() != ys.get().len() {
                    false
                } else {
                    let mut equal = true;
                    let len = xs.get().len();
                    for i in 0..len {
                        let x = xs.get()[i].clone();
                        let y = ys.get()[i].clone();
                        let same = vm.send_call(&x, "==", &[y])?;
                        if !coerce_bool(vm, &same, "Array.==")? {
                            equal = false;
                            break;
                        }
                    }
                    equal
                }
            };
            Ok(vm.ctx().root(Value::Bool(result)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.hash")?;
            let mut result: u64 = 0;
            let len = xs.get().len();
            for i in 0..len {
                let x = xs.get()[i].clone();
                result = result.wrapping_add(coerce_int(vm, &x, "Array.hash")? as u64);
            }
            Ok(vm.ctx().root(Value::Int(result as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.inspect")?;
            let mut text = String::from("[");
            let len = xs.get().len();
            for i in 0..len {
                let x = xs.get()[i].clone();
                let shown = vm.send(&x, "inspect")?;
                let shown = coerce_string(vm, &shown, "Array.inspect")?;
                text.push_str(shown.get());
                if i + 1 < len {
                    text.push_str(", ");
                }
            }
            text.push(']');
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "len",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.len")?;
            Ok(vm.ctx().root(Value::Int(xs.get().len() as i64)))
        }),
    );
    define(
        ctx,
        &cls,
        "empty?",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.empty?")?;
            Ok(vm.ctx().root(Value::Bool(xs.get().is_empty())))
        }),
    );
    define(
        ctx,
        &cls,
        "first",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.first")?;
            match xs.get().first() {
                Some(x) => Ok(vm.ctx().root(x.clone())),
                None => throw(vm.ctx(), "Array.first: array is empty".to_owned()),
            }
        }),
    );
    define(
        ctx,
        &cls,
        "last",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.last")?;
            match xs.get().last() {
                Some(x) => Ok(vm.ctx().root(x.clone())),
                None => throw(vm.ctx(), "Array.last: array is empty".to_owned()),
            }
        }),
    );
    define(
        ctx,
        &cls,
        "get",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.get")?;
            let i = coerce_index(vm, xs.get().len(), &args[0], "Array.get")?;
            Ok(vm.ctx().root(xs.get()[i].clone()))
        }),
    );
    let get = cls.get_mut().lookup("get").unwrap_or(Value::Nil);
    cls.get_mut().define(ctx, "[]", get);
    define(
        ctx,
        &cls,
        "slice",
        ForeignFunction::method(2, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.slice")?;
            let (a, b) = coerce_range(vm, xs.get().len(), &args[0], &args[1], "Array.slice")?;
            let slice: Array = xs.get()[a..b].to_vec();
            Ok(vm.ctx().root(Value::Array(vm.ctx().alloc(slice).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "clone",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.clone")?;
            let copy = xs.get().clone();
            Ok(vm.ctx().root(Value::Array(vm.ctx().alloc(copy).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "set",
        ForeignFunction::method(2, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.set")?;
            let i = coerce_index(vm, xs.get().len(), &args[0], "Array.set")?;
            xs.get_mut()[i] = args[1].clone();
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    let set = cls.get_mut().lookup("set").unwrap_or(Value::Nil);
    cls.get_mut().define(ctx, "[]=", set);
    define(
        ctx,
        &cls,
        "insert",
        ForeignFunction::method(2, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.insert")?;
            let i = coerce_uindex(vm, xs.get().len(), &args[0], "Array.insert")?;
            xs.get_mut().insert(i, args[1].clone());
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "remove",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.remove")?;
            let i = coerce_index(vm, xs.get().len(), &args[0], "Array.remove")?;
            let removed = xs.get_mut().remove(i);
            Ok(vm.ctx().root(removed))
        }),
    );
    define(
        ctx,
        &cls,
        "push",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.push")?;
            xs.get_mut().push(args[0].clone());
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "pop",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.pop")?;
            match xs.get_mut().pop() {
                Some(x) => Ok(vm.ctx().root(x)),
                None => throw(vm.ctx(), "Array.pop: array is empty".to_owned()),
            }
        }),
    );
    define(
        ctx,
        &cls,
        "clear",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.clear")?;
            xs.get_mut().clear();
            Ok(vm.ctx().root(args[0].clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "map",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.map")?;
            let func = args[0].clone();
            let len = xs.get().len();
            for i in 0..len {
                let x = xs.get()[i].clone();
                let y = vm.call(&func, &[x])?;
                xs.get_mut()[i] = y.clone();
            }
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "filter",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.filter")?;
            let func = args[0].clone();
            let mut kept = 0;
            let len = xs.get().len();
            for i in 0..len {
                let x = xs.get()[i].clone();
                let verdict = vm.call(&func, &[x.clone()])?;
                if coerce_bool(vm, &verdict, "Array.filter")? {
                    xs.get_mut()[kept] = x;
                    kept += 1;
                }
            }
            xs.get_mut().truncate(kept);
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "reverse",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.reverse")?;
            xs.get_mut().reverse();
            Ok(vm.ctx().root(args[0].clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "sort",
        ForeignFunction::lambda(1, |vm, args| {
            let xs = coerce_array(vm, &args[0], "Array.sort")?;
            sort_with(vm, &xs, |vm, x, y| {
                let less = vm.send_call(x, "<", &[y.clone()])?;
                coerce_bool(vm, &less, "Array.sort")
            })?;
            Ok(vm.ctx().root(args[0].clone()))
        }),
    );
    define(
        ctx,
        &cls,
        "sort_by",
        ForeignFunction::method(1, |vm, this, args| {
            let xs = coerce_array(vm, this, "Array.sort_by")?;
            let func = args[0].clone();
            sort_with(vm, &xs, |vm, x, y| {
                let less = vm.call(&func, &[x.clone(), y.clone()])?;
                coerce_bool(vm, &less, "Array.sort_by")
            })?;
            Ok(vm.ctx().root(this.clone()))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("Array".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
    define_meta(
        ctx,
        &cls,
        "new",
        ForeignFunction::lambda(1, |vm, _args| {
            let array = vm.ctx().alloc(Array::new());
            Ok(vm.ctx().root(Value::Array(array.clone())))
        }),
    );
}

/// Insertion sort driven by a script-visible "less" predicate, so
/// comparator errors propagate instead of unwinding through a std sort.
fn sort_with(
    vm: &mut Vm<'_>,
    xs: &Ptr<Array>,
    mut less: impl FnMut(&mut Vm<'_>, &Value, &Value) -> Result<bool, VmError>,
) -> Result<(), VmError> {
    let items = vm.ctx().root(xs.get().clone());
    let mut sorted: Root<Array> = vm.ctx().root(Array::new());
    for x in items.iter() {
        let mut at = sorted.len();
        for (i, y) in sorted.iter().enumerate() {
            if less(vm, x, y)? {
                at = i;
                break;
            }
        }
        sorted.insert(at, x.clone());
    }
    *xs.get_mut() = sorted.clone();
    Ok(())
}

fn load_function(ctx: &mut Context) {
    let object = ctx.classes().object.clone();
    let cls: Ptr<Class> = Class::subclass(ctx, &object).clone();
    ctx.classes_mut().function = cls.clone();
    ctx.define_builtin("Function", Value::Class(cls.clone()));

    define(
        ctx,
        &cls,
        "==",
        ForeignFunction::method(1, |vm, this, args| {
            coerce_function(vm, this, "Function.==")?;
            let same = match (this, &args[0]) {
                (Value::Function(x), Value::Function(y)) => x.ptr_eq(y),
                (Value::Foreign(x), Value::Foreign(y)) => x.ptr_eq(y),
                _ => false,
            };
            Ok(vm.ctx().root(Value::Bool(same)))
        }),
    );
    define(
        ctx,
        &cls,
        "hash",
        ForeignFunction::lambda(1, |vm, args| {
            coerce_function(vm, &args[0], "Function.hash")?;
            Ok(vm.ctx().root(Value::Int(identity(&args[0]))))
        }),
    );
    define(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, args| {
            coerce_function(vm, &args[0], "Function.inspect")?;
            let text = format!("<Function#{:x}>", identity(&args[0]));
            Ok(vm.ctx().root(Value::Str(vm.ctx().alloc(text).clone())))
        }),
    );
    define(
        ctx,
        &cls,
        "apply",
        ForeignFunction::method(1, |vm, this, args| {
            let arr = coerce_array(vm, &args[0], "Function.apply")?;
            let call_args = vm.ctx().root(arr.get().clone());
            let this = this.clone();
            vm.call(&this, &call_args)
        }),
    );
    define_meta(
        ctx,
        &cls,
        "inspect",
        ForeignFunction::lambda(1, |vm, _args| {
            let text = vm.ctx().alloc("Function".to_owned());
            Ok(vm.ctx().root(Value::Str(text.clone())))
        }),
    );
}

fn load_auxiliary(ctx: &mut Context) {
    let print = ctx.alloc(ForeignFunction::lambda(1, |vm, args| {
        let shown = vm.send(&args[0], "display")?;
        let text = coerce_string(vm, &shown, "print")?;
        print!("{}", text.get());
        Ok(vm.ctx().root(Value::Nil))
    }));
    ctx.define_builtin("print", Value::Foreign(print.clone()));
    let println = ctx.alloc(ForeignFunction::lambda(1, |vm, args| {
        let shown = vm.send(&args[0], "display")?;
        let text = coerce_string(vm, &shown, "println")?;
        println!("{}", text.get());
        Ok(vm.ctx().root(Value::Nil))
    }));
    ctx.define_builtin("println", Value::Foreign(println.clone()));
}

/// Bootstraps the primitive classes and the standard library into `ctx`.
pub fn load_builtins(ctx: &mut Context) {
    // The metaclass knot. Object's metaclass subclasses Class; Class is
    // its own metaclass and inherits Object. Built from raw parts, then
    // never mutated again.
    let object_cls = ctx.alloc(Class::from_parts(Ptr::null(), None));
    let class_cls = ctx.alloc(Class::from_parts(Ptr::null(), None));
    let object_meta = ctx.alloc(Class::from_parts(
        class_cls.clone(),
        Some(class_cls.clone()),
    ));
    object_cls.get_mut().object.class = object_meta.clone();
    class_cls.get_mut().object.class = class_cls.clone();
    class_cls.get_mut().base = Some(object_cls.clone());
    ctx.classes_mut().object = object_cls.clone();
    ctx.classes_mut().class = class_cls.clone();

    load_object(ctx);
    load_class(ctx);

    load_nil(ctx);
    load_bool(ctx);
    load_int(ctx);
    load_string(ctx);
    load_array(ctx);
    load_function(ctx);

    load_auxiliary(ctx);
}
