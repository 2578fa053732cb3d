//! Tree-walking evaluator.
//!
//! Script functions close over their defining environment; environments are
//! `Rc<RefCell<..>>` scopes chained to the session globals. All values are
//! `core-value` values, so records and lists created by script share one
//! identity model with everything the tracker serializes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use core_value::{FuncRef, ListRef, Record, RecordRef, Value};

use crate::ScriptError;
use crate::ast::{BinOp, Expr, FuncDef, Stmt, UnOp};
use crate::session::ScriptSession;

pub struct Env {
    bindings: HashMap<String, Value>,
    parent: Option<EnvRef>,
}

pub type EnvRef = Rc<RefCell<Env>>;

impl Env {
    pub fn root() -> EnvRef {
        Rc::new(RefCell::new(Env {
            bindings: HashMap::new(),
            parent: None,
        }))
    }

    pub fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Env {
            bindings: HashMap::new(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    pub fn define(env: &EnvRef, name: &str, value: Value) {
        env.borrow_mut().bindings.insert(name.to_string(), value);
    }

    pub fn get(env: &EnvRef, name: &str) -> Option<Value> {
        let mut cursor = Some(Rc::clone(env));
        while let Some(scope) = cursor {
            if let Some(v) = scope.borrow().bindings.get(name) {
                return Some(v.clone());
            }
            cursor = scope.borrow().parent.clone();
        }
        None
    }

    pub fn assign(env: &EnvRef, name: &str, value: Value) -> bool {
        let mut cursor = Some(Rc::clone(env));
        while let Some(scope) = cursor {
            if let Some(slot) = scope.borrow_mut().bindings.get_mut(name) {
                *slot = value;
                return true;
            }
            cursor = scope.borrow().parent.clone();
        }
        false
    }

    /// Define at the outermost scope (the session globals).
    pub fn define_root(env: &EnvRef, name: &str, value: Value) {
        let mut scope = Rc::clone(env);
        loop {
            let parent = scope.borrow().parent.clone();
            match parent {
                Some(p) => scope = p,
                None => break,
            }
        }
        scope.borrow_mut().bindings.insert(name.to_string(), value);
    }

    pub fn remove(env: &EnvRef, name: &str) {
        env.borrow_mut().bindings.remove(name);
    }
}

/// A callable's implementation, stored as the opaque payload of a
/// [`FuncRef`].
pub enum Callable {
    Script { def: Rc<FuncDef>, env: EnvRef },
    Native(NativeImpl),
}

pub type NativeImpl =
    Rc<dyn Fn(&mut Interp<'_>, Option<&Value>, &[Value]) -> Result<Value, ScriptError>>;

pub fn script_fn(def: Rc<FuncDef>, env: EnvRef) -> Value {
    let name = def.name.as_deref().map(Rc::from);
    Value::Func(FuncRef::new(name, Box::new(Callable::Script { def, env })))
}

pub fn native_fn(name: &str, imp: NativeImpl) -> Value {
    Value::Func(FuncRef::new(
        Some(Rc::from(name)),
        Box::new(Callable::Native(imp)),
    ))
}

enum Flow {
    Normal,
    Return(Value),
}

/// One evaluation context borrowing the session, so natives can reach the
/// prototype registry, module table, and variable-op queue mid-call.
pub struct Interp<'a> {
    pub session: &'a mut ScriptSession,
}

impl<'a> Interp<'a> {
    pub fn new(session: &'a mut ScriptSession) -> Self {
        Self { session }
    }

    /// Run a top-level statement list; the value of a trailing expression
    /// statement becomes the result (module return values).
    pub fn exec_top(&mut self, stmts: &[Stmt], env: &EnvRef) -> Result<Value, ScriptError> {
        let mut last = Value::Bool(true);
        for stmt in stmts {
            match stmt {
                Stmt::Expr(e) => last = self.eval(e, env)?,
                other => {
                    if let Flow::Return(v) = self.exec_stmt(other, env)? {
                        return Ok(v);
                    }
                    last = Value::Bool(true);
                }
            }
        }
        Ok(last)
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &EnvRef) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            if let Flow::Return(v) = self.exec_stmt(stmt, env)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &EnvRef) -> Result<Flow, ScriptError> {
        match stmt {
            Stmt::Let(name, value) => {
                let v = self.eval(value, env)?;
                Env::define(env, name, v);
                Ok(Flow::Normal)
            }
            Stmt::FnDecl(name, def) => {
                Env::define(env, name, script_fn(Rc::clone(def), Rc::clone(env)));
                Ok(Flow::Normal)
            }
            Stmt::AssignIdent(name, value) => {
                let v = self.eval(value, env)?;
                // Assignment to a name no scope binds defines a session
                // global; `let` is what creates locals.
                if !Env::assign(env, name, v.clone()) {
                    Env::define_root(env, name, v);
                }
                Ok(Flow::Normal)
            }
            Stmt::AssignField(obj, name, value) => {
                let target = self.eval(obj, env)?;
                let v = self.eval(value, env)?;
                match target {
                    Value::Record(rec) => {
                        rec.set(name, v);
                        Ok(Flow::Normal)
                    }
                    other => Err(ScriptError::Runtime(format!(
                        "cannot set field {name:?} on {}",
                        other.kind()
                    ))),
                }
            }
            Stmt::AssignIndex(obj, index, value) => {
                let target = self.eval(obj, env)?;
                let idx = self.eval(index, env)?;
                let v = self.eval(value, env)?;
                store_index(&target, &idx, v)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr(e) => {
                self.eval(e, env)?;
                Ok(Flow::Normal)
            }
            Stmt::If(cond, then, alt) => {
                if self.eval(cond, env)?.truthy() {
                    self.exec_block(then, &Env::child(env))
                } else if let Some(alt) = alt {
                    self.exec_block(alt, &Env::child(env))
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While(cond, body) => {
                while self.eval(cond, env)?.truthy() {
                    if let Flow::Return(v) = self.exec_block(body, &Env::child(env))? {
                        return Ok(Flow::Return(v));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For(var, iter, body) => {
                let iterable = self.eval(iter, env)?;
                let items: Vec<Value> = match &iterable {
                    Value::List(list) => list.borrow().clone(),
                    other => {
                        return Err(ScriptError::Runtime(format!(
                            "cannot iterate over {}",
                            other.kind()
                        )));
                    }
                };
                for item in items {
                    let scope = Env::child(env);
                    Env::define(&scope, var, item);
                    if let Flow::Return(v) = self.exec_block(body, &scope)? {
                        return Ok(Flow::Return(v));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e, env)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(v))
            }
        }
    }

    pub fn eval(&mut self, expr: &Expr, env: &EnvRef) -> Result<Value, ScriptError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::str(s)),
            Expr::Ident(name) => Env::get(env, name)
                .ok_or_else(|| ScriptError::UndefinedVariable(name.clone())),
            Expr::Record(fields) => {
                let mut rec = Record::default();
                for (k, v) in fields {
                    rec.set(k, self.eval(v, env)?);
                }
                Ok(Value::Record(RecordRef::new(rec)))
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, env)?);
                }
                Ok(Value::List(ListRef::new(out)))
            }
            Expr::Func(def) => Ok(script_fn(Rc::clone(def), Rc::clone(env))),
            Expr::Field(obj, name) => {
                let target = self.eval(obj, env)?;
                match target {
                    Value::Record(rec) => Ok(rec.lookup(name).unwrap_or(Value::Null)),
                    Value::Null | Value::Empty => Err(ScriptError::Runtime(format!(
                        "field {name:?} read on null"
                    ))),
                    other => Err(ScriptError::Runtime(format!(
                        "field {name:?} read on {}",
                        other.kind()
                    ))),
                }
            }
            Expr::Index(obj, index) => {
                let target = self.eval(obj, env)?;
                let idx = self.eval(index, env)?;
                load_index(&target, &idx)
            }
            Expr::Call(callee, args) => {
                let mut arg_values = Vec::with_capacity(args.len());
                // Method form: receiver is evaluated once and bound as self.
                if let Expr::Field(obj, name) = &**callee {
                    let recv = self.eval(obj, env)?;
                    let func = match &recv {
                        Value::Record(rec) => rec.lookup(name).unwrap_or(Value::Null),
                        other => {
                            return Err(ScriptError::Runtime(format!(
                                "method {name:?} call on {}",
                                other.kind()
                            )));
                        }
                    };
                    for a in args {
                        arg_values.push(self.eval(a, env)?);
                    }
                    return self.call_value(&func, Some(&recv), arg_values);
                }
                let func = self.eval(callee, env)?;
                for a in args {
                    arg_values.push(self.eval(a, env)?);
                }
                self.call_value(&func, None, arg_values)
            }
            Expr::Unary(op, e) => {
                let v = self.eval(e, env)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnOp::Neg => match v {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(ScriptError::Runtime(format!(
                            "cannot negate {}",
                            other.kind()
                        ))),
                    },
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, env),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        env: &EnvRef,
    ) -> Result<Value, ScriptError> {
        // Short-circuit forms return the deciding operand, so scripts can
        // write `base || Object` for defaults.
        if op == BinOp::And {
            let l = self.eval(lhs, env)?;
            return if l.truthy() { self.eval(rhs, env) } else { Ok(l) };
        }
        if op == BinOp::Or {
            let l = self.eval(lhs, env)?;
            return if l.truthy() { Ok(l) } else { self.eval(rhs, env) };
        }

        let l = self.eval(lhs, env)?;
        let r = self.eval(rhs, env)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
            BinOp::Ne => Ok(Value::Bool(!l.loose_eq(&r))),
            BinOp::Add => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::str(format!("{l}{r}"))),
                _ => num_op(&l, &r, |a, b| a + b),
            },
            BinOp::Sub => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
                _ => num_op(&l, &r, |a, b| a - b),
            },
            BinOp::Mul => match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
                _ => num_op(&l, &r, |a, b| a * b),
            },
            BinOp::Div => match (&l, &r) {
                (Value::Int(_), Value::Int(0)) => {
                    Err(ScriptError::Runtime("division by zero".into()))
                }
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
                _ => num_op(&l, &r, |a, b| a / b),
            },
            BinOp::Rem => match (&l, &r) {
                (Value::Int(_), Value::Int(0)) => {
                    Err(ScriptError::Runtime("division by zero".into()))
                }
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
                _ => num_op(&l, &r, |a, b| a % b),
            },
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = compare(&l, &r)?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuit forms handled above"),
        }
    }

    /// Invoke a callable value. `recv` binds as `self` for script functions
    /// and passes through to natives.
    pub fn call_value(
        &mut self,
        callee: &Value,
        recv: Option<&Value>,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let Value::Func(fref) = callee else {
            return Err(ScriptError::NotCallable(callee.kind()));
        };
        let Some(callable) = fref.payload().downcast_ref::<Callable>() else {
            return Err(ScriptError::NotCallable("foreign function"));
        };
        match callable {
            Callable::Native(imp) => {
                let imp = Rc::clone(imp);
                imp(self, recv, &args)
            }
            Callable::Script { def, env } => {
                let def = Rc::clone(def);
                let scope = Env::child(env);
                if let Some(recv) = recv {
                    Env::define(&scope, "self", recv.clone());
                }
                for (i, param) in def.params.iter().enumerate() {
                    Env::define(&scope, param, args.get(i).cloned().unwrap_or(Value::Null));
                }
                match self.exec_block(&def.body, &scope)? {
                    Flow::Return(v) => Ok(v),
                    Flow::Normal => Ok(Value::Null),
                }
            }
        }
    }
}

fn num_op(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ScriptError> {
    let (a, b) = match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ScriptError::Runtime(format!(
                "arithmetic on {} and {}",
                l.kind(),
                r.kind()
            )));
        }
    };
    Ok(Value::Float(f(a, b)))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ScriptError> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (as_f64(l), as_f64(r)) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| ScriptError::Runtime("incomparable numbers".into())),
            _ => Err(ScriptError::Runtime(format!(
                "cannot compare {} and {}",
                l.kind(),
                r.kind()
            ))),
        },
    }
}

fn load_index(target: &Value, idx: &Value) -> Result<Value, ScriptError> {
    match (target, idx) {
        (Value::List(list), Value::Int(i)) => {
            let len = list.len();
            if *i < 0 || *i as usize >= len {
                return Err(ScriptError::Runtime(format!(
                    "index {i} out of range (len {len})"
                )));
            }
            Ok(list.get(*i as usize).unwrap_or(Value::Null))
        }
        (Value::Record(rec), Value::Str(name)) => Ok(rec.lookup(name).unwrap_or(Value::Null)),
        _ => Err(ScriptError::Runtime(format!(
            "cannot index {} with {}",
            target.kind(),
            idx.kind()
        ))),
    }
}

fn store_index(target: &Value, idx: &Value, value: Value) -> Result<(), ScriptError> {
    match (target, idx) {
        (Value::List(list), Value::Int(i)) => {
            let len = list.len();
            if *i < 0 || *i as usize >= len {
                return Err(ScriptError::Runtime(format!(
                    "index {i} out of range (len {len})"
                )));
            }
            list.borrow_mut()[*i as usize] = value;
            Ok(())
        }
        (Value::Record(rec), Value::Str(name)) => {
            rec.set(name, value);
            Ok(())
        }
        _ => Err(ScriptError::Runtime(format!(
            "cannot index {} with {}",
            target.kind(),
            idx.kind()
        ))),
    }
}
