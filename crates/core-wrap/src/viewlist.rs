//! The built-in ViewList wrapper: an array of domain objects projected as a
//! parallel array of ViewListItem records.
//!
//! Each item record carries `baseItem` (the source object), `item` (the
//! source object or a freshly built presenter when the variable's
//! `itemWrapper` property names one), `index`, and `list` (back-pointer to
//! the owning ViewList record). Slots are reconciled in place: the item list
//! keeps its identity across syncs so the frontend sees one stable sequence.

use core_value::{ListRef, Record, RecordRef, Value};
use tracing::debug;

use crate::{VarView, WrapError, WrapHost, Wrapper, WrapperCtor};

pub const VIEW_LIST_TYPE: &str = "ViewList";
pub const VIEW_LIST_ITEM_TYPE: &str = "ViewListItem";

/// Namespace the frontend falls back to for per-item templates.
const FALLBACK_NAMESPACE: &str = "list-item";

pub struct ViewList {
    items: ListRef,
    /// The record items point back to through their `list` field; exposes
    /// `items` so paths can address the projection explicitly.
    list_record: RecordRef,
}

/// Factory registered under [`VIEW_LIST_TYPE`].
pub fn ctor() -> WrapperCtor {
    std::sync::Arc::new(|_host, view| {
        view.props.set("fallbackNamespace:high", FALLBACK_NAMESPACE);
        Ok(Box::new(ViewList::new()) as Box<dyn Wrapper>)
    })
}

impl ViewList {
    pub fn new() -> Self {
        let items = ListRef::new(Vec::new());
        let mut rec = Record::default();
        rec.set_type_name(Some(std::rc::Rc::from(VIEW_LIST_TYPE)));
        rec.set("items", Value::List(items.clone()));
        Self {
            items,
            list_record: RecordRef::new(rec),
        }
    }

    pub fn items(&self) -> ListRef {
        self.items.clone()
    }

    fn fresh_slot(&self) -> RecordRef {
        let mut rec = Record::default();
        rec.set_type_name(Some(std::rc::Rc::from(VIEW_LIST_ITEM_TYPE)));
        rec.set("baseItem", Value::Null);
        rec.set("item", Value::Null);
        // Out-of-band index forces first reconciliation to fill the slot.
        rec.set("index", Value::Int(-1));
        rec.set("list", Value::Record(self.list_record.clone()));
        RecordRef::new(rec)
    }

    fn slot(&self, i: usize) -> RecordRef {
        match self.items.get(i) {
            Some(Value::Record(rec)) => rec,
            _ => unreachable!("ViewList items are always records"),
        }
    }

    fn drop_slot(&self, host: &mut dyn WrapHost, slot: &RecordRef) {
        if let Some(Value::Record(item)) = slot.get("item").map(strip_empty)
            && let Some(Value::Func(f)) = item.lookup("destroy")
            && let Err(err) = host.invoke(&Value::Record(item.clone()), &f, Vec::new())
        {
            debug!(target: "wrap.viewlist", %err, "item_destroy_failed");
        }
    }

    fn reconcile_slot(
        &self,
        host: &mut dyn WrapHost,
        slot: &RecordRef,
        base: &Value,
        index: usize,
        item_wrapper: Option<&str>,
    ) -> bool {
        let base_current = slot.get("baseItem").unwrap_or(Value::Null);
        let index_current = slot.get("index").and_then(|v| v.as_int()).unwrap_or(-1);
        if base_current.loose_eq(base) && index_current == index as i64 {
            return false;
        }
        slot.set("baseItem", base.clone());
        slot.set("index", Value::Int(index as i64));
        slot.set("list", Value::Record(self.list_record.clone()));
        let item = match item_wrapper {
            Some(type_name) => match host.instantiate_presenter(type_name, base) {
                Ok(presenter) => presenter,
                Err(err) => {
                    // Presenter failure degrades to the raw item; the slot
                    // stays functional.
                    debug!(target: "wrap.viewlist", presenter = type_name, %err, "presenter_failed");
                    base.clone()
                }
            },
            None => base.clone(),
        };
        slot.set("item", item);
        true
    }
}

impl Default for ViewList {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_empty(v: Value) -> Value {
    match v {
        Value::Empty => Value::Null,
        other => other,
    }
}

impl Wrapper for ViewList {
    fn type_name(&self) -> &str {
        VIEW_LIST_TYPE
    }

    fn update(&mut self, host: &mut dyn WrapHost, view: &mut VarView<'_>) -> Result<(), WrapError> {
        let source: Vec<Value> = match view.value {
            Value::List(src) => src.borrow().clone(),
            Value::Null | Value::Empty => Vec::new(),
            other => {
                return Err(WrapError::WrongShape {
                    wrapper: VIEW_LIST_TYPE,
                    expected: "sequence",
                    found: other.kind(),
                });
            }
        };
        let item_wrapper = view.props.get("itemWrapper").map(str::to_string);

        let n = source.len();
        while self.items.len() < n {
            let slot = self.fresh_slot();
            self.items.push(Value::Record(slot));
        }
        while self.items.len() > n {
            let dropped = self.slot(self.items.len() - 1);
            self.items.borrow_mut().pop();
            self.drop_slot(host, &dropped);
            host.request_resweep();
        }

        let mut touched = false;
        for (i, base) in source.iter().enumerate() {
            let slot = self.slot(i);
            touched |= self.reconcile_slot(host, &slot, base, i, item_wrapper.as_deref());
        }
        if touched {
            host.request_resweep();
        }
        Ok(())
    }

    fn projection(&self) -> Value {
        Value::List(self.items.clone())
    }

    fn wrapper_property(&self, name: &str) -> Option<Value> {
        match name {
            "items" => Some(Value::List(self.items.clone())),
            _ => None,
        }
    }

    fn destroy(&mut self, host: &mut dyn WrapHost) {
        for i in 0..self.items.len() {
            let slot = self.slot(i);
            self.drop_slot(host, &slot);
        }
        self.items.borrow_mut().clear();
    }
}
