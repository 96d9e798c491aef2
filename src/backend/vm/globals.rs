// Global Store (§3.9, §4.3): context-global symbols (built-in natives) and
// their backing value slots, addressed by symbol index.
use crate::backend::translator::scanner::{GlobalLookup, Symbol, SymbolKind};
use crate::backend::vm::heap::Heap;
use crate::common::object::{NativeFn, NativeFunction, Value};
use std::collections::HashMap;

/// `{name, arity, func}` — one entry per built-in the embedder registers
/// (§6.3 "register-native").
pub struct NativeDescriptor {
    pub name: &'static str,
    pub arity: Option<usize>,
    pub func: NativeFn,
}

pub struct GlobalStore {
    symbols: HashMap<String, Symbol>,
    values: Vec<Value>,
}

impl GlobalStore {
    pub fn new() -> Self {
        GlobalStore { symbols: HashMap::new(), values: Vec::new() }
    }

    /// §4.3 "Built-in natives are registered at construction by iterating
    /// the external builtin registry."
    pub fn with_builtins(registry: &[NativeDescriptor], heap: &mut Heap) -> Self {
        let mut store = Self::new();
        for desc in registry {
            let native = heap.alloc_native(NativeFunction {
                name: desc.name.to_string(),
                arity: desc.arity,
                func: desc.func,
                bound_self: None,
            });
            store.set(desc.name, Value::Native(native));
        }
        store
    }

    /// Creates or updates; returns the symbol's index.
    pub fn set(&mut self, name: &str, value: Value) -> usize {
        if let Some(sym) = self.symbols.get(name) {
            let index = sym.index;
            self.values[index] = value;
            return index;
        }
        let index = self.values.len();
        self.values.push(value);
        self.symbols.insert(
            name.to_string(),
            Symbol { name: name.to_string(), kind: SymbolKind::ContextGlobal, index, assignable: true },
        );
        index
    }

    pub fn get_at(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    pub fn resolve(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).cloned()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl GlobalLookup for GlobalStore {
    fn get_symbol(&self, name: &str) -> Option<Symbol> {
        self.resolve(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vm::heap::Heap;
    use crate::common::object::Host;

    fn noop(_host: &mut dyn crate::common::object::Host, _args: &[Value]) -> Value {
        Value::Null
    }

    #[test]
    fn set_is_idempotent_on_index() {
        let mut heap = Heap::new(Default::default());
        let mut store = GlobalStore::with_builtins(
            &[NativeDescriptor { name: "len", arity: Some(1), func: noop }],
            &mut heap,
        );
        let first = store.resolve("len").unwrap().index;
        store.set("len", Value::Null);
        let second = store.resolve("len").unwrap().index;
        assert_eq!(first, second);
    }
}
