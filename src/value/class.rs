use std::collections::HashMap;

use super::object::Object;
use super::Value;
use crate::context::Context;
use crate::memory::{Ptr, Root, Trace, Tracer};

/// One slot of a class's method table.
///
/// Owned entries are the methods the class defines itself. Cached
/// entries are copies pulled up from an ancestor by a lookup; they stay
/// usable only while the owner's validity token is true, so redefining
/// or removing the owned entry invalidates every cached copy at once.
#[derive(Debug)]
struct MethodEntry {
    value: Value,
    own: bool,
    valid: Ptr<bool>,
}

impl Trace for MethodEntry {
    fn trace(&self, tracer: &mut Tracer) {
        self.value.trace(tracer);
        tracer.visit(&self.valid);
    }
}

/// A class: a property-bearing object with a method table and a single
/// superclass chain.
///
/// The embedded object's class handle is this class's metaclass; the
/// chain of `base` links is finite and acyclic. Method resolution walks
/// the chain once and caches the result in every class it passed
/// through, giving O(1) repeat lookups that stay correct under dynamic
/// method mutation.
#[derive(Debug)]
pub struct Class {
    pub object: Object,
    methods: HashMap<String, MethodEntry>,
    pub base: Option<Ptr<Class>>,
}

impl Class {
    /// Creates a class from raw parts. Used by the bootstrap; everything
    /// else goes through [`Class::subclass`].
    pub fn from_parts(meta: Ptr<Class>, base: Option<Ptr<Class>>) -> Self {
        Self {
            object: Object::new(meta),
            methods: HashMap::new(),
            base,
        }
    }

    /// Creates a class inheriting from `base`, along with its metaclass
    /// (a subclass of `base`'s metaclass).
    pub fn subclass(ctx: &Context, base: &Ptr<Class>) -> Root<Ptr<Class>> {
        let base_meta = base.get().meta().clone();
        let meta_meta = base_meta.get().meta().clone();
        let meta = ctx.alloc(Class::from_parts(meta_meta, Some(base_meta)));
        ctx.alloc(Class::from_parts(meta.clone(), Some(base.clone())))
    }

    /// The class of this class.
    pub fn meta(&self) -> &Ptr<Class> {
        &self.object.class
    }

    /// Finds a method along the class chain, caching the result in every
    /// class between here and its owner.
    pub fn lookup(&mut self, name: &str) -> Option<Value> {
        self.lookup_rec(name).map(|(value, _)| value)
    }

    fn lookup_rec(&mut self, name: &str) -> Option<(Value, Ptr<bool>)> {
        if let Some(entry) = self.methods.get(name) {
            if entry.own || *entry.valid.get() {
                return Some((entry.value.clone(), entry.valid.clone()));
            }
            // Purge the invalidated cache entry.
            self.methods.remove(name);
        }
        let found = match &self.base {
            Some(base) => base.get_mut().lookup_rec(name),
            None => None,
        };
        if let Some((value, valid)) = &found {
            self.methods.insert(
                name.to_owned(),
                MethodEntry {
                    value: value.clone(),
                    own: false,
                    valid: valid.clone(),
                },
            );
        }
        found
    }

    /// Creates a method or overwrites an existing one.
    pub fn define(&mut self, ctx: &Context, name: &str, value: Value) {
        let value = ctx.root(value);
        // Simple path when changing a method this class already owns.
        if let Some(entry) = self.methods.get_mut(name) {
            if entry.own {
                entry.value = value.clone();
                *entry.valid.get_mut() = false;
                entry.valid = ctx.alloc(true).clone();
                return;
            }
        }
        // Otherwise invalidate inherited caches up the chain, then insert.
        if let Some(base) = self.base.clone() {
            base.get_mut().define_fixup(ctx, name);
        }
        let entry = MethodEntry {
            value: value.clone(),
            own: true,
            valid: ctx.alloc(true).clone(),
        };
        self.methods.insert(name.to_owned(), entry);
    }

    fn define_fixup(&mut self, ctx: &Context, name: &str) {
        if let Some(entry) = self.methods.get_mut(name) {
            if entry.own {
                *entry.valid.get_mut() = false;
                entry.valid = ctx.alloc(true).clone();
                return;
            }
            self.methods.remove(name);
        }
        if let Some(base) = self.base.clone() {
            base.get_mut().define_fixup(ctx, name);
        }
    }

    /// Removes an owned method and returns it. Cached entries inherited
    /// from ancestors are left alone; they re-fill on the next lookup.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        if self.methods.get(name).is_some_and(|entry| entry.own) {
            let entry = self.methods.remove(name)?;
            *entry.valid.get_mut() = false;
            return Some(entry.value);
        }
        None
    }

    /// The method this class owns itself, bypassing chain and cache.
    pub fn owned(&self, name: &str) -> Option<Value> {
        let entry = self.methods.get(name)?;
        entry.own.then(|| entry.value.clone())
    }
}

impl Trace for Class {
    fn trace(&self, tracer: &mut Tracer) {
        self.object.trace(tracer);
        self.methods.trace(tracer);
        self.base.trace(tracer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::load_builtins;
    use proptest::prelude::*;

    fn fixture() -> (Context, Vec<Root<Ptr<Class>>>) {
        let mut ctx = Context::new();
        load_builtins(&mut ctx);
        // A chain of four: object <- c0 <- c1 <- c2 <- c3, each kept
        // rooted so allocations inside the tests cannot reclaim them.
        let mut chain = Vec::new();
        let mut base = ctx.classes().object.clone();
        for _ in 0..4 {
            let cls = Class::subclass(&ctx, &base);
            base = cls.clone();
            chain.push(cls);
        }
        (ctx, chain)
    }

    /// Reference implementation: walk `base` links looking at owned
    /// entries only.
    fn oracle(cls: &Ptr<Class>, name: &str) -> Option<Value> {
        let mut cur = cls.clone();
        loop {
            if let Some(value) = cur.get().owned(name) {
                return Some(value);
            }
            let next = cur.get().base.clone()?;
            cur = next;
        }
    }

    fn assert_coherent(chain: &[Root<Ptr<Class>>], names: &[&str]) {
        for cls in chain {
            for name in names {
                let cached = cls.get_mut().lookup(name);
                let walked = oracle(cls, name);
                match (&cached, &walked) {
                    (None, None) => {}
                    (Some(Value::Int(a)), Some(Value::Int(b))) => assert_eq!(a, b),
                    other => panic!("cache and chain walk disagree: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn lookup_walks_the_chain() {
        let (ctx, chain) = fixture();
        chain[0].get_mut().define(&ctx, "m", Value::Int(1));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(1))));
        // The hit is now cached in every intermediate class.
        for cls in &chain {
            assert!(matches!(cls.get_mut().lookup("m"), Some(Value::Int(1))));
        }
    }

    #[test]
    fn redefining_invalidates_downstream_caches() {
        let (ctx, chain) = fixture();
        chain[0].get_mut().define(&ctx, "m", Value::Int(1));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(1))));
        chain[0].get_mut().define(&ctx, "m", Value::Int(2));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(2))));
    }

    #[test]
    fn shadowing_definition_beats_stale_caches() {
        let (ctx, chain) = fixture();
        chain[0].get_mut().define(&ctx, "m", Value::Int(1));
        // Fill caches in 1..=3 from class 0.
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(1))));
        // A definition in the middle must win over caches below it.
        chain[1].get_mut().define(&ctx, "m", Value::Int(5));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(5))));
        assert!(matches!(chain[2].get_mut().lookup("m"), Some(Value::Int(5))));
        assert!(matches!(chain[0].get_mut().lookup("m"), Some(Value::Int(1))));
    }

    #[test]
    fn removal_reexposes_the_ancestor_method() {
        let (ctx, chain) = fixture();
        chain[0].get_mut().define(&ctx, "m", Value::Int(1));
        chain[2].get_mut().define(&ctx, "m", Value::Int(9));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(9))));
        assert!(matches!(chain[2].get_mut().remove("m"), Some(Value::Int(9))));
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(1))));
        // Removing a method the class does not own is a no-op.
        assert!(chain[3].get_mut().remove("m").is_none());
        assert!(matches!(chain[3].get_mut().lookup("m"), Some(Value::Int(1))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// After any define/remove/lookup sequence, the cached lookup on
        /// every class equals a plain walk over owned entries.
        #[test]
        fn cache_matches_chain_walk(ops in prop::collection::vec((0usize..4, 0usize..3, 0u8..3), 0..40)) {
            let (ctx, chain) = fixture();
            let names = ["a", "b", "c"];
            let mut counter = 0i64;
            for (cls, name, op) in ops {
                let name = names[name];
                match op {
                    0 => {
                        counter += 1;
                        chain[cls].get_mut().define(&ctx, name, Value::Int(counter));
                    }
                    1 => {
                        chain[cls].get_mut().remove(name);
                    }
                    _ => {
                        chain[cls].get_mut().lookup(name);
                    }
                }
                assert_coherent(&chain, &names);
            }
        }
    }
}
