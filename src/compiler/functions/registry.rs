//! Lazily instantiated function catalog
//!
//! The catalog maps identifiers to factories. A group is built the first time
//! it is looked up; building reserves the identifier first so that mutually
//! dependent groups resolve to the in-progress placeholder instead of
//! recursing forever.

use super::{domain, matrix, noise, standard, string, vector, FunctionGroup};
use crate::compiler::jit::{NativeSymbol, SymbolMap};
use crate::compiler::Target;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Which kernels may call a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Point and volume kernels
    All,
    /// Point kernels only
    Points,
    /// Volume kernels only
    Volumes,
}

impl Availability {
    fn allows(self, target: Target) -> bool {
        matches!(
            (self, target),
            (Availability::All, _)
                | (Availability::Points, Target::Points)
                | (Availability::Volumes, Target::Volumes)
        )
    }
}

type Factory = Box<dyn Fn() -> FunctionGroup + Send + Sync>;

struct CatalogEntry {
    availability: Availability,
    factory: Factory,
}

enum Slot {
    Reserved,
    Ready(Arc<FunctionGroup>),
}

/// Catalog of builtin groups with memoized construction
pub struct FunctionRegistry {
    catalog: BTreeMap<String, CatalogEntry>,
    instances: HashMap<String, Slot>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("catalog", &self.catalog.len())
            .field("instantiated", &self.instances.len())
            .finish()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Registry holding the full builtin catalog
    pub fn new() -> Self {
        let mut registry = Self::empty();
        standard::register(&mut registry);
        vector::register(&mut registry);
        matrix::register(&mut registry);
        string::register(&mut registry);
        noise::register(&mut registry);
        domain::register(&mut registry);
        registry
    }

    /// Registry with no entries
    pub fn empty() -> Self {
        Self {
            catalog: BTreeMap::new(),
            instances: HashMap::new(),
        }
    }

    /// Add a factory; a later insert under the same name replaces the earlier one
    pub fn insert<F>(&mut self, name: &str, availability: Availability, factory: F)
    where
        F: Fn() -> FunctionGroup + Send + Sync + 'static,
    {
        self.instances.remove(name);
        self.catalog.insert(
            name.to_string(),
            CatalogEntry {
                availability,
                factory: Box::new(factory),
            },
        );
    }

    /// True when `name` is in the catalog
    pub fn contains(&self, name: &str) -> bool {
        self.catalog.contains_key(name)
    }

    /// Catalog identifiers in name order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.catalog.keys().map(|k| k.as_str())
    }

    /// Instantiate (if needed) and return a group
    ///
    /// Returns `Ok(None)` for unknown names and for a group that is still
    /// being built further up the call chain.
    pub fn get(&mut self, name: &str) -> Result<Option<Arc<FunctionGroup>>> {
        match self.instances.get(name) {
            Some(Slot::Ready(group)) => return Ok(Some(group.clone())),
            Some(Slot::Reserved) => return Ok(None),
            None => {}
        }
        let group = match self.catalog.get(name) {
            Some(entry) => {
                self.instances.insert(name.to_string(), Slot::Reserved);
                (entry.factory)()
            }
            None => return Ok(None),
        };

        for dep in group.dependencies() {
            let reserved = matches!(self.instances.get(dep.as_str()), Some(Slot::Reserved));
            if self.get(dep)?.is_none() && !reserved {
                self.instances.remove(name);
                return Err(Error::execution(format!(
                    "function {} depends on unknown function {}",
                    name, dep
                )));
            }
        }

        debug!(
            function = name,
            overloads = group.signatures().len(),
            "instantiated function group"
        );
        let group = Arc::new(group);
        self.instances
            .insert(name.to_string(), Slot::Ready(group.clone()));
        Ok(Some(group))
    }

    /// Look up a group callable from `target`
    ///
    /// Internal helpers are only returned when `allow_internal` is set.
    pub fn lookup(
        &mut self,
        name: &str,
        target: Target,
        allow_internal: bool,
    ) -> Result<Option<Arc<FunctionGroup>>> {
        let available = self
            .catalog
            .get(name)
            .map(|e| e.availability.allows(target))
            .unwrap_or(false);
        if !available {
            return Ok(None);
        }
        Ok(self
            .get(name)?
            .filter(|g| allow_internal || !g.is_internal()))
    }

    /// Native symbols of every instantiated group
    pub fn symbols(&self) -> SymbolMap {
        let mut map = SymbolMap::new();
        for slot in self.instances.values() {
            if let Slot::Ready(group) = slot {
                for sig in group.signatures() {
                    if let super::Implementation::Native(func) = &sig.imp {
                        map.insert(
                            sig.symbol().to_string(),
                            NativeSymbol {
                                func: *func,
                                pure: sig.pure,
                            },
                        );
                    }
                }
            }
        }
        map
    }

    /// Number of instantiated groups
    pub fn instantiated(&self) -> usize {
        self.instances
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::functions::Signature;
    use crate::compiler::jit::CallContext;
    use crate::runtime::Word;
    use crate::types::Type;

    fn nop(_: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
        Ok(Word::I32(0))
    }

    #[test]
    fn test_lazy_instantiation() {
        let mut registry = FunctionRegistry::new();
        assert_eq!(registry.instantiated(), 0);
        assert!(registry.get("sin").unwrap().is_some());
        assert_eq!(registry.instantiated(), 1);
        assert!(registry.symbols().contains_key("sin(double)"));
    }

    #[test]
    fn test_mutual_dependencies_terminate() {
        let mut registry = FunctionRegistry::empty();
        registry.insert("a", Availability::All, || {
            FunctionGroup::new("a")
                .depends_on("b")
                .with(Signature::native(vec![], Type::INT32, nop))
        });
        registry.insert("b", Availability::All, || {
            FunctionGroup::new("b")
                .depends_on("a")
                .with(Signature::native(vec![], Type::INT32, nop))
        });
        assert!(registry.get("a").unwrap().is_some());
        assert!(registry.get("b").unwrap().is_some());
        assert_eq!(registry.instantiated(), 2);
    }

    #[test]
    fn test_unknown_dependency_is_an_error() {
        let mut registry = FunctionRegistry::empty();
        registry.insert("a", Availability::All, || FunctionGroup::new("a").depends_on("zzz"));
        assert!(registry.get("a").is_err());
    }

    #[test]
    fn test_availability_and_visibility() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.lookup("ingroup", Target::Points, false).unwrap().is_some());
        assert!(registry.lookup("ingroup", Target::Volumes, false).unwrap().is_none());
        assert!(registry
            .lookup("ax.point.enter", Target::Points, false)
            .unwrap()
            .is_none());
        assert!(registry
            .lookup("ax.point.enter", Target::Points, true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_dependencies_are_instantiated() {
        let mut registry = FunctionRegistry::new();
        registry.get("normalize").unwrap();
        assert!(registry.symbols().contains_key("length(vec3f)"));
    }
}
