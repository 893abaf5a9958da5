//! Fugue Extension API
//!
//! Extensions are named libraries registered with the VM once at load
//! time. The bytecode may carry an opaque data buffer per library, and
//! handoff operations route a code block plus a scope-backed parameter
//! exchange to the extension by name.
//!
//! # Example
//!
//! ```rust
//! use fugue_extension::*;
//!
//! struct Doubler;
//!
//! impl Extension for Doubler {
//!     fn name(&self) -> &str {
//!         "doubler"
//!     }
//!
//!     fn handoff(&self, exchange: &mut dyn ScopeExchange) -> Result<(), String> {
//!         if let Some(ExtValue::Int32(n)) = exchange.read_variable("n") {
//!             exchange.write_variable("n", ExtValue::Int32(n * 2))?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let registry = ExtensionRegistry::new();
//! registry.register(std::sync::Arc::new(Doubler));
//! assert!(registry.get("doubler").is_some());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Value type crossing the extension boundary. A deliberately small
/// subset of the VM's value set; handles never cross raw.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtValue {
    Null,
    Int32(i32),
    Int16(i16),
    Real(f32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl ExtValue {
    pub fn as_i32(&self) -> Result<i32, String> {
        match self {
            ExtValue::Int32(v) => Ok(*v),
            other => Err(format!("expected integer, got {:?}", other)),
        }
    }

    pub fn as_real(&self) -> Result<f32, String> {
        match self {
            ExtValue::Real(v) => Ok(*v),
            other => Err(format!("expected real, got {:?}", other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, String> {
        match self {
            ExtValue::Bool(v) => Ok(*v),
            other => Err(format!("expected boolean, got {:?}", other)),
        }
    }
}

/// Parameter-exchange surface handed to an extension during a handoff.
///
/// Implemented by the VM over the calling task's activated scope; the
/// extension sees the standard scope-lookup conventions without owning
/// any VM internals.
pub trait ScopeExchange {
    /// Read a variable visible in the handed-off block's scope.
    fn read_variable(&self, name: &str) -> Option<ExtValue>;

    /// Write a variable visible in the handed-off block's scope.
    fn write_variable(&mut self, name: &str, value: ExtValue) -> Result<(), String>;

    /// Execute the handed-off code block once in the VM.
    fn run_block(&mut self) -> Result<(), String>;
}

/// A named extension library.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Receive the opaque data buffer recorded for this library in the
    /// bytecode. Called once during load.
    fn load_data(&self, _data: &[u8]) {}

    /// Invoke a named function exported by this library. Used for
    /// functions the bytecode declares as native calls.
    fn call(&self, symbol: &str, _args: &[ExtValue]) -> Result<ExtValue, String> {
        Err(format!("unknown extension function: {}", symbol))
    }

    /// Take over execution of a handed-off code block.
    fn handoff(&self, exchange: &mut dyn ScopeExchange) -> Result<(), String>;

    /// Extension-controlled iteration: the extension drives the block,
    /// reading and stepping the named counter variable as it sees fit.
    /// Defaults to a plain handoff.
    fn handoff_control(
        &self,
        exchange: &mut dyn ScopeExchange,
        _counter: &str,
    ) -> Result<(), String> {
        self.handoff(exchange)
    }
}

/// Process-wide registry of extension libraries. Registration happens
/// once per library before execution starts; lookups are by name.
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Extension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, extension: Arc<dyn Extension>) {
        let name = extension.name().to_string();
        log::debug!("registering extension library {}", name);
        self.entries.write().insert(name, extension);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Hand a bytecode-embedded data buffer to its target library.
    /// Buffers for unregistered libraries are ignored with a warning.
    pub fn deliver_data(&self, name: &str, data: &[u8]) {
        match self.get(name) {
            Some(extension) => extension.load_data(data),
            None => log::warn!("extension data for unregistered library {}", name),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        data: RwLock<Vec<u8>>,
    }

    impl Extension for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn load_data(&self, data: &[u8]) {
            *self.data.write() = data.to_vec();
        }

        fn handoff(&self, exchange: &mut dyn ScopeExchange) -> Result<(), String> {
            exchange.run_block()
        }
    }

    struct FakeExchange {
        vars: HashMap<String, ExtValue>,
        ran: usize,
    }

    impl ScopeExchange for FakeExchange {
        fn read_variable(&self, name: &str) -> Option<ExtValue> {
            self.vars.get(name).cloned()
        }

        fn write_variable(&mut self, name: &str, value: ExtValue) -> Result<(), String> {
            self.vars.insert(name.to_string(), value);
            Ok(())
        }

        fn run_block(&mut self) -> Result<(), String> {
            self.ran += 1;
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ExtensionRegistry::new();
        assert!(!registry.contains("recorder"));

        registry.register(Arc::new(Recorder {
            data: RwLock::new(Vec::new()),
        }));
        assert!(registry.contains("recorder"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_data_delivery() {
        let registry = ExtensionRegistry::new();
        let recorder = Arc::new(Recorder {
            data: RwLock::new(Vec::new()),
        });
        registry.register(Arc::clone(&recorder) as Arc<dyn Extension>);

        registry.deliver_data("recorder", &[1, 2, 3]);
        assert_eq!(&*recorder.data.read(), &[1, 2, 3]);

        // Unknown target: ignored.
        registry.deliver_data("missing", &[9]);
    }

    #[test]
    fn test_handoff_runs_block() {
        let registry = ExtensionRegistry::new();
        registry.register(Arc::new(Recorder {
            data: RwLock::new(Vec::new()),
        }));

        let mut exchange = FakeExchange {
            vars: HashMap::new(),
            ran: 0,
        };
        let ext = registry.get("recorder").unwrap();
        ext.handoff(&mut exchange).unwrap();
        assert_eq!(exchange.ran, 1);
    }

    #[test]
    fn test_handoff_control_defaults_to_handoff() {
        let registry = ExtensionRegistry::new();
        registry.register(Arc::new(Recorder {
            data: RwLock::new(Vec::new()),
        }));

        let mut exchange = FakeExchange {
            vars: HashMap::new(),
            ran: 0,
        };
        let ext = registry.get("recorder").unwrap();
        ext.handoff_control(&mut exchange, "i").unwrap();
        assert_eq!(exchange.ran, 1);
    }
}
