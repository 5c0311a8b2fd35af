//! Virtual instrument for dry runs and tests.
//!
//! Values live in memory. Read-only parameters can be backed by a reader
//! closure, which lets a virtual meter follow a virtual source. Every accepted
//! set is recorded, and sets or gets can be made to fail on demand.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

use super::scpi::spec_from_definition;
use super::Instrument;
use crate::config::InstrumentDefinition;
use crate::error::{AppResult, DaqError};
use crate::parameter::{ParameterSpec, ParameterTable, ParameterValue, ValueKind};

/// Computes a reading on every `get`.
pub type Reader = Arc<dyn Fn() -> ParameterValue + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory instrument.
pub struct MockInstrument {
    id: String,
    table: RwLock<ParameterTable>,
    readers: HashMap<String, Reader>,
    history: Mutex<Vec<(String, ParameterValue)>>,
    fail_set_after: Mutex<Option<usize>>,
    fail_gets: AtomicBool,
    connected: AtomicBool,
}

impl MockInstrument {
    /// Create an instrument with no parameters.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            table: RwLock::new(ParameterTable::new(id.clone())),
            id,
            readers: HashMap::new(),
            history: Mutex::new(Vec::new()),
            fail_set_after: Mutex::new(None),
            fail_gets: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    /// Virtual DAC with `channels` outputs named `ch1..chN`, ±10 V, starting at 0.
    pub fn dac(id: impl Into<String>, channels: usize) -> Self {
        let mut dac = Self::new(id);
        for ch in 1..=channels {
            let spec = ParameterSpec::new(format!("ch{ch}"), ValueKind::Float)
                .with_range(-10.0, 10.0)
                .with_unit("V");
            // Names are generated unique
            let _ = dac.add_parameter(spec, Some(ParameterValue::Float(0.0)));
        }
        dac
    }

    /// Build from a configuration entry; `initial` values seed the cache.
    pub fn from_definition(def: &InstrumentDefinition) -> AppResult<Self> {
        let mut instrument = Self::new(def.id.clone());
        for param in &def.parameters {
            instrument.add_parameter(spec_from_definition(param), param.initial.clone())?;
        }
        Ok(instrument)
    }

    /// Register a parameter, optionally with a starting value.
    pub fn add_parameter(
        &mut self,
        spec: ParameterSpec,
        initial: Option<ParameterValue>,
    ) -> AppResult<&mut Self> {
        let table = self.table.get_mut().unwrap_or_else(|e| e.into_inner());
        match initial {
            Some(value) => table.add_with_value(spec, value)?,
            None => table.add(spec)?,
        };
        Ok(self)
    }

    /// Builder form of [`add_parameter`](Self::add_parameter).
    pub fn with_parameter(
        mut self,
        spec: ParameterSpec,
        initial: Option<ParameterValue>,
    ) -> AppResult<Self> {
        self.add_parameter(spec, initial)?;
        Ok(self)
    }

    /// Back a parameter with a closure evaluated on every `get`.
    pub fn with_reader(
        mut self,
        name: impl Into<String>,
        reader: impl Fn() -> ParameterValue + Send + Sync + 'static,
    ) -> Self {
        self.readers.insert(name.into(), Arc::new(reader));
        self
    }

    /// Current cached value, readable from synchronous code.
    pub fn peek(&self, name: &str) -> Option<ParameterValue> {
        self.read_table().cached(name)
    }

    /// Every accepted set, in order.
    pub fn set_history(&self) -> Vec<(String, ParameterValue)> {
        lock(&self.history).clone()
    }

    /// Accepted sets of one parameter, as numbers.
    pub fn history_of(&self, name: &str) -> Vec<f64> {
        lock(&self.history)
            .iter()
            .filter(|(param, _)| param == name)
            .filter_map(|(_, value)| value.as_f64())
            .collect()
    }

    /// Let `count` more sets succeed, then fail exactly one.
    pub fn fail_set_after(&self, count: usize) {
        *lock(&self.fail_set_after) = Some(count);
    }

    /// Make every `get` fail until cleared.
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Whether `connect` has been called more recently than `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, ParameterTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, ParameterTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn take_set_failure(&self) -> bool {
        let mut remaining = lock(&self.fail_set_after);
        match remaining.as_mut() {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn id(&self) -> &str {
        &self.id
    }

    fn driver(&self) -> &str {
        "mock"
    }

    async fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.read_table().specs()
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(instrument = %self.id, "Mock instrument connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ParameterValue> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(DaqError::Instrument(format!("{}: simulated read failure", self.id)).into());
        }

        let spec = self.read_table().spec(name)?.clone();
        if let Some(reader) = self.readers.get(name) {
            let value = reader()
                .coerce(spec.kind)
                .map_err(|reason| DaqError::ParameterInvalidValue {
                    name: name.to_string(),
                    reason,
                })?;
            self.write_table().store(name, value.clone());
            return Ok(value);
        }

        self.read_table()
            .cached(name)
            .ok_or_else(|| DaqError::ParameterWriteOnly(name.to_string()).into())
    }

    async fn set(&self, name: &str, value: ParameterValue) -> Result<()> {
        let value = self.read_table().validate_set(name, value)?;
        if self.take_set_failure() {
            return Err(DaqError::Instrument(format!(
                "{}: simulated write failure on '{}'",
                self.id, name
            ))
            .into());
        }

        self.write_table().store(name, value.clone());
        lock(&self.history).push((name.to_string(), value));
        Ok(())
    }

    async fn cached(&self, name: &str) -> Option<ParameterValue> {
        self.read_table().cached(name)
    }

    async fn snapshot(&self) -> BTreeMap<String, ParameterValue> {
        self.read_table().snapshot()
    }
}
