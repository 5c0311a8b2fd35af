//! Registry of the instruments declared active.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Instrument, MockInstrument, ScpiInstrument};
use crate::config::{InstrumentDefinition, LabConfig};
use crate::error::{AppResult, DaqError};
use crate::parameter::ParameterValue;

/// Instruments keyed by id, in id order.
#[derive(Clone, Default)]
pub struct InstrumentRegistry {
    instruments: BTreeMap<String, Arc<dyn Instrument>>,
}

impl InstrumentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled instrument in the configuration.
    pub fn from_config(config: &LabConfig) -> AppResult<Self> {
        let mut registry = Self::new();
        for def in config.enabled_instruments() {
            registry.register(build_instrument(def)?)?;
        }
        info!(count = registry.len(), "Instrument registry built");
        Ok(registry)
    }

    /// Add an instrument. Ids must be unique.
    pub fn register(&mut self, instrument: Arc<dyn Instrument>) -> AppResult<()> {
        let id = instrument.id().to_string();
        if self.instruments.contains_key(&id) {
            return Err(DaqError::Configuration(format!(
                "Duplicate instrument ID: {id}"
            )));
        }
        self.instruments.insert(id, instrument);
        Ok(())
    }

    /// Look up an instrument.
    pub fn get(&self, id: &str) -> AppResult<Arc<dyn Instrument>> {
        self.instruments
            .get(id)
            .cloned()
            .ok_or_else(|| DaqError::UnknownInstrument(id.to_string()))
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.instruments.keys().cloned().collect()
    }

    /// Iterate over all instruments in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Instrument>> {
        self.instruments.values()
    }

    /// Number of instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// Whether no instruments are registered.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Connect every instrument, stopping at the first failure.
    pub async fn connect_all(&self) -> AppResult<()> {
        for (id, instrument) in &self.instruments {
            instrument
                .connect()
                .await
                .map_err(|e| DaqError::Instrument(format!("{id}: {e:#}")))?;
        }
        Ok(())
    }

    /// Disconnect every instrument, reporting all failures together.
    pub async fn disconnect_all(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for (id, instrument) in &self.instruments {
            if let Err(e) = instrument.disconnect().await {
                warn!(instrument = %id, error = %e, "Disconnect failed");
                errors.push(DaqError::Instrument(format!("{id}: {e:#}")));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Cached parameter values of every instrument.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, ParameterValue>> {
        let mut snapshot = BTreeMap::new();
        for (id, instrument) in &self.instruments {
            snapshot.insert(id.clone(), instrument.snapshot().await);
        }
        snapshot
    }
}

/// Construct the driver named by `def.type`.
pub fn build_instrument(def: &InstrumentDefinition) -> AppResult<Arc<dyn Instrument>> {
    match def.r#type.as_str() {
        "scpi" => Ok(Arc::new(ScpiInstrument::from_definition(def)?)),
        "mock" => Ok(Arc::new(MockInstrument::from_definition(def)?)),
        other => Err(DaqError::Configuration(format!(
            "Instrument '{}' has unknown type '{}'",
            def.id, other
        ))),
    }
}
