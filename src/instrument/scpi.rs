//! Generic table-driven SCPI driver.
//!
//! Every parameter maps to an optional query string and an optional command
//! template. Templates are formatted with `strfmt`, so `SOUR:VOLT {value}`
//! becomes `SOUR:VOLT 1.25`; `{name}` expands to the parameter name. Replies
//! are parsed into the parameter's [`ValueKind`](crate::parameter::ValueKind).
//!
//! The transport sits behind a mutex: one command and its reply always travel
//! together, even when several tasks share the instrument.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::Instrument;
use crate::config::{InstrumentDefinition, ParameterDefinition};
use crate::error::{AppResult, DaqError};
use crate::parameter::{ParameterSpec, ParameterTable, ParameterValue};
use crate::transport::{self, Transport};

/// Command strings for one parameter.
#[derive(Debug, Clone, Default)]
struct Commands {
    get: Option<String>,
    set: Option<String>,
}

/// SCPI instrument driven by a parameter table.
pub struct ScpiInstrument {
    id: String,
    transport: Mutex<Box<dyn Transport>>,
    commands: HashMap<String, Commands>,
    table: RwLock<ParameterTable>,
    init: Vec<String>,
}

impl ScpiInstrument {
    /// Create a driver with an empty parameter table.
    pub fn new(id: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let id = id.into();
        Self {
            table: RwLock::new(ParameterTable::new(id.clone())),
            id,
            transport: Mutex::new(transport),
            commands: HashMap::new(),
            init: Vec::new(),
        }
    }

    /// Build a driver from its configuration entry.
    pub fn from_definition(def: &InstrumentDefinition) -> AppResult<Self> {
        let transport_config = def.transport.as_ref().ok_or_else(|| {
            DaqError::Configuration(format!("Instrument '{}' has no transport", def.id))
        })?;

        let mut instrument = Self::new(def.id.clone(), transport::from_config(transport_config))
            .with_init(def.init.clone());
        for param in &def.parameters {
            instrument.add_parameter(
                spec_from_definition(param),
                param.get.as_deref(),
                param.set.as_deref(),
            )?;
            if let Some(initial) = &param.initial {
                instrument.table.get_mut().store(&param.name, initial.clone());
            }
        }
        Ok(instrument)
    }

    /// Commands written once after connecting (e.g. `*RST`, `SYST:REM`).
    pub fn with_init(mut self, commands: Vec<String>) -> Self {
        self.init = commands;
        self
    }

    /// Register a parameter with its query and command template.
    pub fn add_parameter(
        &mut self,
        spec: ParameterSpec,
        get: Option<&str>,
        set: Option<&str>,
    ) -> AppResult<()> {
        let name = spec.name.clone();
        self.table.get_mut().add(spec)?;
        self.commands.insert(
            name,
            Commands {
                get: get.map(str::to_string),
                set: set.map(str::to_string),
            },
        );
        Ok(())
    }

    fn commands(&self, name: &str) -> Commands {
        self.commands.get(name).cloned().unwrap_or_default()
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut transport = self.transport.lock().await;
        transport
            .query(command)
            .await
            .with_context(|| format!("{}: query '{}' failed", self.id, command))
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport
            .write(command)
            .await
            .with_context(|| format!("{}: write '{}' failed", self.id, command))
    }
}

/// Expand `{value}` and `{name}` in a command template.
pub fn format_command(template: &str, name: &str, value: Option<&ParameterValue>) -> Result<String> {
    let mut vars = HashMap::new();
    vars.insert("name".to_string(), name.to_string());
    if let Some(value) = value {
        vars.insert("value".to_string(), value.to_string());
    }
    strfmt::strfmt(template, &vars)
        .map_err(|e| anyhow::anyhow!("Bad command template '{template}': {e}"))
}

pub(crate) fn spec_from_definition(def: &ParameterDefinition) -> ParameterSpec {
    let mut spec = ParameterSpec::new(def.name.clone(), def.kind).with_access(def.access);
    if def.soft_get {
        spec = spec.soft_get();
    }
    match (def.min, def.max) {
        (Some(min), Some(max)) => spec = spec.with_range(min, max),
        (Some(min), None) => spec = spec.with_range(min, f64::INFINITY),
        (None, Some(max)) => spec = spec.with_range(f64::NEG_INFINITY, max),
        (None, None) if !def.choices.is_empty() => spec = spec.with_choices(def.choices.clone()),
        (None, None) => {}
    }
    if let Some(unit) = &def.unit {
        spec = spec.with_unit(unit.clone());
    }
    if let Some(description) = &def.description {
        spec = spec.with_description(description.clone());
    }
    if let Some(step) = def.max_step {
        spec = spec.with_max_step(step);
    }
    spec
}

#[async_trait]
impl Instrument for ScpiInstrument {
    fn id(&self) -> &str {
        &self.id
    }

    fn driver(&self) -> &str {
        "scpi"
    }

    async fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.table.read().await.specs()
    }

    async fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        info!(instrument = %self.id, transport = %transport.info(), "Connecting");
        transport
            .connect()
            .await
            .with_context(|| format!("{}: connect failed", self.id))?;
        for command in &self.init {
            transport
                .write(command)
                .await
                .with_context(|| format!("{}: init command '{}' failed", self.id, command))?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.disconnect().await?;
        debug!(instrument = %self.id, "Disconnected");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ParameterValue> {
        let (spec, cached) = {
            let table = self.table.read().await;
            (table.spec(name)?.clone(), table.cached(name))
        };
        let commands = self.commands(name);

        if spec.soft_get || !spec.access.can_get() || commands.get.is_none() {
            if let Some(value) = cached {
                return Ok(value);
            }
        }
        let Some(query) = commands.get.filter(|_| spec.access.can_get()) else {
            return Err(DaqError::ParameterWriteOnly(name.to_string()).into());
        };
        let query = format_command(&query, name, None)?;
        let reply = self.query(&query).await?;
        let value = ParameterValue::parse(spec.kind, &reply).map_err(|reason| {
            DaqError::ParameterInvalidValue {
                name: name.to_string(),
                reason,
            }
        })?;

        self.table.write().await.store(name, value.clone());
        debug!(instrument = %self.id, parameter = name, %value, "get");
        Ok(value)
    }

    async fn set(&self, name: &str, value: ParameterValue) -> Result<()> {
        let value = self.table.read().await.validate_set(name, value)?;
        let template = self
            .commands(name)
            .set
            .ok_or_else(|| DaqError::ParameterReadOnly(name.to_string()))?;
        let command = format_command(&template, name, Some(&value))?;

        self.write(&command).await?;
        self.table.write().await.store(name, value.clone());
        debug!(instrument = %self.id, parameter = name, %value, "set");
        Ok(())
    }

    async fn cached(&self, name: &str) -> Option<ParameterValue> {
        self.table.read().await.cached(name)
    }

    async fn snapshot(&self) -> BTreeMap<String, ParameterValue> {
        self.table.read().await.snapshot()
    }

    async fn identify(&self) -> Result<String> {
        self.query("*IDN?").await
    }
}
