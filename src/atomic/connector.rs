use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::AtomicState;
use crate::{
    device::{Connector, ConnectorHandle, CoreProperties, CrtcHandle, DrmDevice, Property, PropertyId},
    error::Error,
};

/// Configuration of a connector
#[derive(Debug)]
pub struct ConnectorState {
    connector: ConnectorHandle,
    crtc: Option<CrtcHandle>,
    // keeps the connector alive while it is driven by a crtc
    binding: Option<Arc<Connector>>,
    driver_values: IndexMap<PropertyId, u64>,
}

impl ConnectorState {
    /// Creates the state of an unbound connector
    pub fn new(connector: ConnectorHandle) -> Self {
        ConnectorState {
            connector,
            crtc: None,
            binding: None,
            driver_values: IndexMap::new(),
        }
    }

    /// Copies the state for modification
    pub fn duplicate(&self) -> Self {
        ConnectorState {
            connector: self.connector,
            crtc: self.crtc,
            binding: self.binding.clone(),
            driver_values: self.driver_values.clone(),
        }
    }

    /// The connector this state belongs to
    pub fn connector(&self) -> ConnectorHandle {
        self.connector
    }

    /// The crtc driving the connector
    pub fn crtc(&self) -> Option<CrtcHandle> {
        self.crtc
    }

    /// Value of a driver property stored in this state
    pub fn driver_value(&self, property: PropertyId) -> Option<u64> {
        self.driver_values.get(&property).copied()
    }

    /// Stores the value of a driver property
    pub fn set_driver_value(&mut self, property: PropertyId, value: u64) {
        self.driver_values.insert(property, value);
    }

    pub(crate) fn bind(&mut self, crtc: Option<CrtcHandle>, connector: Option<Arc<Connector>>) {
        self.crtc = crtc;
        self.binding = connector;
    }

    pub(crate) fn release_binding(&mut self) {
        self.binding = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorProperty {
    CrtcId,
    Dpms,
}

impl ConnectorProperty {
    pub(crate) fn resolve(core: &CoreProperties, id: PropertyId) -> Option<Self> {
        Some(match id {
            id if id == core.crtc_id => ConnectorProperty::CrtcId,
            id if id == core.dpms => ConnectorProperty::Dpms,
            _ => return None,
        })
    }
}

impl AtomicState {
    /// Sets a property on the state of a connector, acquiring the state if needed.
    ///
    /// `DPMS` is read-only in atomic requests and fails with [`Error::Unsupported`].
    pub fn set_connector_property(
        &mut self,
        connector: ConnectorHandle,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let dev = self.dev.clone();
        let entry = self.connector_entry(connector)?;

        match ConnectorProperty::resolve(dev.core_properties(), property.id()) {
            Some(ConnectorProperty::CrtcId) => {
                let crtc = match value {
                    0 => None,
                    id => Some(dev.find_crtc(id).ok_or(Error::UnknownReference(id))?.handle()),
                };
                self.set_crtc_for_connector(connector, crtc)
            }
            Some(ConnectorProperty::Dpms) => {
                debug!(connector = connector.id().raw(), "Setting DPMS through an atomic request");
                Err(Error::Unsupported(property.id()))
            }
            None => {
                let conn = entry.connector.clone();
                conn.funcs.set_property(&conn, &mut entry.state, property, value)
            }
        }
    }
}

/// Reads a property from a connector state
pub(crate) fn get_property(
    dev: &DrmDevice,
    connector: &Connector,
    state: &ConnectorState,
    property: &Property,
) -> Result<u64, Error> {
    match ConnectorProperty::resolve(dev.core_properties(), property.id()) {
        Some(ConnectorProperty::CrtcId) => Ok(state.crtc.map_or(0, |crtc| crtc.id().raw() as u64)),
        Some(ConnectorProperty::Dpms) => Ok(connector.dpms()),
        None => connector.funcs.get_property(connector, state, property),
    }
}
