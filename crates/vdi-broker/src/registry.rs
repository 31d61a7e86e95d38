//! Desktop registry — ordered name→desktop mapping with selection
//! tracking.
//!
//! Mutated only by `replace_all` / the targeted setters, each under the
//! registry lock; readers take snapshots rather than holding references
//! across a mutation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{BrokerError, BrokerResult};
use crate::types::{ConnectionState, Desktop, DesktopStatus};

#[derive(Default)]
struct RegistryInner {
    /// Server display order.
    order: Vec<String>,
    desktops: HashMap<String, Desktop>,
    selected: Option<String>,
}

/// Ordered collection of the authenticated identity's desktops.
#[derive(Default)]
pub struct DesktopRegistry {
    inner: RwLock<RegistryInner>,
}

impl DesktopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear and repopulate the registry, preserving selection by name.
    ///
    /// Selection rule: `preferred` when present; else the previously
    /// selected name when still present; else the first entry in server
    /// order. Returns the name actually selected.
    pub fn replace_all(
        &self,
        desktops: Vec<Desktop>,
        preferred: &str,
    ) -> Option<String> {
        let mut inner = self.inner.write().unwrap();
        let previous = inner.selected.take();

        inner.order.clear();
        inner.desktops.clear();
        for desktop in desktops {
            if inner.desktops.contains_key(&desktop.name) {
                log::warn!("Duplicate desktop '{}' in broker reply, keeping first", desktop.name);
                continue;
            }
            inner.order.push(desktop.name.clone());
            inner.desktops.insert(desktop.name.clone(), desktop);
        }

        let selected = if !preferred.is_empty() && inner.desktops.contains_key(preferred) {
            Some(preferred.to_string())
        } else if let Some(prev) = previous.filter(|p| inner.desktops.contains_key(p)) {
            Some(prev)
        } else {
            inner.order.first().cloned()
        };

        inner.selected = selected.clone();
        selected
    }

    /// Snapshot of every desktop in server order.
    pub fn snapshot(&self) -> Vec<Desktop> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .filter_map(|name| inner.desktops.get(name).cloned())
            .collect()
    }

    /// Clone of one desktop by name.
    pub fn get(&self, name: &str) -> Option<Desktop> {
        self.inner.read().unwrap().desktops.get(name).cloned()
    }

    /// Currently selected desktop name.
    pub fn selected(&self) -> Option<String> {
        self.inner.read().unwrap().selected.clone()
    }

    /// Select a desktop by name.
    pub fn select(&self, name: &str) -> BrokerResult<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.desktops.contains_key(name) {
            return Err(BrokerError::not_found(format!("No desktop named '{name}'")));
        }
        inner.selected = Some(name.to_string());
        Ok(())
    }

    /// Number of desktops.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Choose a remoting protocol for one desktop. Fails when the
    /// protocol is not in that desktop's supported list.
    pub fn set_selected_protocol(&self, name: &str, protocol: &str) -> BrokerResult<()> {
        let mut inner = self.inner.write().unwrap();
        let desktop = inner
            .desktops
            .get_mut(name)
            .ok_or_else(|| BrokerError::not_found(format!("No desktop named '{name}'")))?;

        if !desktop.protocols.iter().any(|p| p == protocol) {
            return Err(BrokerError::validation(format!(
                "Desktop '{name}' does not support protocol '{protocol}'"
            )));
        }
        desktop.selected_protocol = protocol.to_string();
        Ok(())
    }

    /// Update one desktop's client connection state.
    pub fn set_connection_state(&self, name: &str, state: ConnectionState) {
        let mut inner = self.inner.write().unwrap();
        if let Some(desktop) = inner.desktops.get_mut(name) {
            desktop.connection_state = state;
        }
    }

    /// Update one desktop's server-reported status.
    pub fn set_status(&self, name: &str, status: DesktopStatus) {
        let mut inner = self.inner.write().unwrap();
        if let Some(desktop) = inner.desktops.get_mut(name) {
            desktop.status = status;
        }
    }
}
